//! Saga authentication CLI
//!
//! Command-line front end over `shelf-session`:
//! 1. Loads `saga-auth.toml` and opens the file vault
//! 2. Builds the HTTP client, OpenID coordinator and loopback user-agent
//! 3. Runs one command and prints its result to stdout (logs go to stderr)

mod browser;
mod cli;
mod config;
mod error;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use shelf_auth::{
    AuthenticationResult, CredentialVault, FileVault, FlowConfig, OAuthFlowCoordinator,
    TokenExchangeClient,
};
use shelf_session::AuthenticationService;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::browser::LoopbackUserAgent;
use crate::cli::{Command, USAGE};
use crate::config::Config;

/// Time a command gets to wind down after SIGINT/SIGTERM before exiting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr with LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = cli::parse(&args)?;
    if invocation.command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config_path = Config::resolve_path(invocation.config_path.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let vault_path = config.vault_path()?.to_path_buf();
    info!(path = %vault_path.display(), "opening credential vault");
    let vault: Arc<dyn CredentialVault> = Arc::new(
        FileVault::load(vault_path.clone())
            .await
            .with_context(|| format!("failed to open vault {}", vault_path.display()))?,
    );

    let auth = build_service(&config, vault)?;

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let output = tokio::select! {
        output = run(&auth, invocation.command, cancel.clone()) => output,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => Err(anyhow!("interrupted")),
    };
    watcher.abort();

    println!("{}", output?);
    Ok(())
}

fn build_service(
    config: &Config,
    vault: Arc<dyn CredentialVault>,
) -> Result<AuthenticationService> {
    let http = shelf_auth::build_http_client(config.http_timeout())
        .context("failed to build HTTP client")?;
    let agent = Arc::new(LoopbackUserAgent::new(
        config.oauth.callback_listen_addr,
        true,
    ));
    let coordinator = OAuthFlowCoordinator::new(
        vault.clone(),
        TokenExchangeClient::new(http.clone(), config.oauth.client_id.clone()),
        agent,
        FlowConfig {
            redirect_uri: config.oauth.redirect_uri.clone(),
            flow_timeout: config.flow_timeout(),
        },
    );
    Ok(AuthenticationService::new(vault, http, coordinator))
}

/// Execute one command, returning what to print on stdout.
async fn run(
    auth: &AuthenticationService,
    command: Command,
    cancel: CancellationToken,
) -> Result<String> {
    match command {
        Command::Login {
            server_url,
            username,
        } => {
            let password = cli::read_password(
                std::env::var("SAGA_PASSWORD").ok(),
                BufReader::new(tokio::io::stdin()),
            )
            .await?;
            signed_in(auth.login(&server_url, &username, &password).await)
        }
        Command::Sso {
            server_url,
            provider,
        } => signed_in(
            auth.login_with_sso_cancellable(&server_url, &provider, cancel)
                .await,
        ),
        Command::Users => {
            let users = auth.get_available_users().await;
            if users.is_empty() {
                return Ok("no users signed in".to_owned());
            }
            let current = auth.get_current_user().await.map(|u| u.id);
            let lines: Vec<String> = users
                .iter()
                .map(|user| {
                    let marker = if current.as_deref() == Some(user.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    format!(
                        "{marker} {}\t{}\t{}",
                        user.id,
                        user.username,
                        user.primary_server_url().unwrap_or("-")
                    )
                })
                .collect();
            Ok(lines.join("\n"))
        }
        Command::Whoami => {
            let Some(user) = auth.get_current_user().await else {
                bail!("not signed in");
            };
            let server = auth.current_server_url().await.unwrap_or_default();
            Ok(format!("{} ({}) at {server}", user.username, user.id))
        }
        Command::Switch { user_id } => {
            if !auth.switch_user(&user_id).await {
                bail!("unknown user: {user_id}");
            }
            Ok(format!("switched to {user_id}"))
        }
        Command::Remove { user_id } => {
            if !auth.remove_user(&user_id).await? {
                bail!("unknown user: {user_id}");
            }
            Ok(format!("removed {user_id}"))
        }
        Command::Logout => {
            auth.logout().await?;
            Ok("signed out".to_owned())
        }
        Command::Token => match auth.get_valid_token().await {
            Some(token) => Ok(token.expose().clone()),
            None => bail!("not signed in"),
        },
        Command::Help => Ok(USAGE.to_owned()),
    }
}

fn signed_in(result: AuthenticationResult) -> Result<String> {
    match result.user() {
        Some(user) if result.is_success() => {
            Ok(format!("signed in as {} ({})", user.username, user.id))
        }
        _ => bail!(
            "{}",
            result
                .error_message()
                .unwrap_or("authentication failed")
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, cancelling"),
        _ = terminate => info!("received SIGTERM, cancelling"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::routing::post;
    use common::Secret;
    use shelf_auth::MemoryVault;
    use tokio::net::TcpListener;

    async fn mock_server() -> String {
        let app = axum::Router::new().route(
            "/login",
            post(|Json(body): Json<serde_json::Value>| async move {
                let (id, token) = match body["username"].as_str() {
                    Some("alice") => ("u1", "tok123"),
                    _ => ("u2", "tokB"),
                };
                Json(serde_json::json!({
                    "user": {"id": id, "username": body["username"], "token": token}
                }))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let path = dir.path().join("saga-auth.toml");
        std::fs::write(
            &path,
            format!(
                "[vault]\npath = \"{}\"\n[oauth]\ncallback_listen_addr = \"127.0.0.1:0\"\n",
                dir.path().join("vault.json").display()
            ),
        )
        .unwrap();
        Config::load(&path).unwrap()
    }

    fn test_service(dir: &tempfile::TempDir) -> AuthenticationService {
        build_service(&test_config(dir), Arc::new(MemoryVault::new())).unwrap()
    }

    #[tokio::test]
    async fn commands_reflect_session_state() {
        let dir = tempfile::tempdir().unwrap();
        let server = mock_server().await;
        let auth = test_service(&dir);
        let cancel = CancellationToken::new();

        assert_eq!(
            run(&auth, Command::Users, cancel.clone()).await.unwrap(),
            "no users signed in"
        );
        assert!(run(&auth, Command::Whoami, cancel.clone()).await.is_err());
        assert!(run(&auth, Command::Token, cancel.clone()).await.is_err());

        auth.login(&server, "alice", &Secret::from("pw")).await;
        auth.login(&server, "bob", &Secret::from("pw")).await;

        let users = run(&auth, Command::Users, cancel.clone()).await.unwrap();
        assert_eq!(users.lines().count(), 2);
        assert!(users.contains("* u2\tbob"), "got: {users}");

        run(&auth, Command::Switch { user_id: "u1".into() }, cancel.clone())
            .await
            .unwrap();
        let whoami = run(&auth, Command::Whoami, cancel.clone()).await.unwrap();
        assert_eq!(whoami, format!("alice (u1) at {server}"));
        assert_eq!(
            run(&auth, Command::Token, cancel.clone()).await.unwrap(),
            "tok123"
        );

        assert_eq!(
            run(&auth, Command::Logout, cancel.clone()).await.unwrap(),
            "signed out"
        );
        assert!(run(&auth, Command::Token, cancel.clone()).await.is_err());

        run(&auth, Command::Remove { user_id: "u2".into() }, cancel.clone())
            .await
            .unwrap();
        assert!(
            run(&auth, Command::Remove { user_id: "u2".into() }, cancel.clone())
                .await
                .is_err()
        );
        assert!(
            run(&auth, Command::Switch { user_id: "u2".into() }, cancel)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cancelled_sso_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let auth = test_service(&dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run(
            &auth,
            Command::Sso {
                server_url: "http://127.0.0.1:1".into(),
                provider: "google".into(),
            },
            cancel,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cancelled"), "got: {err}");
    }

    #[test]
    fn signed_in_formats_outcome() {
        let user = shelf_auth::UserProfile::new(
            "u1",
            "alice",
            shelf_auth::AuthProvider::Audiobookshelf,
            "https://host",
        );
        let ok = signed_in(AuthenticationResult::success(user, Secret::from("t"), 0)).unwrap();
        assert_eq!(ok, "signed in as alice (u1)");

        let err = signed_in(AuthenticationResult::failure("Invalid credentials")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid credentials");
    }
}
