//! Loopback user-agent for the SSO flow
//!
//! Binds a one-shot HTTP listener on the configured address, opens the
//! authorization URL in the system browser, and resolves with the query
//! parameters of the first request to the redirect path. Redirect URIs
//! that are not plain `http://` cannot be served here and are reported as
//! unsupported.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use shelf_auth::{UserAgent, UserAgentOutcome};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Saga</title></head>
<body style="font-family: system-ui; text-align: center; padding-top: 80px;">
<h2>Sign-in received</h2>
<p>You can close this tab and return to the terminal.</p>
</body>
</html>"#;

/// How long the listener may keep serving after the callback arrived.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<HashMap<String, String>>>>>;

pub struct LoopbackUserAgent {
    listen_addr: SocketAddr,
    open_browser: bool,
}

impl LoopbackUserAgent {
    pub fn new(listen_addr: SocketAddr, open_browser: bool) -> Self {
        Self {
            listen_addr,
            open_browser,
        }
    }

    async fn run(&self, authorization_url: &str, callback_prefix: &str) -> UserAgentOutcome {
        let Some(path) = callback_path(callback_prefix) else {
            return UserAgentOutcome::Unsupported(format!(
                "redirect URI {callback_prefix} is not an http:// loopback address"
            ));
        };

        let listener = match TcpListener::bind(self.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                return UserAgentOutcome::Unsupported(format!(
                    "cannot listen on {}: {e}",
                    self.listen_addr
                ));
            }
        };

        let (tx, rx) = oneshot::channel();
        let app = callback_router(&path, Arc::new(Mutex::new(Some(tx))));
        let shutdown = CancellationToken::new();
        let server = ServerTask(tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "callback listener failed");
                }
            }
        }));

        eprintln!("Open this URL in your browser to sign in:\n\n  {authorization_url}\n");
        if self.open_browser {
            if let Err(e) = open::that(authorization_url) {
                warn!(error = %e, "could not open system browser");
            }
        }
        info!(listen_addr = %self.listen_addr, path, "waiting for SSO callback");

        let outcome = match rx.await {
            Ok(params) => UserAgentOutcome::Callback(params),
            Err(_) => UserAgentOutcome::Cancelled,
        };

        shutdown.cancel();
        server.drain().await;
        outcome
    }
}

impl UserAgent for LoopbackUserAgent {
    fn authenticate<'a>(
        &'a self,
        authorization_url: &'a str,
        callback_prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = UserAgentOutcome> + Send + 'a>> {
        Box::pin(self.run(authorization_url, callback_prefix))
    }
}

/// Listener task, aborted if the wait is abandoned (timeout or cancel).
struct ServerTask(JoinHandle<()>);

impl ServerTask {
    async fn drain(mut self) {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut self.0).await.is_err() {
            debug!("callback listener still busy, aborting");
        }
    }
}

impl Drop for ServerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Path component of an `http://host[:port]/path` redirect URI.
pub fn callback_path(redirect_uri: &str) -> Option<String> {
    let rest = redirect_uri.strip_prefix("http://")?;
    let path = match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    };
    match path.split(['?', '#']).next() {
        Some(p) if !p.is_empty() => Some(p.to_owned()),
        _ => Some("/".to_owned()),
    }
}

fn callback_router(path: &str, slot: CallbackSlot) -> Router {
    Router::new()
        .route(path, get(callback_handler))
        .with_state(slot)
}

async fn callback_handler(
    State(slot): State<CallbackSlot>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    match slot.lock().await.take() {
        Some(sender) => {
            debug!(params = params.len(), "SSO callback received");
            let _ = sender.send(params);
        }
        None => debug!("duplicate SSO callback ignored"),
    }
    Html(CALLBACK_PAGE)
}
