//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Passwords never live in the TOML; they are read at login time from
//! SAGA_PASSWORD or stdin.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shelf_auth::constants::{DEFAULT_CLIENT_ID, MAX_HTTP_TIMEOUT, MIN_HTTP_TIMEOUT};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

/// Credential vault location
#[derive(Debug, Default, Deserialize)]
pub struct VaultConfig {
    pub path: Option<PathBuf>,
}

/// Outbound HTTP settings
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
        }
    }
}

/// OpenID client settings
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Must be registered with the server as an allowed redirect.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_callback_listen_addr")]
    pub callback_listen_addr: SocketAddr,
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            redirect_uri: default_redirect_uri(),
            callback_listen_addr: default_callback_listen_addr(),
            flow_timeout_secs: default_flow_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_owned()
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:8765/oauth".to_owned()
}

fn default_callback_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8765))
}

fn default_flow_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Vault path resolution order:
    /// 1. SAGA_VAULT_PATH env var
    /// 2. `[vault] path` from the file
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(vault_path) = std::env::var("SAGA_VAULT_PATH") {
            if !vault_path.trim().is_empty() {
                config.vault.path = Some(PathBuf::from(vault_path));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.vault.path.is_none() {
            return Err(common::Error::Config(
                "vault.path must be set (or SAGA_VAULT_PATH)".into(),
            ));
        }

        let timeout = Duration::from_secs(self.http.timeout_secs);
        if !(MIN_HTTP_TIMEOUT..=MAX_HTTP_TIMEOUT).contains(&timeout) {
            return Err(common::Error::Config(format!(
                "http.timeout_secs must be between {} and {}, got {}",
                MIN_HTTP_TIMEOUT.as_secs(),
                MAX_HTTP_TIMEOUT.as_secs(),
                self.http.timeout_secs
            )));
        }

        if self.oauth.redirect_uri.trim().is_empty() || !self.oauth.redirect_uri.contains("://") {
            return Err(common::Error::Config(format!(
                "oauth.redirect_uri must be an absolute URI, got: {:?}",
                self.oauth.redirect_uri
            )));
        }

        if self.oauth.flow_timeout_secs == 0 {
            return Err(common::Error::Config(
                "oauth.flow_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn vault_path(&self) -> common::Result<&Path> {
        self.vault
            .path
            .as_deref()
            .ok_or_else(|| common::Error::Config("vault.path is not set".into()))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth.flow_timeout_secs)
    }

    /// Resolve config file path from CLI arg or SAGA_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("SAGA_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("saga-auth.toml")
    }
}
