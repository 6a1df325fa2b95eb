//! HTTP client construction and endpoint joining

use std::time::Duration;

use crate::constants::{MAX_HTTP_TIMEOUT, MIN_HTTP_TIMEOUT};
use crate::error::{Error, Result};

/// Build the shared client. Every request this core issues carries `timeout`,
/// which must lie within 10..=30 seconds.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    if !(MIN_HTTP_TIMEOUT..=MAX_HTTP_TIMEOUT).contains(&timeout) {
        return Err(Error::Http(format!(
            "timeout must be between {}s and {}s, got {}s",
            MIN_HTTP_TIMEOUT.as_secs(),
            MAX_HTTP_TIMEOUT.as_secs(),
            timeout.as_secs()
        )));
    }
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| Error::Http(format!("building HTTP client: {e}")))
}

/// Join a server base URL and an absolute path, tolerating a trailing `/`.
pub fn endpoint(server_url: &str, path: &str) -> String {
    format!("{}{}", server_url.trim_end_matches('/'), path)
}
