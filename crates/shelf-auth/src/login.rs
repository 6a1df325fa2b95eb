//! Username/password login and profile lookup
//!
//! Both calls hit the media server directly. Login failures are reported
//! as `InvalidCredentials` without the HTTP status so callers cannot tell
//! an unknown user from a wrong password.

use common::Secret;
use tracing::debug;

use crate::constants::{CURRENT_USER_PATH, LOGIN_PATH};
use crate::error::{Error, Result};
use crate::http::endpoint;
use crate::model::{LoginRequest, LoginResponse, ServerUser};

/// `POST {server}/login` with `{username, password}`.
///
/// Returns the login payload only when it carries a user with a non-empty
/// token; any other answer is `InvalidCredentials`.
pub async fn password_login(
    client: &reqwest::Client,
    server_url: &str,
    username: &str,
    password: &Secret<String>,
) -> Result<LoginResponse> {
    let response = client
        .post(endpoint(server_url, LOGIN_PATH))
        .json(&LoginRequest {
            username,
            password: password.expose(),
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        debug!(%status, "login rejected");
        return Err(Error::InvalidCredentials("login rejected".into()));
    }

    let login = response
        .json::<LoginResponse>()
        .await
        .map_err(|e| Error::InvalidCredentials(format!("unreadable login response: {e}")))?;

    if login.authenticated_user().is_none() {
        return Err(Error::InvalidCredentials(
            "login response carried no token".into(),
        ));
    }
    Ok(login)
}

/// `GET {server}/api/me` with the bearer token, returning the token's owner.
pub async fn fetch_current_user(
    client: &reqwest::Client,
    server_url: &str,
    token: &Secret<String>,
) -> Result<ServerUser> {
    let response = client
        .get(endpoint(server_url, CURRENT_USER_PATH))
        .bearer_auth(token.expose())
        .send()
        .await
        .map_err(|e| Error::Http(format!("profile request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Http(format!("profile endpoint returned {status}")));
    }

    response
        .json::<ServerUser>()
        .await
        .map_err(|e| Error::Serialization(format!("invalid profile response: {e}")))
}
