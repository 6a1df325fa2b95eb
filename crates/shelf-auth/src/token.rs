//! Authorization-code exchange
//!
//! POSTs the code and PKCE verifier to `{server}/auth/openid/callback`.
//! Server versions answer with one of two bodies:
//! 1. a login-style payload with a nested `user.token` (preferred)
//! 2. a bare OAuth payload with `access_token`
//!
//! Parsing is an explicit tagged attempt: shape 1 first, shape 2 only if
//! shape 1 yields no user/token, otherwise the exchange fails.

use common::Secret;
use tracing::{debug, warn};

use crate::constants::{PLACEHOLDER_USERNAME, TOKEN_EXCHANGE_PATH};
use crate::error::{Error, Result};
use crate::http::endpoint;
use crate::model::{LoginResponse, OAuthTokenResponse, TokenExchangeRequest};

/// Which response shape produced the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `{user: {id, username, token}}`
    LoginPayload,
    /// `{access_token, token_type, ..}`; identity not yet known
    BareOAuth,
}

/// Server-issued token plus whatever identity the response revealed.
#[derive(Debug, Clone)]
pub struct ExchangedToken {
    pub user_id: String,
    pub username: String,
    pub token: Secret<String>,
    pub source: TokenSource,
    pub default_library_id: Option<String>,
}

impl ExchangedToken {
    /// True when the identity is a placeholder awaiting a profile fetch.
    pub fn needs_profile(&self) -> bool {
        self.source == TokenSource::BareOAuth
    }
}

/// Client for the server's code-exchange endpoint.
#[derive(Clone)]
pub struct TokenExchangeClient {
    http: reqwest::Client,
    client_id: String,
}

impl TokenExchangeClient {
    pub fn new(http: reqwest::Client, client_id: impl Into<String>) -> Self {
        Self {
            http,
            client_id: client_id.into(),
        }
    }

    /// HTTP client shared with follow-up calls (profile fetch).
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Trade an authorization code for a server-issued token.
    ///
    /// Non-2xx status, transport errors and bodies matching neither shape
    /// are all hard failures.
    pub async fn exchange(
        &self,
        server_url: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &Secret<String>,
    ) -> Result<ExchangedToken> {
        let body = TokenExchangeRequest {
            grant_type: "authorization_code",
            client_id: &self.client_id,
            code,
            redirect_uri,
            code_verifier: code_verifier.expose(),
        };

        let response = self
            .http
            .post(endpoint(server_url, TOKEN_EXCHANGE_PATH))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::TokenExchange(format!(
                "exchange endpoint returned {status}: {body}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::TokenExchange(format!("reading exchange response: {e}")))?;

        parse_exchange_response(&text)
    }
}

/// Interpret an exchange response body.
pub fn parse_exchange_response(body: &str) -> Result<ExchangedToken> {
    match serde_json::from_str::<LoginResponse>(body) {
        Ok(login) => {
            if let Some((user, token)) = login.authenticated_user() {
                debug!(user_id = %user.id, "exchange returned login payload");
                return Ok(ExchangedToken {
                    user_id: user.id.clone(),
                    username: user.username.clone(),
                    token: Secret::new(token.to_owned()),
                    source: TokenSource::LoginPayload,
                    default_library_id: login.user_default_library_id.clone(),
                });
            }
        }
        Err(e) => debug!(error = %e, "exchange body is not a login payload"),
    }

    match serde_json::from_str::<OAuthTokenResponse>(body) {
        Ok(oauth) if !oauth.access_token.trim().is_empty() => {
            let token_type = oauth.token_type.as_deref().unwrap_or("bearer");
            if !token_type.eq_ignore_ascii_case("bearer") {
                warn!(token_type, "exchange returned non-bearer token type");
            }
            debug!("exchange returned bare OAuth token");
            Ok(ExchangedToken {
                user_id: PLACEHOLDER_USERNAME.to_owned(),
                username: PLACEHOLDER_USERNAME.to_owned(),
                token: Secret::new(oauth.access_token),
                source: TokenSource::BareOAuth,
                default_library_id: None,
            })
        }
        Ok(_) => Err(Error::TokenExchange(
            "exchange response carried an empty access_token".into(),
        )),
        Err(e) => Err(Error::TokenExchange(format!(
            "exchange response matched neither login nor OAuth shape: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::post;
    use tokio::net::TcpListener;

    async fn serve(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client() -> TokenExchangeClient {
        TokenExchangeClient::new(reqwest::Client::new(), "saga-mobile")
    }

    #[test]
    fn login_shape_is_preferred() {
        let body = r#"{"user":{"id":"u2","username":"oauth-user","token":"tokXYZ"},"userDefaultLibraryId":"lib9","access_token":"ignored"}"#;
        let token = parse_exchange_response(body).unwrap();
        assert_eq!(token.source, TokenSource::LoginPayload);
        assert_eq!(token.user_id, "u2");
        assert_eq!(token.token.expose(), "tokXYZ");
        assert_eq!(token.default_library_id.as_deref(), Some("lib9"));
        assert!(!token.needs_profile());
    }

    #[test]
    fn bare_oauth_shape_is_fallback() {
        let body = r#"{"access_token":"at_1","token_type":"Bearer","expires_in":3600}"#;
        let token = parse_exchange_response(body).unwrap();
        assert_eq!(token.source, TokenSource::BareOAuth);
        assert_eq!(token.username, PLACEHOLDER_USERNAME);
        assert_eq!(token.token.expose(), "at_1");
        assert!(token.needs_profile());
    }

    #[test]
    fn login_shape_without_token_falls_back_to_oauth_shape() {
        let body = r#"{"user":{"id":"u2","username":"x","token":""},"access_token":"at_2"}"#;
        let token = parse_exchange_response(body).unwrap();
        assert_eq!(token.source, TokenSource::BareOAuth);
        assert_eq!(token.token.expose(), "at_2");
    }

    #[test]
    fn neither_shape_fails() {
        assert!(matches!(
            parse_exchange_response(r#"{"message":"ok"}"#),
            Err(Error::TokenExchange(_))
        ));
        assert!(parse_exchange_response("not json").is_err());
        assert!(parse_exchange_response(r#"{"access_token":"  "}"#).is_err());
    }

    #[tokio::test]
    async fn exchange_posts_wire_body() {
        let app = axum::Router::new().route(
            "/auth/openid/callback",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["grant_type"], "authorization_code");
                assert_eq!(body["client_id"], "saga-mobile");
                assert_eq!(body["code"], "abc");
                assert_eq!(body["redirect_uri"], "audiobookshelf://oauth");
                assert_eq!(body["code_verifier"], "verifier-1");
                Json(serde_json::json!({
                    "user": {"id": "u2", "username": "oauth-user", "token": "tokXYZ"}
                }))
            }),
        );
        let server = serve(app).await;

        let token = client()
            .exchange(
                &server,
                "abc",
                "audiobookshelf://oauth",
                &Secret::from("verifier-1"),
            )
            .await
            .unwrap();
        assert_eq!(token.user_id, "u2");
        assert_eq!(token.token.expose(), "tokXYZ");
    }

    #[tokio::test]
    async fn exchange_rejects_non_success_status() {
        let app = axum::Router::new().route(
            "/auth/openid/callback",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"user": {"id": "u", "username": "u", "token": "t"}})),
                )
            }),
        );
        let server = serve(app).await;

        let result = client()
            .exchange(&server, "abc", "audiobookshelf://oauth", &Secret::from("v"))
            .await;
        assert!(matches!(result, Err(Error::TokenExchange(msg)) if msg.contains("400")));
    }

    #[tokio::test]
    async fn exchange_reports_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = client()
            .exchange(
                &format!("http://{addr}"),
                "abc",
                "audiobookshelf://oauth",
                &Secret::from("v"),
            )
            .await;
        assert!(matches!(result, Err(Error::Http(_))));
    }
}
