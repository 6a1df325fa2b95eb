//! OpenID authorization-code + PKCE round trip
//!
//! One attempt runs:
//! 1. generate `state` and a PKCE pair, persist them in the vault
//! 2. hand the authorization URL to a [`UserAgent`] and wait for the
//!    callback, bounded by the flow timeout and an optional cancel token
//! 3. verify the returned `state` against the stored one (fail closed)
//! 4. exchange the code, resolving the identity if the server returned a
//!    bare OAuth token
//!
//! The exchange record lives in a single vault slot. A new attempt
//! overwrites the previous one, and every exit path of an attempt deletes
//! it, so only one SSO attempt can be in flight at a time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_REDIRECT_URI, FLOW_TIMEOUT, TOKEN_LIFETIME_ESTIMATE};
use crate::error::Result;
use crate::login::fetch_current_user;
use crate::model::{AuthProvider, AuthenticationResult, UserProfile, millis_from_now};
use crate::pkce;
use crate::token::TokenExchangeClient;
use crate::vault::{CredentialVault, keys};

pub const TIMEOUT_MESSAGE: &str = "Authentication timed out. Please try again.";
pub const CANCELLED_MESSAGE: &str = "Authentication was cancelled by user";
pub const STATE_MISMATCH_MESSAGE: &str = "Invalid state parameter - security check failed";
pub const MISSING_CODE_MESSAGE: &str = "No authorization code received from SSO provider";

/// What the external browser step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgentOutcome {
    /// Query/fragment parameters of the callback URI
    Callback(HashMap<String, String>),
    Cancelled,
    TimedOut,
    /// The platform cannot run a browser flow
    Unsupported(String),
}

/// External user-agent (system browser, web view, loopback listener).
///
/// Opens `authorization_url` and resolves once a URI starting with
/// `callback_prefix` is observed, or the user gives up.
pub trait UserAgent: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        authorization_url: &'a str,
        callback_prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = UserAgentOutcome> + Send + 'a>>;
}

/// Progress of one flow attempt.
///
/// Transitions:
/// - Idle/Succeeded/Failed → Initiated (new attempt)
/// - Initiated → AwaitingCallback (browser launched)
/// - Idle/AwaitingCallback → Verifying (callback delivered)
/// - Verifying → Exchanging (state verified, code present)
/// - Exchanging → Succeeded (token issued)
/// - any → Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Initiated,
    AwaitingCallback,
    Verifying,
    Exchanging,
    Succeeded,
    Failed,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Succeeded | FlowState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    Start,
    Launched,
    CallbackReceived,
    Verified,
    TokenIssued,
    Fail,
}

/// Pure transition function. Unexpected events land in `Failed`.
pub fn advance(state: FlowState, event: FlowEvent) -> FlowState {
    use FlowEvent as E;
    use FlowState as S;
    match (state, event) {
        (S::Idle | S::Succeeded | S::Failed, E::Start) => S::Initiated,
        (S::Initiated, E::Launched) => S::AwaitingCallback,
        (S::Idle | S::AwaitingCallback, E::CallbackReceived) => S::Verifying,
        (S::Verifying, E::Verified) => S::Exchanging,
        (S::Exchanging, E::TokenIssued) => S::Succeeded,
        _ => S::Failed,
    }
}

fn step(state: &mut FlowState, event: FlowEvent) {
    let next = advance(*state, event);
    debug!(from = ?*state, to = ?next, ?event, "oauth flow transition");
    *state = next;
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub redirect_uri: String,
    pub flow_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            redirect_uri: DEFAULT_REDIRECT_URI.to_owned(),
            flow_timeout: FLOW_TIMEOUT,
        }
    }
}

/// In-flight exchange record as read back from the vault.
struct PendingExchange {
    state: Option<String>,
    verifier: Option<Secret<String>>,
    provider_id: Option<String>,
    server_url: Option<String>,
}

/// Drives SSO attempts from authorization URL to server-issued token.
pub struct OAuthFlowCoordinator {
    vault: Arc<dyn CredentialVault>,
    exchange: TokenExchangeClient,
    user_agent: Arc<dyn UserAgent>,
    config: FlowConfig,
}

impl OAuthFlowCoordinator {
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        exchange: TokenExchangeClient,
        user_agent: Arc<dyn UserAgent>,
        config: FlowConfig,
    ) -> Self {
        Self {
            vault,
            exchange,
            user_agent,
            config,
        }
    }

    pub fn redirect_uri(&self) -> &str {
        &self.config.redirect_uri
    }

    /// Run a full attempt against `server_url` using the OpenID provider
    /// `provider_id`.
    pub async fn start_flow(&self, server_url: &str, provider_id: &str) -> AuthenticationResult {
        self.start_flow_with_cancel(server_url, provider_id, CancellationToken::new())
            .await
    }

    /// As [`start_flow`](Self::start_flow), abandoning the browser wait as
    /// soon as `cancel` fires.
    pub async fn start_flow_with_cancel(
        &self,
        server_url: &str,
        provider_id: &str,
        cancel: CancellationToken,
    ) -> AuthenticationResult {
        let mut state = FlowState::Idle;
        step(&mut state, FlowEvent::Start);

        let state_token = pkce::generate_state();
        let pair = pkce::generate();

        if let Err(e) = self
            .persist_exchange(&state_token, &pair.verifier, provider_id, server_url)
            .await
        {
            warn!(error = %e, "failed to persist OAuth exchange record");
            step(&mut state, FlowEvent::Fail);
            self.clear_exchange().await;
            return AuthenticationResult::failure(format!(
                "SSO authentication failed: unable to store OAuth state ({e})"
            ));
        }

        let url = pkce::build_authorization_url(
            server_url,
            &self.config.redirect_uri,
            &state_token,
            &pair.challenge,
        );
        info!(server_url, provider_id, "starting OpenID flow");
        step(&mut state, FlowEvent::Launched);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => UserAgentOutcome::Cancelled,
            outcome = tokio::time::timeout(
                self.config.flow_timeout,
                self.user_agent.authenticate(&url, &self.config.redirect_uri),
            ) => outcome.unwrap_or(UserAgentOutcome::TimedOut),
        };

        let message = match outcome {
            UserAgentOutcome::Callback(params) => return self.verify_from(state, &params).await,
            UserAgentOutcome::TimedOut => {
                warn!(
                    timeout_secs = self.config.flow_timeout.as_secs(),
                    "OpenID flow timed out"
                );
                TIMEOUT_MESSAGE.to_owned()
            }
            UserAgentOutcome::Cancelled => {
                info!("OpenID flow cancelled");
                CANCELLED_MESSAGE.to_owned()
            }
            UserAgentOutcome::Unsupported(reason) => {
                warn!(%reason, "OpenID flow unsupported");
                format!("SSO authentication is not supported on this device: {reason}")
            }
        };

        step(&mut state, FlowEvent::Fail);
        self.clear_exchange().await;
        AuthenticationResult::failure(message)
    }

    /// Complete an attempt from callback parameters delivered out of band
    /// (e.g. a deep link handled by another component).
    pub async fn verify_and_exchange(
        &self,
        callback_params: &HashMap<String, String>,
    ) -> AuthenticationResult {
        self.verify_from(FlowState::Idle, callback_params).await
    }

    async fn verify_from(
        &self,
        mut state: FlowState,
        params: &HashMap<String, String>,
    ) -> AuthenticationResult {
        step(&mut state, FlowEvent::CallbackReceived);
        let outcome = self.complete(&mut state, params).await;
        self.clear_exchange().await;

        match outcome {
            Ok((profile, token)) => {
                step(&mut state, FlowEvent::TokenIssued);
                info!(user_id = %profile.id, "OpenID flow succeeded");
                AuthenticationResult::success(
                    profile,
                    token,
                    millis_from_now(TOKEN_LIFETIME_ESTIMATE),
                )
            }
            Err(message) => {
                step(&mut state, FlowEvent::Fail);
                AuthenticationResult::failure(message)
            }
        }
    }

    async fn complete(
        &self,
        state: &mut FlowState,
        params: &HashMap<String, String>,
    ) -> std::result::Result<(UserProfile, Secret<String>), String> {
        if let Some(error) = params.get("error") {
            let detail = params
                .get("error_description")
                .map(|d| format!(": {d}"))
                .unwrap_or_default();
            warn!(%error, "authorization server returned an error");
            return Err(format!("SSO provider denied authorization ({error}){detail}"));
        }

        let pending = self.load_exchange().await;

        let Some(stored_state) = pending.state.as_deref() else {
            warn!("callback received with no OAuth flow in progress");
            return Err(STATE_MISMATCH_MESSAGE.to_owned());
        };
        let received_state = params.get("state").map(String::as_str).unwrap_or_default();
        if !states_match(stored_state, received_state) {
            warn!("OAuth state mismatch, rejecting callback");
            return Err(STATE_MISMATCH_MESSAGE.to_owned());
        }

        let Some(code) = params.get("code").filter(|c| !c.trim().is_empty()) else {
            return Err(MISSING_CODE_MESSAGE.to_owned());
        };

        let (Some(verifier), Some(server_url)) = (pending.verifier, pending.server_url) else {
            warn!("OAuth exchange record incomplete");
            return Err(STATE_MISMATCH_MESSAGE.to_owned());
        };
        step(state, FlowEvent::Verified);

        debug!(
            provider_id = pending.provider_id.as_deref().unwrap_or("unknown"),
            "exchanging authorization code"
        );
        let mut exchanged = self
            .exchange
            .exchange(&server_url, code, &self.config.redirect_uri, &verifier)
            .await
            .map_err(|e| {
                warn!(error = %e, "authorization code exchange failed");
                format!("Failed to exchange authorization code for valid token: {e}")
            })?;

        if exchanged.needs_profile() {
            match fetch_current_user(self.exchange.http_client(), &server_url, &exchanged.token)
                .await
            {
                Ok(user) => {
                    exchanged.user_id = user.id;
                    exchanged.username = user.username;
                }
                Err(e) => warn!(
                    error = %e,
                    "could not resolve profile for bare OAuth token, keeping placeholder identity"
                ),
            }
        }

        let profile = UserProfile::new(
            &exchanged.user_id,
            &exchanged.username,
            AuthProvider::Audiobookshelf,
            &server_url,
        );
        Ok((profile, exchanged.token))
    }

    async fn persist_exchange(
        &self,
        state: &str,
        verifier: &Secret<String>,
        provider_id: &str,
        server_url: &str,
    ) -> Result<()> {
        self.vault.set(keys::OAUTH_STATE, state).await?;
        self.vault
            .set(keys::OAUTH_CODE_VERIFIER, verifier.expose())
            .await?;
        self.vault.set(keys::OAUTH_PROVIDER_ID, provider_id).await?;
        self.vault.set(keys::OAUTH_SERVER_URL, server_url).await?;
        Ok(())
    }

    async fn load_exchange(&self) -> PendingExchange {
        PendingExchange {
            state: self.read(keys::OAUTH_STATE).await,
            verifier: self.read(keys::OAUTH_CODE_VERIFIER).await.map(Secret::new),
            provider_id: self.read(keys::OAUTH_PROVIDER_ID).await,
            server_url: self.read(keys::OAUTH_SERVER_URL).await,
        }
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.vault.get(key).await {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(key, error = %e, "vault read failed, treating as absent");
                None
            }
        }
    }

    async fn clear_exchange(&self) {
        for key in [
            keys::OAUTH_STATE,
            keys::OAUTH_CODE_VERIFIER,
            keys::OAUTH_PROVIDER_ID,
            keys::OAUTH_SERVER_URL,
        ] {
            if let Err(e) = self.vault.remove(key).await {
                warn!(key, error = %e, "failed to delete OAuth exchange record");
            }
        }
    }
}

/// Exact match after trimming, with one retry against the percent-decoded
/// received value (some callback transports double-encode).
pub fn states_match(stored: &str, received: &str) -> bool {
    let stored = stored.trim();
    let received = received.trim();
    if stored.is_empty() || received.is_empty() {
        return false;
    }
    if stored == received {
        return true;
    }
    match urlencoding::decode(received) {
        Ok(decoded) => decoded.trim() == stored,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryVault;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// User-agent that reads the stored state back out of the vault and
    /// answers with a scripted callback.
    struct ScriptedAgent {
        vault: Arc<MemoryVault>,
        reply: Reply,
        seen_url: Mutex<Option<String>>,
    }

    enum Reply {
        EchoState { code: &'static str },
        WrongState,
        Outcome(UserAgentOutcome),
        Hang,
    }

    impl UserAgent for ScriptedAgent {
        fn authenticate<'a>(
            &'a self,
            authorization_url: &'a str,
            callback_prefix: &'a str,
        ) -> Pin<Box<dyn Future<Output = UserAgentOutcome> + Send + 'a>> {
            Box::pin(async move {
                assert_eq!(callback_prefix, DEFAULT_REDIRECT_URI);
                *self.seen_url.lock().await = Some(authorization_url.to_owned());
                match &self.reply {
                    Reply::EchoState { code } => {
                        let state = self.vault.get(keys::OAUTH_STATE).await.unwrap().unwrap();
                        UserAgentOutcome::Callback(HashMap::from([
                            ("state".to_owned(), state),
                            ("code".to_owned(), code.to_string()),
                        ]))
                    }
                    Reply::WrongState => UserAgentOutcome::Callback(HashMap::from([
                        ("state".to_owned(), "not-the-state".to_owned()),
                        ("code".to_owned(), "abc".to_owned()),
                    ])),
                    Reply::Outcome(outcome) => outcome.clone(),
                    Reply::Hang => std::future::pending().await,
                }
            })
        }
    }

    async fn serve(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn login_shape_server() -> axum::Router {
        axum::Router::new().route(
            "/auth/openid/callback",
            post(|Json(body): Json<serde_json::Value>| async move {
                if body["code"] != "abc" {
                    return (StatusCode::BAD_REQUEST, Json(serde_json::json!({})));
                }
                (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "user": {"id": "u2", "username": "oauth-user", "token": "tokXYZ"}
                    })),
                )
            }),
        )
    }

    fn coordinator(
        vault: Arc<MemoryVault>,
        reply: Reply,
    ) -> (OAuthFlowCoordinator, Arc<ScriptedAgent>) {
        let agent = Arc::new(ScriptedAgent {
            vault: vault.clone(),
            reply,
            seen_url: Mutex::new(None),
        });
        let coordinator = OAuthFlowCoordinator::new(
            vault,
            TokenExchangeClient::new(reqwest::Client::new(), "saga-mobile"),
            agent.clone(),
            FlowConfig::default(),
        );
        (coordinator, agent)
    }

    async fn assert_record_cleared(vault: &MemoryVault) {
        for key in [
            keys::OAUTH_STATE,
            keys::OAUTH_CODE_VERIFIER,
            keys::OAUTH_PROVIDER_ID,
            keys::OAUTH_SERVER_URL,
        ] {
            assert!(!vault.contains(key).await, "{key} survived the attempt");
        }
    }

    #[test]
    fn transitions_follow_happy_path() {
        let mut state = FlowState::Idle;
        for (event, expected) in [
            (FlowEvent::Start, FlowState::Initiated),
            (FlowEvent::Launched, FlowState::AwaitingCallback),
            (FlowEvent::CallbackReceived, FlowState::Verifying),
            (FlowEvent::Verified, FlowState::Exchanging),
            (FlowEvent::TokenIssued, FlowState::Succeeded),
        ] {
            state = advance(state, event);
            assert_eq!(state, expected);
        }
        assert!(state.is_terminal());
        assert_eq!(advance(state, FlowEvent::Start), FlowState::Initiated);
    }

    #[test]
    fn unexpected_events_fail() {
        assert_eq!(advance(FlowState::Initiated, FlowEvent::Verified), FlowState::Failed);
        assert_eq!(advance(FlowState::Verifying, FlowEvent::TokenIssued), FlowState::Failed);
        assert_eq!(advance(FlowState::Exchanging, FlowEvent::Fail), FlowState::Failed);
        assert!(!FlowState::AwaitingCallback.is_terminal());
    }

    #[test]
    fn state_comparison_trims_and_decodes_once() {
        assert!(states_match("abc-123", "abc-123"));
        assert!(states_match(" abc-123 ", "abc-123\n"));
        assert!(states_match("a b", "a%20b"));
        assert!(!states_match("abc", "abd"));
        assert!(!states_match("abc", ""));
        assert!(!states_match("", ""));
        // decoding happens once only
        assert!(!states_match("a b", "a%2520b"));
    }

    #[tokio::test]
    async fn successful_flow_returns_token_and_clears_record() {
        let server = serve(login_shape_server()).await;
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, agent) = coordinator(vault.clone(), Reply::EchoState { code: "abc" });

        let result = coordinator.start_flow(&server, "google").await;

        assert!(result.is_success(), "{:?}", result.error_message());
        let user = result.user().unwrap();
        assert_eq!(user.id, "u2");
        assert_eq!(user.username, "oauth-user");
        assert_eq!(user.provider, AuthProvider::Audiobookshelf);
        assert_eq!(user.server_urls, vec![server.clone()]);
        assert_eq!(result.access_token().unwrap().expose(), "tokXYZ");
        assert!(result.expires_at().unwrap() > crate::model::unix_millis());
        assert_record_cleared(&vault).await;

        let url = agent.seen_url.lock().await.clone().unwrap();
        assert!(url.starts_with(&format!("{server}/auth/openid?")));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("redirect_uri=audiobookshelf%3A%2F%2Foauth"));
    }

    #[tokio::test]
    async fn state_mismatch_fails_closed() {
        let server = serve(login_shape_server()).await;
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::WrongState);

        let result = coordinator.start_flow(&server, "google").await;

        assert!(!result.is_success());
        assert_eq!(result.error_message(), Some(STATE_MISMATCH_MESSAGE));
        assert_record_cleared(&vault).await;
    }

    #[tokio::test]
    async fn missing_code_fails() {
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::EchoState { code: "" });

        let result = coordinator.start_flow("http://127.0.0.1:1", "google").await;

        assert!(!result.is_success());
        assert_eq!(result.error_message(), Some(MISSING_CODE_MESSAGE));
        assert_record_cleared(&vault).await;
    }

    #[tokio::test]
    async fn exchange_failure_fails_and_clears_record() {
        let server = serve(login_shape_server()).await;
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::EchoState { code: "wrong" });

        let result = coordinator.start_flow(&server, "google").await;

        assert!(!result.is_success());
        assert!(
            result
                .error_message()
                .unwrap()
                .starts_with("Failed to exchange authorization code")
        );
        assert_record_cleared(&vault).await;
    }

    #[tokio::test(start_paused = true)]
    async fn hung_browser_times_out_after_five_minutes() {
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::Hang);

        let started = tokio::time::Instant::now();
        let result = coordinator.start_flow("http://127.0.0.1:1", "google").await;

        assert!(!result.is_success());
        assert!(result.error_message().unwrap().contains("timed out"));
        assert!(started.elapsed() >= FLOW_TIMEOUT);
        assert_record_cleared(&vault).await;
    }

    #[tokio::test]
    async fn agent_reported_outcomes_map_to_messages() {
        for (outcome, needle) in [
            (UserAgentOutcome::TimedOut, "timed out"),
            (UserAgentOutcome::Cancelled, "cancelled"),
            (
                UserAgentOutcome::Unsupported("no browser".into()),
                "not supported",
            ),
        ] {
            let vault = Arc::new(MemoryVault::new());
            let (coordinator, _) = coordinator(vault.clone(), Reply::Outcome(outcome));
            let result = coordinator.start_flow("http://127.0.0.1:1", "google").await;
            assert!(!result.is_success());
            assert!(
                result.error_message().unwrap().contains(needle),
                "expected {needle:?} in {:?}",
                result.error_message()
            );
            assert_record_cleared(&vault).await;
        }
    }

    #[tokio::test]
    async fn external_cancellation_wins_over_hung_browser() {
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::Hang);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = coordinator
            .start_flow_with_cancel("http://127.0.0.1:1", "google", cancel)
            .await;

        assert_eq!(result.error_message(), Some(CANCELLED_MESSAGE));
        assert_record_cleared(&vault).await;
    }

    #[tokio::test]
    async fn provider_error_in_callback_fails() {
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(
            vault.clone(),
            Reply::Outcome(UserAgentOutcome::Callback(HashMap::from([
                ("error".to_owned(), "access_denied".to_owned()),
                ("error_description".to_owned(), "user declined".to_owned()),
            ]))),
        );

        let result = coordinator.start_flow("http://127.0.0.1:1", "google").await;

        let message = result.error_message().unwrap();
        assert!(message.contains("access_denied"));
        assert!(message.contains("user declined"));
        assert_record_cleared(&vault).await;
    }

    #[tokio::test]
    async fn callback_without_pending_flow_is_rejected() {
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::Hang);

        let result = coordinator
            .verify_and_exchange(&HashMap::from([
                ("state".to_owned(), "anything".to_owned()),
                ("code".to_owned(), "abc".to_owned()),
            ]))
            .await;

        assert_eq!(result.error_message(), Some(STATE_MISMATCH_MESSAGE));
    }

    #[tokio::test]
    async fn out_of_band_callback_completes_stored_flow() {
        let server = serve(login_shape_server()).await;
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::Hang);

        coordinator
            .persist_exchange("s-1", &Secret::from("verifier"), "google", &server)
            .await
            .unwrap();

        let result = coordinator
            .verify_and_exchange(&HashMap::from([
                ("state".to_owned(), "s-1".to_owned()),
                ("code".to_owned(), "abc".to_owned()),
            ]))
            .await;

        assert!(result.is_success());
        assert_record_cleared(&vault).await;
    }

    #[tokio::test]
    async fn bare_token_resolves_profile() {
        let app = axum::Router::new()
            .route(
                "/auth/openid/callback",
                post(|| async {
                    Json(serde_json::json!({"access_token": "at_9", "token_type": "Bearer"}))
                }),
            )
            .route(
                "/api/me",
                get(|| async { Json(serde_json::json!({"id": "u9", "username": "dana"})) }),
            );
        let server = serve(app).await;
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::EchoState { code: "abc" });

        let result = coordinator.start_flow(&server, "authentik").await;

        assert!(result.is_success());
        assert_eq!(result.user().unwrap().id, "u9");
        assert_eq!(result.user().unwrap().username, "dana");
        assert_eq!(result.access_token().unwrap().expose(), "at_9");
    }

    #[tokio::test]
    async fn bare_token_keeps_placeholder_when_profile_unavailable() {
        let app = axum::Router::new().route(
            "/auth/openid/callback",
            post(|| async { Json(serde_json::json!({"access_token": "at_9"})) }),
        );
        let server = serve(app).await;
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::EchoState { code: "abc" });

        let result = coordinator.start_flow(&server, "authentik").await;

        assert!(result.is_success());
        assert_eq!(
            result.user().unwrap().username,
            crate::constants::PLACEHOLDER_USERNAME
        );
    }

    #[tokio::test]
    async fn unwritable_vault_fails_before_launch() {
        let vault = Arc::new(MemoryVault::new());
        vault.fail_writes(true);
        let (coordinator, agent) = coordinator(vault.clone(), Reply::Hang);

        let result = coordinator.start_flow("http://127.0.0.1:1", "google").await;

        assert!(!result.is_success());
        assert!(agent.seen_url.lock().await.is_none());
    }

    #[tokio::test]
    async fn new_attempt_overwrites_previous_record() {
        let vault = Arc::new(MemoryVault::new());
        let (coordinator, _) = coordinator(vault.clone(), Reply::Hang);

        coordinator
            .persist_exchange("first", &Secret::from("v1"), "google", "https://a")
            .await
            .unwrap();
        coordinator
            .persist_exchange("second", &Secret::from("v2"), "google", "https://a")
            .await
            .unwrap();

        // the first attempt's callback can no longer verify
        let result = coordinator
            .verify_and_exchange(&HashMap::from([
                ("state".to_owned(), "first".to_owned()),
                ("code".to_owned(), "abc".to_owned()),
            ]))
            .await;
        assert_eq!(result.error_message(), Some(STATE_MISMATCH_MESSAGE));
    }
}
