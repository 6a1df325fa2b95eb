//! Authentication façade
//!
//! `AuthenticationService` owns the in-memory `MultiUserSession` for one
//! process and is the only writer of session state. Login and SSO never
//! return `Err`: every failure is a failed `AuthenticationResult`. Account
//! management calls (`add_user`, `remove_user`, `logout`,
//! `update_user_profile`) propagate critical vault write failures.
//!
//! The persisted session is restored lazily, once per process, by the first
//! call that needs it.

use std::collections::HashMap;
use std::sync::Arc;

use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use shelf_auth::constants::TOKEN_LIFETIME_ESTIMATE;
use shelf_auth::model::millis_from_now;
use shelf_auth::vault::CredentialVault;
use shelf_auth::{AuthProvider, AuthenticationResult, OAuthFlowCoordinator, UserProfile};
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{AuthEvent, Notifier};
use crate::session::MultiUserSession;
use crate::store::SessionStore;

pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid credentials";

#[derive(Default)]
struct State {
    session: MultiUserSession,
    restored: bool,
}

pub struct AuthenticationService {
    store: SessionStore,
    http: reqwest::Client,
    coordinator: OAuthFlowCoordinator,
    state: RwLock<State>,
    notifier: Notifier,
}

impl AuthenticationService {
    /// `http` should come from `shelf_auth::build_http_client` so every call
    /// carries a bounded timeout.
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        http: reqwest::Client,
        coordinator: OAuthFlowCoordinator,
    ) -> Self {
        Self {
            store: SessionStore::new(vault),
            http,
            coordinator,
            state: RwLock::new(State::default()),
            notifier: Notifier::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.notifier.subscribe()
    }

    /// Password login against `{server_url}/login`.
    ///
    /// Any rejection by the server is reported as "Invalid credentials"
    /// regardless of status code.
    pub async fn login(
        &self,
        server_url: &str,
        username: &str,
        password: &Secret<String>,
    ) -> AuthenticationResult {
        let response =
            match shelf_auth::password_login(&self.http, server_url, username, password).await {
                Ok(response) => response,
                Err(shelf_auth::Error::InvalidCredentials(reason)) => {
                    debug!(server_url, %reason, "password login rejected");
                    return AuthenticationResult::failure(INVALID_CREDENTIALS_MESSAGE);
                }
                Err(e) => {
                    warn!(server_url, error = %e, "password login failed");
                    return AuthenticationResult::failure(format!("Unable to sign in: {e}"));
                }
            };

        let Some((user, token)) = response.authenticated_user() else {
            return AuthenticationResult::failure(INVALID_CREDENTIALS_MESSAGE);
        };
        let profile = self
            .merge_profile(&user.id, &user.username, server_url)
            .await;
        self.establish(
            profile,
            Secret::new(token.to_owned()),
            server_url,
            millis_from_now(TOKEN_LIFETIME_ESTIMATE),
        )
        .await
    }

    /// OpenID login through `provider_id`; on success the identity becomes
    /// current exactly as with [`login`](Self::login).
    pub async fn login_with_sso(
        &self,
        server_url: &str,
        provider_id: &str,
    ) -> AuthenticationResult {
        self.login_with_sso_cancellable(server_url, provider_id, CancellationToken::new())
            .await
    }

    pub async fn login_with_sso_cancellable(
        &self,
        server_url: &str,
        provider_id: &str,
        cancel: CancellationToken,
    ) -> AuthenticationResult {
        let result = self
            .coordinator
            .start_flow_with_cancel(server_url, provider_id, cancel)
            .await;
        self.finish_sso(result).await
    }

    /// Complete an SSO attempt whose callback arrived out of band.
    pub async fn complete_sso_callback(
        &self,
        callback_params: &HashMap<String, String>,
    ) -> AuthenticationResult {
        let result = self.coordinator.verify_and_exchange(callback_params).await;
        self.finish_sso(result).await
    }

    async fn finish_sso(&self, result: AuthenticationResult) -> AuthenticationResult {
        if !result.is_success() {
            return result;
        }
        let Some((user, token, expires_at)) = result.into_parts() else {
            return AuthenticationResult::failure("SSO returned an incomplete result");
        };
        let Some(server_url) = user.primary_server_url().map(str::to_owned) else {
            return AuthenticationResult::failure("SSO result carried no server URL");
        };
        let profile = self
            .merge_profile(&user.id, &user.username, &server_url)
            .await;
        self.establish(profile, token, &server_url, expires_at).await
    }

    /// Reuse the stored profile for a returning identity so preferences and
    /// known server URLs survive re-login.
    async fn merge_profile(&self, user_id: &str, username: &str, server_url: &str) -> UserProfile {
        match self.store.load_profile(user_id).await {
            Some(mut existing) => {
                existing.username = username.to_owned();
                existing.record_login(server_url);
                existing
            }
            None => UserProfile::new(user_id, username, AuthProvider::Audiobookshelf, server_url),
        }
    }

    /// Persist a fresh login, make it current and notify.
    async fn establish(
        &self,
        profile: UserProfile,
        token: Secret<String>,
        server_url: &str,
        expires_at: u64,
    ) -> AuthenticationResult {
        if let Err(e) = self.persist_login(&profile, &token, server_url).await {
            warn!(user_id = %profile.id, error = %e, "failed to persist login");
            return AuthenticationResult::failure(format!("Failed to save session: {e}"));
        }

        {
            let mut state = self.state.write().await;
            state.restored = true;
            state.session.set_current(profile.clone(), Some(token.clone()));
        }
        self.store.mark_current(&profile.id).await;

        info!(user_id = %profile.id, server_url, "signed in");
        let result = AuthenticationResult::success(profile, token, expires_at);
        self.notifier
            .emit(AuthEvent::AuthenticationChanged(result.clone()));
        result
    }

    async fn persist_login(
        &self,
        profile: &UserProfile,
        token: &Secret<String>,
        server_url: &str,
    ) -> Result<()> {
        self.store.add_user(profile).await?;
        self.store
            .save_credentials(&profile.id, token, server_url)
            .await
    }

    /// Register a profile. Adding an id twice keeps a single entry.
    pub async fn add_user(&self, profile: UserProfile) -> Result<()> {
        self.ensure_restored().await;
        if self.store.add_user(&profile).await? {
            info!(user_id = %profile.id, "user added");
        }
        self.state.write().await.session.upsert_available(profile);
        Ok(())
    }

    /// Make a known user current. Other users' tokens are untouched.
    pub async fn switch_user(&self, user_id: &str) -> bool {
        self.ensure_restored().await;

        let (cached_profile, cached_token) = {
            let state = self.state.read().await;
            (
                state.session.find(user_id).cloned(),
                state.session.user_tokens.get(user_id).cloned(),
            )
        };

        let profile = match cached_profile {
            Some(profile) => profile,
            None => {
                let known = self.store.user_ids().await.iter().any(|id| id == user_id);
                match self.store.load_profile(user_id).await.filter(|_| known) {
                    Some(profile) => profile,
                    None => {
                        warn!(user_id, "switch requested for unknown user");
                        return false;
                    }
                }
            }
        };
        let token = match cached_token {
            Some(token) => Some(token),
            None => self.store.load_token(user_id).await,
        };

        self.state
            .write()
            .await
            .session
            .set_current(profile.clone(), token);
        self.store.mark_current(user_id).await;

        info!(user_id, "switched user");
        self.notifier.emit(AuthEvent::UserSwitched(profile));
        true
    }

    /// Forget a user and its stored records. Removing the current user
    /// signs out. Returns whether the user was known.
    pub async fn remove_user(&self, user_id: &str) -> Result<bool> {
        self.ensure_restored().await;
        let listed = match self.store.remove_user(user_id).await {
            Ok(listed) => listed,
            Err(e) => {
                // a partial delete may already have taken the token
                if self.store.load_token(user_id).await.is_none() {
                    self.state.write().await.session.user_tokens.remove(user_id);
                }
                warn!(user_id, error = %e, "failed to remove user");
                return Err(e);
            }
        };

        let (was_known, was_current) = {
            let mut state = self.state.write().await;
            let was_current = state.session.is_current(user_id);
            let was_known = listed || state.session.find(user_id).is_some();
            if was_current {
                state.session.clear_current();
            }
            state.session.remove_available(user_id);
            (was_known, was_current)
        };

        if was_current {
            self.signed_out(user_id).await;
        } else if self.store.current_user_id().await.as_deref() == Some(user_id) {
            self.store.clear_current().await;
        }
        if was_known {
            info!(user_id, "user removed");
        }
        Ok(was_known)
    }

    /// Bearer token of the current user.
    pub async fn get_valid_token(&self) -> Option<Secret<String>> {
        self.ensure_restored().await;

        let (user_id, cached) = {
            let state = self.state.read().await;
            (
                state.session.current_user_id().map(str::to_owned),
                state.session.current_token().cloned(),
            )
        };
        let user_id = user_id?;
        if let Some(token) = cached.filter(|t| !t.is_blank()) {
            return Some(token);
        }

        let token = self.store.load_token(&user_id).await?;
        let mut state = self.state.write().await;
        if state.session.is_current(&user_id) {
            state.session.user_tokens.insert(user_id, token.clone());
        }
        Some(token)
    }

    /// True when the current user has a non-empty token. Expiry is not checked.
    pub async fn is_authenticated(&self) -> bool {
        self.get_valid_token()
            .await
            .is_some_and(|token| !token.is_blank())
    }

    /// Sign out the current user. The profile stays registered; only its
    /// token is deleted.
    pub async fn logout(&self) -> Result<()> {
        self.ensure_restored().await;

        let current = self
            .state
            .read()
            .await
            .session
            .current_user_id()
            .map(str::to_owned);
        let Some(user_id) = current else {
            debug!("logout with no current user");
            return Ok(());
        };

        self.store.clear_token(&user_id).await?;
        self.state.write().await.session.clear_current();
        self.signed_out(&user_id).await;
        Ok(())
    }

    async fn signed_out(&self, user_id: &str) {
        self.store.clear_current().await;
        info!(user_id, "signed out");
        self.notifier.emit(AuthEvent::AuthenticationChanged(
            AuthenticationResult::signed_out(),
        ));
    }

    pub async fn get_current_user(&self) -> Option<UserProfile> {
        self.ensure_restored().await;
        self.state.read().await.session.current_user.clone()
    }

    /// Every registered profile, read from the vault.
    pub async fn get_available_users(&self) -> Vec<UserProfile> {
        self.ensure_restored().await;
        let users = self.store.available_users().await;
        let mut state = self.state.write().await;
        for user in &users {
            state.session.upsert_available(user.clone());
        }
        users
    }

    pub async fn update_user_profile(&self, profile: UserProfile) -> Result<()> {
        self.ensure_restored().await;
        self.store.update_profile(&profile).await?;
        self.state.write().await.session.refresh_profile(&profile);
        debug!(user_id = %profile.id, "profile updated");
        Ok(())
    }

    /// Snapshot of the in-memory session.
    pub async fn get_current_session(&self) -> MultiUserSession {
        self.ensure_restored().await;
        self.state.read().await.session.clone()
    }

    /// Server the current user last signed in to.
    pub async fn current_server_url(&self) -> Option<String> {
        let user = self.get_current_user().await?;
        match self.store.load_server(&user.id).await {
            Some(url) => Some(url),
            None => user.primary_server_url().map(str::to_owned),
        }
    }

    /// Advisory only: a token is considered valid when it is non-empty.
    pub fn validate_token(&self, token: &str) -> bool {
        !token.trim().is_empty()
    }

    /// Insert `Authorization: Bearer <token>` for the current user. Returns
    /// false, leaving `headers` untouched, when nobody is signed in.
    pub async fn authorize(&self, headers: &mut HeaderMap) -> bool {
        let Some(token) = self.get_valid_token().await else {
            return false;
        };
        match HeaderValue::from_str(&format!("Bearer {}", token.expose())) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                true
            }
            Err(_) => {
                warn!("stored token is not a valid header value");
                false
            }
        }
    }

    async fn ensure_restored(&self) {
        if self.state.read().await.restored {
            return;
        }
        let mut state = self.state.write().await;
        if state.restored {
            return;
        }
        state.restored = true;

        for user in self.store.available_users().await {
            state.session.upsert_available(user);
        }

        let Some(user_id) = self.store.current_user_id().await else {
            debug!("no persisted session");
            return;
        };
        let Some(profile) = state.session.find(&user_id).cloned() else {
            warn!(user_id, "persisted current user is not a known profile");
            return;
        };
        match self.store.load_token(&user_id).await {
            Some(token) => {
                state.session.set_current(profile, Some(token));
                info!(user_id, "restored session");
            }
            None => debug!(user_id, "persisted current user has no token"),
        }
    }
}
