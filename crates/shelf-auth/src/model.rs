//! Profiles, authentication outcomes and server wire payloads
//!
//! `UserProfile` is the durable, non-secret record of one identity. Tokens
//! never live inside it; they are stored separately and carried in
//! `Secret` wherever they travel in memory.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};

/// Current time as unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Unix milliseconds `after` from now.
pub fn millis_from_now(after: Duration) -> u64 {
    unix_millis() + after.as_millis() as u64
}

/// Who issued the identity. Tokens obtained through SSO are still issued by
/// the media server, so SSO logins are recorded as `Audiobookshelf` too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    #[default]
    Audiobookshelf,
    Google,
    Apple,
    Microsoft,
    Facebook,
    GitHub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    Light,
    Dark,
    #[default]
    System,
}

/// Per-user playback and display preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub playback_speed: f64,
    pub sleep_timer_minutes: u32,
    pub auto_download: bool,
    pub share_reading_progress: bool,
    pub theme: ThemeMode,
    pub custom_settings: HashMap<String, serde_json::Value>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            playback_speed: 1.0,
            sleep_timer_minutes: 30,
            auto_download: false,
            share_reading_progress: true,
            theme: ThemeMode::System,
            custom_settings: HashMap::new(),
        }
    }
}

/// One authenticated identity known to this client.
///
/// `created_at` and `last_login_at` are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub provider: AuthProvider,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub server_urls: Vec<String>,
    #[serde(default)]
    pub preferences: UserPreferences,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub last_login_at: u64,
}

impl UserProfile {
    /// A freshly logged-in identity reachable at `server_url`.
    pub fn new(id: &str, username: &str, provider: AuthProvider, server_url: &str) -> Self {
        let now = unix_millis();
        Self {
            id: id.to_owned(),
            username: username.to_owned(),
            display_name: username.to_owned(),
            email: String::new(),
            avatar_url: None,
            provider,
            provider_id: id.to_owned(),
            server_urls: vec![server_url.to_owned()],
            preferences: UserPreferences::default(),
            created_at: now,
            last_login_at: now,
        }
    }

    /// Stamp a new login, remembering `server_url` if this identity has not
    /// been reached through it before.
    pub fn record_login(&mut self, server_url: &str) {
        self.last_login_at = unix_millis();
        if !self.server_urls.iter().any(|u| u == server_url) {
            self.server_urls.push(server_url.to_owned());
        }
    }

    /// Server URL API calls should target.
    pub fn primary_server_url(&self) -> Option<&str> {
        self.server_urls.first().map(String::as_str)
    }
}

/// Outcome of a login or SSO attempt.
///
/// A successful result always carries both the profile and the token; the
/// constructors are the only way to build one.
#[derive(Debug, Clone)]
pub struct AuthenticationResult {
    success: bool,
    user: Option<UserProfile>,
    access_token: Option<Secret<String>>,
    expires_at: Option<u64>,
    error_message: Option<String>,
}

impl AuthenticationResult {
    pub fn success(user: UserProfile, access_token: Secret<String>, expires_at: u64) -> Self {
        Self {
            success: true,
            user: Some(user),
            access_token: Some(access_token),
            expires_at: Some(expires_at),
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            user: None,
            access_token: None,
            expires_at: None,
            error_message: Some(message.into()),
        }
    }

    /// Failure-shaped result broadcast when the current user signs out.
    pub fn signed_out() -> Self {
        Self {
            success: false,
            user: None,
            access_token: None,
            expires_at: None,
            error_message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    pub fn access_token(&self) -> Option<&Secret<String>> {
        self.access_token.as_ref()
    }

    /// Advisory expiry, unix milliseconds.
    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Profile, token and expiry of a successful result.
    pub fn into_parts(self) -> Option<(UserProfile, Secret<String>, u64)> {
        match (self.success, self.user, self.access_token, self.expires_at) {
            (true, Some(user), Some(token), Some(expires_at)) => Some((user, token, expires_at)),
            _ => None,
        }
    }
}

/// `POST /login` request body.
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// User object embedded in login and token-exchange responses, and returned
/// by `/api/me`.
#[derive(Clone, Deserialize)]
pub struct ServerUser {
    pub id: String,
    pub username: String,
    #[serde(rename = "type", default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl fmt::Debug for ServerUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerUser")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("user_type", &self.user_type)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Login-style payload: `{user: {id, username, token, ..}, userDefaultLibraryId, serverSettings, ..}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: Option<ServerUser>,
    #[serde(default)]
    pub user_default_library_id: Option<String>,
    #[serde(default)]
    pub server_settings: Option<serde_json::Value>,
}

impl LoginResponse {
    /// The embedded user and its token, if the token is present and non-empty.
    pub fn authenticated_user(&self) -> Option<(&ServerUser, &str)> {
        let user = self.user.as_ref()?;
        let token = user.token.as_deref().filter(|t| !t.trim().is_empty())?;
        Some((user, token))
    }
}

/// Bare OAuth token payload returned by some server versions.
#[derive(Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Authorization-code exchange request body.
#[derive(Serialize)]
pub struct TokenExchangeRequest<'a> {
    pub grant_type: &'a str,
    pub client_id: &'a str,
    pub code: &'a str,
    pub redirect_uri: &'a str,
    pub code_verifier: &'a str,
}
