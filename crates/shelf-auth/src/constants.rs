//! Audiobookshelf authentication constants
//!
//! Endpoint paths are relative to the user-supplied server base URL. The
//! client identifier and redirect URI identify this public client; they are
//! not secrets and may be overridden through configuration.

use std::time::Duration;

/// Client identifier sent with the authorization-code exchange
pub const DEFAULT_CLIENT_ID: &str = "saga-mobile";

/// App-scheme redirect URI registered with the server for mobile clients
pub const DEFAULT_REDIRECT_URI: &str = "audiobookshelf://oauth";

/// Username/password login endpoint
pub const LOGIN_PATH: &str = "/login";

/// OpenID authorization endpoint (opened in the user's browser)
pub const AUTHORIZE_PATH: &str = "/auth/openid";

/// Authorization-code exchange endpoint
pub const TOKEN_EXCHANGE_PATH: &str = "/auth/openid/callback";

/// Authenticated profile endpoint, used to resolve bare OAuth tokens
pub const CURRENT_USER_PATH: &str = "/api/me";

/// Upper bound on how long the browser step of an SSO attempt may take
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default per-request HTTP timeout
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Allowed range for the per-request HTTP timeout
pub const MIN_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Advisory token lifetime. The server reports no expiry and offers no
/// refresh, so this is attached to results but never enforced.
pub const TOKEN_LIFETIME_ESTIMATE: Duration = Duration::from_secs(24 * 60 * 60);

/// Username used when the exchange returns only a bare OAuth token and the
/// follow-up profile fetch fails
pub const PLACEHOLDER_USERNAME: &str = "oauth-user";
