//! Audiobookshelf authentication library
//!
//! Password login, the OpenID authorization-code + PKCE flow, and the
//! credential vault abstraction the session layer persists through. This
//! crate holds no session state of its own; `shelf-session` builds the
//! multi-user store on top of it.
//!
//! SSO flow:
//! 1. `OAuthFlowCoordinator::start_flow()` generates state + PKCE pair and
//!    stores them under the `oauth_*` vault keys
//! 2. The injected `UserAgent` opens `pkce::build_authorization_url()` and
//!    returns the callback parameters
//! 3. The coordinator verifies `state`, then `TokenExchangeClient::exchange()`
//!    trades the code for a server-issued token
//! 4. Bare OAuth tokens are resolved to a user via `login::fetch_current_user()`
//! 5. The `oauth_*` keys are deleted however the attempt ended

pub mod constants;
pub mod error;
pub mod flow;
pub mod http;
pub mod login;
pub mod model;
pub mod pkce;
pub mod token;
pub mod vault;

pub use constants::*;
pub use error::{Error, Result};
pub use flow::{
    FlowConfig, FlowEvent, FlowState, OAuthFlowCoordinator, UserAgent, UserAgentOutcome, advance,
};
pub use http::build_http_client;
pub use login::{fetch_current_user, password_login};
pub use model::{
    AuthProvider, AuthenticationResult, ThemeMode, UserPreferences, UserProfile, unix_millis,
};
pub use token::{ExchangedToken, TokenExchangeClient, TokenSource};
pub use vault::{CredentialVault, FileVault, MemoryVault};
