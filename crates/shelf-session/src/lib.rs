//! Multi-user session management for Audiobookshelf clients
//!
//! Builds on `shelf-auth`: several identities (possibly on different
//! servers) can be signed in at once, one of them current. Tokens and
//! profiles live in the injected `CredentialVault`; the in-memory
//! `MultiUserSession` is restored from it lazily.
//!
//! Session lifecycle:
//! 1. `AuthenticationService::login()` / `login_with_sso()` → profile and
//!    token persisted, user becomes current, `AuthenticationChanged` fires
//! 2. `switch_user()` → another known user becomes current, `UserSwitched` fires
//! 3. `get_valid_token()` / `authorize()` → bearer token for API calls
//! 4. `logout()` → current token deleted, profile kept
//! 5. `remove_user()` → every record of the user deleted

pub mod error;
pub mod events;
pub mod service;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use events::AuthEvent;
pub use service::{AuthenticationService, INVALID_CREDENTIALS_MESSAGE};
pub use session::MultiUserSession;
pub use store::SessionStore;
