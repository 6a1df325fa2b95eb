//! Authentication change notifications
//!
//! Delivered over a `tokio::sync::broadcast` channel after the triggering
//! mutation has been persisted. Every subscriber sees every event; ordering
//! relative to other subscribers is unspecified. A subscriber that falls
//! more than `EVENT_CHANNEL_CAPACITY` events behind observes `Lagged`.

use shelf_auth::{AuthenticationResult, UserProfile};
use tokio::sync::broadcast;
use tracing::debug;

pub const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// Sign-in succeeded, or the current user signed out (failure-shaped
    /// result with no message).
    AuthenticationChanged(AuthenticationResult),
    UserSwitched(UserProfile),
}

impl AuthEvent {
    pub fn label(&self) -> &'static str {
        match self {
            AuthEvent::AuthenticationChanged(_) => "authentication_changed",
            AuthEvent::UserSwitched(_) => "user_switched",
        }
    }
}

pub(crate) struct Notifier {
    tx: broadcast::Sender<AuthEvent>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub(crate) fn emit(&self, event: AuthEvent) {
        let label = event.label();
        match self.tx.send(event) {
            Ok(receivers) => debug!(event = label, receivers, "auth event sent"),
            Err(_) => debug!(event = label, "auth event dropped, no subscribers"),
        }
    }
}
