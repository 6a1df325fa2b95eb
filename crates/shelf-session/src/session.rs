//! In-memory multi-user session
//!
//! Owned by one `AuthenticationService`. Holds the known profiles, the
//! current one, and a cache of bearer tokens read from the vault.

use std::collections::HashMap;

use common::Secret;
use shelf_auth::UserProfile;

/// Process-lifetime view of who is signed in.
///
/// When `current_user` is set, its id equals `primary_user_id` and it is
/// listed in `available_users`.
#[derive(Debug, Clone, Default)]
pub struct MultiUserSession {
    pub primary_user_id: Option<String>,
    pub available_users: Vec<UserProfile>,
    pub current_user: Option<UserProfile>,
    pub user_tokens: HashMap<String, Secret<String>>,
}

impl MultiUserSession {
    /// Make `profile` current, caching its token when one is known.
    pub fn set_current(&mut self, profile: UserProfile, token: Option<Secret<String>>) {
        self.upsert_available(profile.clone());
        if let Some(token) = token {
            self.user_tokens.insert(profile.id.clone(), token);
        }
        self.primary_user_id = Some(profile.id.clone());
        self.current_user = Some(profile);
    }

    /// Forget the current user and its cached token. Other users' tokens stay.
    pub fn clear_current(&mut self) -> Option<UserProfile> {
        let previous = self.current_user.take();
        if let Some(user) = &previous {
            self.user_tokens.remove(&user.id);
        }
        self.primary_user_id = None;
        previous
    }

    /// Insert `profile`, replacing an existing entry with the same id in place.
    pub fn upsert_available(&mut self, profile: UserProfile) {
        match self.available_users.iter_mut().find(|u| u.id == profile.id) {
            Some(existing) => *existing = profile,
            None => self.available_users.push(profile),
        }
    }

    pub fn remove_available(&mut self, user_id: &str) {
        self.available_users.retain(|u| u.id != user_id);
        self.user_tokens.remove(user_id);
    }

    pub fn find(&self, user_id: &str) -> Option<&UserProfile> {
        self.available_users.iter().find(|u| u.id == user_id)
    }

    pub fn current_user_id(&self) -> Option<&str> {
        self.current_user.as_ref().map(|u| u.id.as_str())
    }

    pub fn is_current(&self, user_id: &str) -> bool {
        self.current_user_id() == Some(user_id)
    }

    pub fn current_token(&self) -> Option<&Secret<String>> {
        self.user_tokens.get(self.current_user_id()?)
    }

    /// Refresh the stored copy of `profile` wherever it appears.
    pub fn refresh_profile(&mut self, profile: &UserProfile) {
        if let Some(existing) = self.available_users.iter_mut().find(|u| u.id == profile.id) {
            *existing = profile.clone();
        }
        if let Some(current) = self.current_user.as_mut().filter(|u| u.id == profile.id) {
            *current = profile.clone();
        }
    }

    /// Whether the current-user invariant holds.
    pub fn is_consistent(&self) -> bool {
        match &self.current_user {
            None => true,
            Some(user) => {
                self.primary_user_id.as_deref() == Some(user.id.as_str())
                    && self.find(&user.id).is_some()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_auth::AuthProvider;

    fn profile(id: &str) -> UserProfile {
        UserProfile::new(id, id, AuthProvider::Audiobookshelf, "https://host")
    }

    #[test]
    fn set_current_keeps_invariant() {
        let mut session = MultiUserSession::default();
        session.set_current(profile("a"), Some(Secret::from("tok-a")));
        session.set_current(profile("b"), Some(Secret::from("tok-b")));

        assert!(session.is_consistent());
        assert_eq!(session.current_user_id(), Some("b"));
        assert_eq!(session.primary_user_id.as_deref(), Some("b"));
        assert_eq!(session.available_users.len(), 2);
        assert_eq!(session.current_token().unwrap().expose(), "tok-b");
        assert_eq!(session.user_tokens["a"].expose(), "tok-a");
    }

    #[test]
    fn clear_current_keeps_other_tokens() {
        let mut session = MultiUserSession::default();
        session.set_current(profile("a"), Some(Secret::from("tok-a")));
        session.set_current(profile("b"), Some(Secret::from("tok-b")));

        let previous = session.clear_current().unwrap();
        assert_eq!(previous.id, "b");
        assert!(session.current_user.is_none());
        assert!(session.primary_user_id.is_none());
        assert!(session.current_token().is_none());
        assert!(session.user_tokens.contains_key("a"));
        assert!(session.is_consistent());
    }

    #[test]
    fn upsert_does_not_duplicate() {
        let mut session = MultiUserSession::default();
        session.upsert_available(profile("a"));
        let mut renamed = profile("a");
        renamed.display_name = "Alice".into();
        session.upsert_available(renamed);

        assert_eq!(session.available_users.len(), 1);
        assert_eq!(session.available_users[0].display_name, "Alice");
    }

    #[test]
    fn refresh_profile_updates_current_copy() {
        let mut session = MultiUserSession::default();
        session.set_current(profile("a"), None);
        let mut updated = profile("a");
        updated.preferences.playback_speed = 1.5;
        session.refresh_profile(&updated);

        assert_eq!(session.current_user.as_ref().unwrap().preferences.playback_speed, 1.5);
        assert_eq!(session.find("a").unwrap().preferences.playback_speed, 1.5);
    }

    #[test]
    fn debug_redacts_tokens() {
        let mut session = MultiUserSession::default();
        session.set_current(profile("a"), Some(Secret::from("tok-a")));
        let debug = format!("{session:?}");
        assert!(!debug.contains("tok-a"), "token leaked: {debug}");
    }
}
