//! Persisted multi-user bookkeeping over a `CredentialVault`
//!
//! Layout:
//! - `available_users`: JSON array of known user ids
//! - `user_profile_{id}`: JSON `UserProfile`
//! - `user_token_{id}`: raw bearer token
//! - `user_server_{id}`: server URL of the last login
//! - `current_user_id`: auto-login marker
//!
//! Reads that fail are logged and treated as absent. Writes of profiles,
//! tokens and the id list propagate their error; the current-user marker is
//! best-effort. Edits of the id list are serialized so concurrent changes
//! for different users cannot drop each other.

use std::sync::Arc;

use common::Secret;
use shelf_auth::UserProfile;
use shelf_auth::vault::{CredentialVault, keys};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct SessionStore {
    vault: Arc<dyn CredentialVault>,
    list_lock: Arc<Mutex<()>>,
}

impl SessionStore {
    pub fn new(vault: Arc<dyn CredentialVault>) -> Self {
        Self {
            vault,
            list_lock: Arc::new(Mutex::new(())),
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

    /// Known user ids in insertion order.
    pub async fn user_ids(&self) -> Vec<String> {
        let Some(json) = self.read(keys::AVAILABLE_USERS).await else {
            return Vec::new();
        };
        serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable user list, treating as empty");
            Vec::new()
        })
    }

    async fn save_user_ids(&self, ids: &[String]) -> Result<()> {
        let json = serde_json::to_string(ids)
            .map_err(|e| Error::Serialization(format!("user list: {e}")))?;
        self.vault.set(keys::AVAILABLE_USERS, &json).await?;
        Ok(())
    }

    pub async fn load_profile(&self, user_id: &str) -> Option<UserProfile> {
        let json = self.read(&keys::user_profile(user_id)).await?;
        match serde_json::from_str(&json) {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(user_id, error = %e, "unreadable profile record, skipping");
                None
            }
        }
    }

    pub async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        let json = serde_json::to_string(profile)
            .map_err(|e| Error::Serialization(format!("profile {}: {e}", profile.id)))?;
        self.vault.set(&keys::user_profile(&profile.id), &json).await?;
        debug!(user_id = %profile.id, "profile persisted");
        Ok(())
    }

    /// Overwrite the record of an already registered user.
    pub async fn update_profile(&self, profile: &UserProfile) -> Result<()> {
        validate_profile(profile)?;
        if !self.user_ids().await.iter().any(|id| id == &profile.id) {
            return Err(Error::NotFound(profile.id.clone()));
        }
        self.save_profile(profile).await
    }

    /// Profiles for every known id; missing or unreadable records are skipped.
    pub async fn available_users(&self) -> Vec<UserProfile> {
        let mut users = Vec::new();
        for id in self.user_ids().await {
            if let Some(profile) = self.load_profile(&id).await {
                users.push(profile);
            }
        }
        users
    }

    /// Register `profile`. The id list is only rewritten when the id is new;
    /// the profile record is always written. Returns whether the id was new.
    pub async fn add_user(&self, profile: &UserProfile) -> Result<bool> {
        validate_profile(profile)?;

        let _guard = self.list_lock.lock().await;
        let mut ids = self.user_ids().await;
        let added = !ids.iter().any(|id| id == &profile.id);
        if added {
            ids.push(profile.id.clone());
            self.save_user_ids(&ids).await?;
        }
        self.save_profile(profile).await?;
        Ok(added)
    }

    /// Delete the token, server and profile records of `user_id`, then drop
    /// it from the id list. The id stays listed until every record is gone,
    /// so a failed delete never leaves an unowned token. Returns whether the
    /// id was listed.
    pub async fn remove_user(&self, user_id: &str) -> Result<bool> {
        let _guard = self.list_lock.lock().await;

        self.vault.remove(&keys::user_token(user_id)).await?;
        self.vault.remove(&keys::user_server(user_id)).await?;
        self.vault.remove(&keys::user_profile(user_id)).await?;

        let mut ids = self.user_ids().await;
        let before = ids.len();
        ids.retain(|id| id != user_id);
        let removed = ids.len() != before;
        if removed {
            self.save_user_ids(&ids).await?;
        }
        Ok(removed)
    }

    pub async fn load_token(&self, user_id: &str) -> Option<Secret<String>> {
        self.read(&keys::user_token(user_id)).await.map(Secret::new)
    }

    /// Persist the token and server URL of a fresh login. The owning id
    /// must already be registered.
    pub async fn save_credentials(
        &self,
        user_id: &str,
        token: &Secret<String>,
        server_url: &str,
    ) -> Result<()> {
        if !self.user_ids().await.iter().any(|id| id == user_id) {
            return Err(Error::NotFound(user_id.to_owned()));
        }
        self.vault
            .set(&keys::user_token(user_id), token.expose())
            .await?;
        self.vault.set(&keys::user_server(user_id), server_url).await?;
        Ok(())
    }

    pub async fn clear_token(&self, user_id: &str) -> Result<()> {
        self.vault.remove(&keys::user_token(user_id)).await?;
        Ok(())
    }

    pub async fn load_server(&self, user_id: &str) -> Option<String> {
        self.read(&keys::user_server(user_id)).await
    }

    pub async fn current_user_id(&self) -> Option<String> {
        self.read(keys::CURRENT_USER_ID).await
    }

    /// Best-effort: losing the marker only costs auto-login.
    pub async fn mark_current(&self, user_id: &str) {
        if let Err(e) = self.vault.set(keys::CURRENT_USER_ID, user_id).await {
            warn!(user_id, error = %e, "failed to persist current user marker");
        }
    }

    /// Best-effort counterpart of [`mark_current`](Self::mark_current).
    pub async fn clear_current(&self) {
        if let Err(e) = self.vault.remove(keys::CURRENT_USER_ID).await {
            warn!(error = %e, "failed to clear current user marker");
        }
    }
}

fn validate_profile(profile: &UserProfile) -> Result<()> {
    if profile.id.trim().is_empty() {
        return Err(Error::InvalidProfile("empty user id".into()));
    }
    if profile.server_urls.is_empty() {
        return Err(Error::InvalidProfile(format!(
            "user {} has no server URL",
            profile.id
        )));
    }
    Ok(())
}
