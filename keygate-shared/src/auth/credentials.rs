/// Credential store
///
/// Issues, resolves and manages API keys on top of the storage layer.
///
/// # Rules
///
/// - The plaintext token leaves this module exactly once, in
///   [`CredentialStore::issue`]
/// - An owner holds at most `max_active_keys` active keys at a time
/// - Resolution answers [`CredentialError::InvalidKey`] for malformed,
///   unknown, revoked and orphaned tokens alike, so callers cannot tell
///   which one they hit
/// - Mutations by anyone but the owner fail with
///   [`CredentialError::Forbidden`]
///
/// # Example
///
/// ```
/// use keygate_shared::auth::credentials::CredentialStore;
/// use keygate_shared::models::CreateUser;
/// use keygate_shared::store::{MemoryStore, SharedStore, UserRepository};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store: SharedStore = Arc::new(MemoryStore::new());
/// let owner = store.create_user(CreateUser::new("dev@example.com", "dev")).await?;
///
/// let credentials = CredentialStore::new(store, 10);
/// let issued = credentials.issue(owner.id, "ci").await?;
/// let resolved = credentials.resolve(&issued.token).await?;
/// assert_eq!(resolved.user.id, owner.id);
/// # Ok(())
/// # }
/// ```

use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api_key::{display_prefix, generate_api_key, hash_api_key, validate_api_key_format};
use crate::models::api_key::MAX_DISPLAY_NAME_LENGTH;
use crate::models::{ApiKey, IssuedApiKey, NewApiKey, User};
use crate::store::{bounded, SharedStore, StoreError, DEFAULT_STORAGE_TIMEOUT};

/// Default cap on simultaneously active keys per owner
pub const DEFAULT_MAX_ACTIVE_KEYS: u32 = 10;

/// Attempts before giving up on a digest collision
const ISSUE_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Token malformed, unknown, revoked, or owned by a vanished user
    #[error("invalid API key")]
    InvalidKey,

    #[error("API key not found")]
    NotFound,

    #[error("API key belongs to another user")]
    Forbidden,

    #[error("owner does not exist")]
    UnknownOwner,

    #[error("active API key limit of {limit} reached")]
    QuotaExceeded { limit: u32 },

    #[error("invalid display name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// A token resolved to its key record and owner
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub user: User,
    pub api_key: ApiKey,
}

#[derive(Clone)]
pub struct CredentialStore {
    store: SharedStore,
    max_active_keys: u32,
    timeout: Duration,
}

impl CredentialStore {
    pub fn new(store: SharedStore, max_active_keys: u32) -> Self {
        Self {
            store,
            max_active_keys,
            timeout: DEFAULT_STORAGE_TIMEOUT,
        }
    }

    /// Bounds every storage call made by this store
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_active_keys(&self) -> u32 {
        self.max_active_keys
    }

    /// Generates a key for `owner`, returning the plaintext once
    pub async fn issue(
        &self,
        owner: Uuid,
        display_name: &str,
    ) -> Result<IssuedApiKey, CredentialError> {
        let display_name = validate_display_name(display_name)?;

        for attempt in 1..=ISSUE_ATTEMPTS {
            let (token, key_hash) = generate_api_key();
            let new_key = NewApiKey {
                owner_user_id: owner,
                display_name: display_name.clone(),
                key_prefix: display_prefix(&token),
                key_hash,
            };

            match bounded(
                self.timeout,
                self.store.insert_api_key(new_key, self.max_active_keys),
            )
            .await
            {
                Ok(key) => {
                    info!(
                        owner_user_id = %owner,
                        api_key_id = %key.id,
                        key_prefix = %key.key_prefix,
                        "API key issued"
                    );
                    return Ok(IssuedApiKey { key, token });
                }
                Err(StoreError::Conflict(constraint)) if attempt < ISSUE_ATTEMPTS => {
                    warn!(%constraint, attempt, "API key digest collision, regenerating");
                }
                Err(StoreError::KeyLimitReached { limit }) => {
                    return Err(CredentialError::QuotaExceeded { limit });
                }
                Err(StoreError::MissingReference(_)) => return Err(CredentialError::UnknownOwner),
                Err(e) => return Err(e.into()),
            }
        }

        Err(CredentialError::Storage(StoreError::Conflict(
            "api_keys_key_hash_key".to_string(),
        )))
    }

    /// Maps a presented token to its active key and owning user
    pub async fn resolve(&self, token: &str) -> Result<ResolvedCredential, CredentialError> {
        if !validate_api_key_format(token) {
            debug!("Rejected API key with invalid format");
            return Err(CredentialError::InvalidKey);
        }

        let key_hash = hash_api_key(token);
        let api_key = bounded(
            self.timeout,
            self.store.find_active_api_key_by_hash(&key_hash),
        )
        .await?
        .ok_or(CredentialError::InvalidKey)?;

        let user = bounded(self.timeout, self.store.find_user(api_key.owner_user_id))
            .await?
            .ok_or(CredentialError::InvalidKey)?;

        Ok(ResolvedCredential { user, api_key })
    }

    /// Best-effort `last_used_at` update; failures are logged only
    pub async fn record_use(&self, key_id: Uuid) {
        if let Err(e) = bounded(self.timeout, self.store.touch_api_key(key_id, Utc::now())).await {
            warn!(api_key_id = %key_id, error = %e, "Failed to update API key last_used_at");
        }
    }

    /// Keys of `owner`, newest first; never includes plaintext
    pub async fn list(&self, owner: Uuid) -> Result<Vec<ApiKey>, CredentialError> {
        Ok(bounded(self.timeout, self.store.list_api_keys(owner)).await?)
    }

    /// Flips the active flag; reactivation respects the key cap
    pub async fn toggle(&self, key_id: Uuid, requester: Uuid) -> Result<ApiKey, CredentialError> {
        let key = self.owned_key(key_id, requester).await?;
        self.set_active(key.id, !key.active).await
    }

    /// Deactivates a key; revoking an inactive key is a no-op
    pub async fn revoke(&self, key_id: Uuid, requester: Uuid) -> Result<ApiKey, CredentialError> {
        let key = self.owned_key(key_id, requester).await?;
        if !key.active {
            return Ok(key);
        }
        self.set_active(key.id, false).await
    }

    /// Removes a key; its usage history survives with the key reference cleared
    pub async fn delete(&self, key_id: Uuid, requester: Uuid) -> Result<(), CredentialError> {
        self.owned_key(key_id, requester).await?;
        if !bounded(self.timeout, self.store.delete_api_key(key_id)).await? {
            return Err(CredentialError::NotFound);
        }
        info!(api_key_id = %key_id, owner_user_id = %requester, "API key deleted");
        Ok(())
    }

    async fn set_active(&self, key_id: Uuid, active: bool) -> Result<ApiKey, CredentialError> {
        let updated = bounded(
            self.timeout,
            self.store
                .set_api_key_active(key_id, active, self.max_active_keys),
        )
        .await
        .map_err(|e| match e {
            StoreError::KeyLimitReached { limit } => CredentialError::QuotaExceeded { limit },
            other => CredentialError::Storage(other),
        })?
        .ok_or(CredentialError::NotFound)?;

        info!(api_key_id = %key_id, active, "API key active flag changed");
        Ok(updated)
    }

    async fn owned_key(&self, key_id: Uuid, requester: Uuid) -> Result<ApiKey, CredentialError> {
        let key = bounded(self.timeout, self.store.find_api_key(key_id))
            .await?
            .ok_or(CredentialError::NotFound)?;

        if key.owner_user_id != requester {
            warn!(
                api_key_id = %key_id,
                requester = %requester,
                "Rejected API key mutation by non-owner"
            );
            return Err(CredentialError::Forbidden);
        }
        Ok(key)
    }
}

fn validate_display_name(name: &str) -> Result<String, CredentialError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CredentialError::InvalidName("must not be empty".to_string()));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(CredentialError::InvalidName(format!(
            "must be at most {MAX_DISPLAY_NAME_LENGTH} characters"
        )));
    }
    Ok(name.to_string())
}
