/// Storage abstraction
///
/// The services never talk to a database directly. They depend on the
/// repository traits below, which are implemented by:
///
/// - `postgres::PgStore`: production backend on top of sqlx
/// - `memory::MemoryStore`: in-process backend used by tests and local runs
///
/// Both backends enforce the same constraints (unique emails, usernames and
/// key hashes, one subscription per user, referential integrity, and the
/// per-owner active key cap) so that behavior does not depend on the backend.
///
/// Every call made by a service goes through [`bounded`], which turns a slow
/// backend into a [`StoreError::Timeout`] instead of a hung request.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    ApiKey, CheckoutCompletion, CreateUser, DailyCount, EndpointStats, NewApiKey, NewUsageEvent,
    PeriodUpdate, Plan, PlanCount, Subscription, TopUser, UsageEvent, User, UserCounts,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Default upper bound for a single storage call
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or failed
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Backend did not answer within the configured bound
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    /// Unique constraint violated
    #[error("conflict on {0}")]
    Conflict(String),

    /// Referenced row does not exist
    #[error("missing referenced record: {0}")]
    MissingReference(String),

    /// Owner already holds the maximum number of active keys
    #[error("active key limit of {limit} reached")]
    KeyLimitReached { limit: u32 },

    /// Row exists but cannot be decoded into a model
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True for failures that say nothing about the data itself
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.constraint().unwrap_or("unique").to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::MissingReference(db.constraint().unwrap_or("foreign key").to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Runs a storage future with an upper time bound
pub async fn bounded<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_user(&self, data: CreateUser) -> StoreResult<User>;

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    /// Returns false when the user does not exist
    async fn set_user_active(&self, id: Uuid, active: bool) -> StoreResult<bool>;

    async fn user_counts(&self) -> StoreResult<UserCounts>;
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Inserts a key unless the owner already holds `max_active` active keys.
    ///
    /// The count and the insert happen atomically per owner.
    async fn insert_api_key(&self, data: NewApiKey, max_active: u32) -> StoreResult<ApiKey>;

    async fn find_api_key(&self, id: Uuid) -> StoreResult<Option<ApiKey>>;

    async fn find_active_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>>;

    /// Keys of one owner, newest first
    async fn list_api_keys(&self, owner_user_id: Uuid) -> StoreResult<Vec<ApiKey>>;

    /// Sets the active flag; reactivation respects `max_active`
    async fn set_api_key_active(
        &self,
        id: Uuid,
        active: bool,
        max_active: u32,
    ) -> StoreResult<Option<ApiKey>>;

    async fn delete_api_key(&self, id: Uuid) -> StoreResult<bool>;

    async fn touch_api_key(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_subscription(&self, user_id: Uuid) -> StoreResult<Option<Subscription>>;

    /// Records a started checkout for `plan` without granting it.
    ///
    /// An active subscription is returned unchanged.
    async fn upsert_pending(
        &self,
        user_id: Uuid,
        plan: Plan,
        external_customer_ref: Option<String>,
    ) -> StoreResult<Subscription>;

    /// Activates the purchased plan; replaying the same completion is a no-op.
    /// Returns None, writing nothing, when the subscription reference has
    /// already been terminated.
    async fn upsert_checkout(&self, data: CheckoutCompletion)
        -> StoreResult<Option<Subscription>>;

    /// Returns None when no subscription carries the reference
    async fn update_period(&self, data: PeriodUpdate) -> StoreResult<Option<Subscription>>;

    /// Drops the subscription back to an inactive free row and terminates the
    /// reference for good, even when no row carries it yet
    async fn reset_to_free(&self, external_subscription_ref: &str)
        -> StoreResult<Option<Subscription>>;

    /// Active subscriptions grouped by plan
    async fn plan_counts(&self) -> StoreResult<Vec<PlanCount>>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn append_usage(&self, event: NewUsageEvent) -> StoreResult<UsageEvent>;

    /// Events in `[start, end)`, for one user or for everyone
    async fn count_usage(
        &self,
        user_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// A user's events since `since`, newest first
    async fn recent_usage(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<UsageEvent>>;

    /// Platform-wide counts per UTC day, oldest first
    async fn usage_by_day(&self, since: DateTime<Utc>) -> StoreResult<Vec<DailyCount>>;

    /// A user's counts and mean latency per endpoint, busiest first
    async fn usage_by_endpoint(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EndpointStats>>;

    /// Busiest users since `since`; ties go to whoever appeared first
    async fn top_users(&self, since: DateTime<Utc>, limit: i64) -> StoreResult<Vec<TopUser>>;
}

/// Full storage backend
#[async_trait]
pub trait Store: UserRepository + ApiKeyRepository + SubscriptionRepository + UsageRepository {
    /// Cheap liveness check
    async fn ping(&self) -> StoreResult<()>;
}

/// Shared handle used by the services
pub type SharedStore = Arc<dyn Store>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded(Duration::from_millis(50), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let limit = Duration::from_millis(50);
        let result = bounded(limit, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, StoreError>(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(d)) if d == limit));
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(StoreError::Unavailable("down".into()).is_unavailable());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_unavailable());
        assert!(!StoreError::Conflict("users_email_key".into()).is_unavailable());
    }
}
