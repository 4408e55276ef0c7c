/// PostgreSQL storage backend
///
/// All SQL used by Keygate lives here. Queries are runtime-checked
/// (`sqlx::query_as::<_, T>`) so the crate builds without a live database.
///
/// The active key cap is enforced inside a transaction that locks the
/// owner's `users` row, which serializes concurrent issuance per owner.
///
/// # Example
///
/// ```no_run
/// use keygate_shared::db::pool::{create_pool, DatabaseConfig};
/// use keygate_shared::store::{PgStore, SharedStore};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = create_pool(DatabaseConfig::default()).await?;
/// let store: SharedStore = Arc::new(PgStore::new(pool));
/// # Ok(())
/// # }
/// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ApiKeyRepository, Store, StoreError, StoreResult, SubscriptionRepository, UsageRepository,
    UserRepository,
};
use crate::models::{
    ApiKey, CheckoutCompletion, CreateUser, DailyCount, EndpointStats, NewApiKey, NewUsageEvent,
    PeriodUpdate, Plan, PlanCount, Subscription, TopUser, UsageEvent, User, UserCounts,
};

/// Postgres-backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Raw subscription row; `plan` is validated on the way out
#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    plan: String,
    active: bool,
    external_customer_ref: Option<String>,
    external_subscription_ref: Option<String>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let plan = row
            .plan
            .parse::<Plan>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Subscription {
            user_id: row.user_id,
            plan,
            active: row.active,
            external_customer_ref: row.external_customer_ref,
            external_subscription_ref: row.external_subscription_ref,
            period_start: row.period_start,
            period_end: row.period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_subscription(row: Option<SubscriptionRow>) -> StoreResult<Option<Subscription>> {
    row.map(Subscription::try_from).transpose()
}

#[async_trait]
impl UserRepository for PgStore {
    async fn create_user(&self, data: CreateUser) -> StoreResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, username, admin)
            VALUES ($1, $2, $3)
            RETURNING id, email, username, active, admin, email_verified, created_at, last_login_at
            "#,
        )
        .bind(data.normalized_email())
        .bind(&data.username)
        .bind(data.admin)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, username, active, admin, email_verified, created_at, last_login_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, username, active, admin, email_verified, created_at, last_login_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(crate::models::user::normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn set_user_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE users SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn user_counts(&self) -> StoreResult<UserCounts> {
        let counts = sqlx::query_as::<_, UserCounts>(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE active) AS active,
                   COUNT(*) FILTER (WHERE email_verified) AS verified
            FROM users
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }
}

#[async_trait]
impl ApiKeyRepository for PgStore {
    async fn insert_api_key(&self, data: NewApiKey, max_active: u32) -> StoreResult<ApiKey> {
        let mut tx = self.pool.begin().await?;

        // Lock the owner so concurrent issuance cannot overshoot the cap
        let owner: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM users WHERE id = $1 FOR UPDATE")
                .bind(data.owner_user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if owner.is_none() {
            return Err(StoreError::MissingReference(
                "api_keys_owner_user_id_fkey".to_string(),
            ));
        }

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM api_keys WHERE owner_user_id = $1 AND active",
        )
        .bind(data.owner_user_id)
        .fetch_one(&mut *tx)
        .await?;
        if active >= i64::from(max_active) {
            return Err(StoreError::KeyLimitReached { limit: max_active });
        }

        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            INSERT INTO api_keys (owner_user_id, display_name, key_prefix, key_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, owner_user_id, display_name, key_prefix, key_hash, active,
                      created_at, last_used_at
            "#,
        )
        .bind(data.owner_user_id)
        .bind(&data.display_name)
        .bind(&data.key_prefix)
        .bind(&data.key_hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(key)
    }

    async fn find_api_key(&self, id: Uuid) -> StoreResult<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT id, owner_user_id, display_name, key_prefix, key_hash, active,
                   created_at, last_used_at
            FROM api_keys
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    async fn find_active_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT id, owner_user_id, display_name, key_prefix, key_hash, active,
                   created_at, last_used_at
            FROM api_keys
            WHERE key_hash = $1 AND active
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    async fn list_api_keys(&self, owner_user_id: Uuid) -> StoreResult<Vec<ApiKey>> {
        let keys = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT id, owner_user_id, display_name, key_prefix, key_hash, active,
                   created_at, last_used_at
            FROM api_keys
            WHERE owner_user_id = $1
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn set_api_key_active(
        &self,
        id: Uuid,
        active: bool,
        max_active: u32,
    ) -> StoreResult<Option<ApiKey>> {
        let mut tx = self.pool.begin().await?;

        // The owner never changes, so it can be read before any lock is held
        let owner: Option<Uuid> =
            sqlx::query_scalar("SELECT owner_user_id FROM api_keys WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(owner) = owner else {
            return Ok(None);
        };

        // Owner row first, then the key: the same order insert_api_key uses
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        let is_active: Option<bool> =
            sqlx::query_scalar("SELECT active FROM api_keys WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(is_active) = is_active else {
            return Ok(None);
        };

        if active && !is_active {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM api_keys WHERE owner_user_id = $1 AND active",
            )
            .bind(owner)
            .fetch_one(&mut *tx)
            .await?;
            if count >= i64::from(max_active) {
                return Err(StoreError::KeyLimitReached { limit: max_active });
            }
        }

        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            UPDATE api_keys
            SET active = $2
            WHERE id = $1
            RETURNING id, owner_user_id, display_name, key_prefix, key_hash, active,
                      created_at, last_used_at
            "#,
        )
        .bind(id)
        .bind(active)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(key)
    }

    async fn delete_api_key(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_api_key(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for PgStore {
    async fn find_subscription(&self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT user_id, plan, active, external_customer_ref, external_subscription_ref,
                   period_start, period_end, cancel_at_period_end, created_at, updated_at
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        into_subscription(row)
    }

    async fn upsert_pending(
        &self,
        user_id: Uuid,
        plan: Plan,
        external_customer_ref: Option<String>,
    ) -> StoreResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO subscriptions (user_id, plan, active, external_customer_ref)
            VALUES ($1, $2, FALSE, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET plan = EXCLUDED.plan,
                external_customer_ref = COALESCE(EXCLUDED.external_customer_ref,
                                                 subscriptions.external_customer_ref),
                updated_at = NOW()
            WHERE NOT subscriptions.active
            RETURNING user_id, plan, active, external_customer_ref, external_subscription_ref,
                      period_start, period_end, cancel_at_period_end, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(plan.as_str())
        .bind(external_customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        match into_subscription(row)? {
            Some(sub) => Ok(sub),
            // Conflict with an active row: nothing was written
            None => self.find_subscription(user_id).await?.ok_or_else(|| {
                StoreError::Corrupt(format!("subscription for {user_id} vanished"))
            }),
        }
    }

    async fn upsert_checkout(
        &self,
        data: CheckoutCompletion,
    ) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO subscriptions
                (user_id, plan, active, external_customer_ref, external_subscription_ref)
            SELECT $1, $2, TRUE, $3, $4
            WHERE NOT EXISTS (
                SELECT 1 FROM terminated_subscriptions
                WHERE external_subscription_ref = $4
            )
            ON CONFLICT (user_id) DO UPDATE
            SET plan = EXCLUDED.plan,
                active = TRUE,
                cancel_at_period_end = FALSE,
                external_customer_ref = COALESCE(EXCLUDED.external_customer_ref,
                                                 subscriptions.external_customer_ref),
                external_subscription_ref = EXCLUDED.external_subscription_ref,
                updated_at = NOW()
            WHERE (subscriptions.plan, subscriptions.active, subscriptions.cancel_at_period_end,
                   subscriptions.external_customer_ref, subscriptions.external_subscription_ref)
                IS DISTINCT FROM
                  (EXCLUDED.plan, TRUE, FALSE,
                   COALESCE(EXCLUDED.external_customer_ref, subscriptions.external_customer_ref),
                   EXCLUDED.external_subscription_ref)
            RETURNING user_id, plan, active, external_customer_ref, external_subscription_ref,
                      period_start, period_end, cancel_at_period_end, created_at, updated_at
            "#,
        )
        .bind(data.user_id)
        .bind(data.plan.as_str())
        .bind(&data.external_customer_ref)
        .bind(&data.external_subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(sub) = into_subscription(row)? {
            return Ok(Some(sub));
        }

        if let Some(external_ref) = data.external_subscription_ref.as_deref() {
            let terminated: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM terminated_subscriptions WHERE external_subscription_ref = $1)",
            )
            .bind(external_ref)
            .fetch_one(&self.pool)
            .await?;
            if terminated {
                return Ok(None);
            }
        }

        // Replay of an already-applied completion
        self.find_subscription(data.user_id)
            .await?
            .map(Some)
            .ok_or_else(|| {
                StoreError::Corrupt(format!("subscription for {} vanished", data.user_id))
            })
    }

    async fn update_period(&self, data: PeriodUpdate) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET period_start = $2,
                period_end = $3,
                cancel_at_period_end = $4,
                updated_at = NOW()
            WHERE external_subscription_ref = $1
            RETURNING user_id, plan, active, external_customer_ref, external_subscription_ref,
                      period_start, period_end, cancel_at_period_end, created_at, updated_at
            "#,
        )
        .bind(&data.external_subscription_ref)
        .bind(data.period_start)
        .bind(data.period_end)
        .bind(data.cancel_at_period_end)
        .fetch_optional(&self.pool)
        .await?;

        into_subscription(row)
    }

    async fn reset_to_free(
        &self,
        external_subscription_ref: &str,
    ) -> StoreResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO terminated_subscriptions (external_subscription_ref)
            VALUES ($1)
            ON CONFLICT (external_subscription_ref) DO NOTHING
            "#,
        )
        .bind(external_subscription_ref)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET plan = 'free',
                active = FALSE,
                cancel_at_period_end = FALSE,
                external_subscription_ref = NULL,
                updated_at = NOW()
            WHERE external_subscription_ref = $1
            RETURNING user_id, plan, active, external_customer_ref, external_subscription_ref,
                      period_start, period_end, cancel_at_period_end, created_at, updated_at
            "#,
        )
        .bind(external_subscription_ref)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        into_subscription(row)
    }

    async fn plan_counts(&self) -> StoreResult<Vec<PlanCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT plan, COUNT(*) FROM subscriptions WHERE active GROUP BY plan",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = rows
            .into_iter()
            .map(|(plan, count)| {
                plan.parse::<Plan>()
                    .map(|plan| PlanCount { plan, count })
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        counts.sort_by_key(|pc| Plan::ALL.iter().position(|p| *p == pc.plan));
        Ok(counts)
    }
}

#[async_trait]
impl UsageRepository for PgStore {
    async fn append_usage(&self, event: NewUsageEvent) -> StoreResult<UsageEvent> {
        let stored = sqlx::query_as::<_, UsageEvent>(
            r#"
            INSERT INTO usage_events
                (user_id, api_key_id, endpoint, method, status_code, response_time_ms, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, user_id, api_key_id, endpoint, method, status_code,
                      response_time_ms, occurred_at
            "#,
        )
        .bind(event.user_id)
        .bind(event.api_key_id)
        .bind(&event.endpoint)
        .bind(&event.method)
        .bind(i32::from(event.status_code))
        .bind(event.response_time_ms)
        .bind(event.timestamp)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn count_usage(
        &self,
        user_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM usage_events
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND occurred_at >= $2
              AND occurred_at < $3
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn recent_usage(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<UsageEvent>> {
        let events = sqlx::query_as::<_, UsageEvent>(
            r#"
            SELECT id, user_id, api_key_id, endpoint, method, status_code,
                   response_time_ms, occurred_at
            FROM usage_events
            WHERE user_id = $1 AND occurred_at >= $2
            ORDER BY occurred_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn usage_by_day(&self, since: DateTime<Utc>) -> StoreResult<Vec<DailyCount>> {
        let days = sqlx::query_as::<_, DailyCount>(
            r#"
            SELECT (occurred_at AT TIME ZONE 'UTC')::date AS date, COUNT(*) AS count
            FROM usage_events
            WHERE occurred_at >= $1
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(days)
    }

    async fn usage_by_endpoint(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EndpointStats>> {
        let stats = sqlx::query_as::<_, EndpointStats>(
            r#"
            SELECT endpoint,
                   COUNT(*) AS count,
                   AVG(response_time_ms) AS mean_response_time_ms
            FROM usage_events
            WHERE user_id = $1 AND occurred_at >= $2
            GROUP BY endpoint
            ORDER BY count DESC, endpoint
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(stats)
    }

    async fn top_users(&self, since: DateTime<Utc>, limit: i64) -> StoreResult<Vec<TopUser>> {
        let users = sqlx::query_as::<_, TopUser>(
            r#"
            SELECT u.id AS user_id, u.username, u.email, COUNT(*) AS count
            FROM usage_events e
            JOIN users u ON u.id = e.user_id
            WHERE e.occurred_at >= $1
            GROUP BY u.id, u.username, u.email
            ORDER BY count DESC, MIN(e.id)
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
