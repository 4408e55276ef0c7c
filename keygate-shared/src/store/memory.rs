/// In-memory storage backend
///
/// Keeps every table behind a single `tokio::sync::RwLock`, so each
/// repository call is atomic with respect to the others. It enforces the
/// same uniqueness, reference and key-cap rules as the Postgres schema.
///
/// The backend can be switched offline to exercise storage failure paths.
///
/// # Example
///
/// ```
/// use keygate_shared::store::{MemoryStore, SharedStore};
/// use std::sync::Arc;
///
/// let store: SharedStore = Arc::new(MemoryStore::new());
/// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ApiKeyRepository, Store, StoreError, StoreResult, SubscriptionRepository, UsageRepository,
    UserRepository,
};
use crate::models::{
    ApiKey, CheckoutCompletion, CreateUser, DailyCount, EndpointStats, NewApiKey, NewUsageEvent,
    PeriodUpdate, Plan, PlanCount, Subscription, TopUser, UsageEvent, User, UserCounts,
};

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    api_keys: Vec<ApiKey>,
    subscriptions: HashMap<Uuid, Subscription>,
    terminated_refs: HashSet<String>,
    usage: Vec<UsageEvent>,
}

impl Tables {
    fn user_exists(&self, id: Uuid) -> bool {
        self.users.iter().any(|u| u.id == id)
    }

    fn active_key_count(&self, owner: Uuid) -> usize {
        self.api_keys
            .iter()
            .filter(|k| k.owner_user_id == owner && k.active)
            .count()
    }

    fn subscription_by_ref_mut(&mut self, external_ref: &str) -> Option<&mut Subscription> {
        self.subscriptions
            .values_mut()
            .find(|s| s.external_subscription_ref.as_deref() == Some(external_ref))
    }
}

/// In-process [`Store`] implementation
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`StoreError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create_user(&self, data: CreateUser) -> StoreResult<User> {
        self.ensure_online()?;
        let email = data.normalized_email();
        let mut tables = self.tables.write().await;

        if tables.users.iter().any(|u| u.email == email) {
            return Err(StoreError::Conflict("users_email_key".to_string()));
        }
        if tables.users.iter().any(|u| u.username == data.username) {
            return Err(StoreError::Conflict("users_username_key".to_string()));
        }

        let user = User {
            id: Uuid::new_v4(),
            email,
            username: data.username,
            active: true,
            admin: data.admin,
            email_verified: false,
            created_at: Utc::now(),
            last_login_at: None,
        };
        tables.users.push(user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables.users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.ensure_online()?;
        let email = crate::models::user::normalize_email(email);
        let tables = self.tables.read().await;
        Ok(tables.users.iter().find(|u| u.email == email).cloned())
    }

    async fn set_user_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        match tables.users.iter_mut().find(|u| u.id == id) {
            Some(user) => {
                user.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn user_counts(&self) -> StoreResult<UserCounts> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(UserCounts {
            total: tables.users.len() as i64,
            active: tables.users.iter().filter(|u| u.active).count() as i64,
            verified: tables.users.iter().filter(|u| u.email_verified).count() as i64,
        })
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryStore {
    async fn insert_api_key(&self, data: NewApiKey, max_active: u32) -> StoreResult<ApiKey> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;

        if !tables.user_exists(data.owner_user_id) {
            return Err(StoreError::MissingReference(
                "api_keys_owner_user_id_fkey".to_string(),
            ));
        }
        if tables.api_keys.iter().any(|k| k.key_hash == data.key_hash) {
            return Err(StoreError::Conflict("api_keys_key_hash_key".to_string()));
        }
        if tables.active_key_count(data.owner_user_id) >= max_active as usize {
            return Err(StoreError::KeyLimitReached { limit: max_active });
        }

        let key = ApiKey {
            id: Uuid::new_v4(),
            owner_user_id: data.owner_user_id,
            display_name: data.display_name,
            key_prefix: data.key_prefix,
            key_hash: data.key_hash,
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        tables.api_keys.push(key.clone());
        Ok(key)
    }

    async fn find_api_key(&self, id: Uuid) -> StoreResult<Option<ApiKey>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables.api_keys.iter().find(|k| k.id == id).cloned())
    }

    async fn find_active_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKey>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables
            .api_keys
            .iter()
            .find(|k| k.active && k.key_hash == key_hash)
            .cloned())
    }

    async fn list_api_keys(&self, owner_user_id: Uuid) -> StoreResult<Vec<ApiKey>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables
            .api_keys
            .iter()
            .rev()
            .filter(|k| k.owner_user_id == owner_user_id)
            .cloned()
            .collect())
    }

    async fn set_api_key_active(
        &self,
        id: Uuid,
        active: bool,
        max_active: u32,
    ) -> StoreResult<Option<ApiKey>> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;

        let Some(index) = tables.api_keys.iter().position(|k| k.id == id) else {
            return Ok(None);
        };
        let owner = tables.api_keys[index].owner_user_id;
        if active
            && !tables.api_keys[index].active
            && tables.active_key_count(owner) >= max_active as usize
        {
            return Err(StoreError::KeyLimitReached { limit: max_active });
        }

        tables.api_keys[index].active = active;
        Ok(Some(tables.api_keys[index].clone()))
    }

    async fn delete_api_key(&self, id: Uuid) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let before = tables.api_keys.len();
        tables.api_keys.retain(|k| k.id != id);
        if tables.api_keys.len() == before {
            return Ok(false);
        }
        for event in tables.usage.iter_mut().filter(|e| e.api_key_id == Some(id)) {
            event.api_key_id = None;
        }
        Ok(true)
    }

    async fn touch_api_key(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        if let Some(key) = tables.api_keys.iter_mut().find(|k| k.id == id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn find_subscription(&self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables.subscriptions.get(&user_id).cloned())
    }

    async fn upsert_pending(
        &self,
        user_id: Uuid,
        plan: Plan,
        external_customer_ref: Option<String>,
    ) -> StoreResult<Subscription> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        if !tables.user_exists(user_id) {
            return Err(StoreError::MissingReference(
                "subscriptions_user_id_fkey".to_string(),
            ));
        }

        let now = Utc::now();
        let sub = tables
            .subscriptions
            .entry(user_id)
            .or_insert_with(|| empty_subscription(user_id, now));
        if !sub.active {
            sub.plan = plan;
            if external_customer_ref.is_some() {
                sub.external_customer_ref = external_customer_ref;
            }
            sub.updated_at = now;
        }
        Ok(sub.clone())
    }

    async fn upsert_checkout(
        &self,
        data: CheckoutCompletion,
    ) -> StoreResult<Option<Subscription>> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        if !tables.user_exists(data.user_id) {
            return Err(StoreError::MissingReference(
                "subscriptions_user_id_fkey".to_string(),
            ));
        }
        if let Some(external_ref) = data.external_subscription_ref.as_deref() {
            if tables.terminated_refs.contains(external_ref) {
                return Ok(None);
            }
            let taken = tables.subscriptions.values().any(|s| {
                s.user_id != data.user_id
                    && s.external_subscription_ref.as_deref() == Some(external_ref)
            });
            if taken {
                return Err(StoreError::Conflict(
                    "subscriptions_external_subscription_ref_key".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let sub = tables
            .subscriptions
            .entry(data.user_id)
            .or_insert_with(|| empty_subscription(data.user_id, now));

        let customer_ref = data
            .external_customer_ref
            .or_else(|| sub.external_customer_ref.clone());
        let changed = sub.plan != data.plan
            || !sub.active
            || sub.cancel_at_period_end
            || sub.external_customer_ref != customer_ref
            || sub.external_subscription_ref != data.external_subscription_ref;

        if changed {
            sub.plan = data.plan;
            sub.active = true;
            sub.cancel_at_period_end = false;
            sub.external_customer_ref = customer_ref;
            sub.external_subscription_ref = data.external_subscription_ref;
            sub.updated_at = now;
        }
        Ok(Some(sub.clone()))
    }

    async fn update_period(&self, data: PeriodUpdate) -> StoreResult<Option<Subscription>> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        Ok(tables
            .subscription_by_ref_mut(&data.external_subscription_ref)
            .map(|sub| {
                sub.period_start = data.period_start;
                sub.period_end = data.period_end;
                sub.cancel_at_period_end = data.cancel_at_period_end;
                sub.updated_at = Utc::now();
                sub.clone()
            }))
    }

    async fn reset_to_free(
        &self,
        external_subscription_ref: &str,
    ) -> StoreResult<Option<Subscription>> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        tables
            .terminated_refs
            .insert(external_subscription_ref.to_string());
        Ok(tables
            .subscription_by_ref_mut(external_subscription_ref)
            .map(|sub| {
                sub.plan = Plan::Free;
                sub.active = false;
                sub.cancel_at_period_end = false;
                sub.external_subscription_ref = None;
                sub.updated_at = Utc::now();
                sub.clone()
            }))
    }

    async fn plan_counts(&self) -> StoreResult<Vec<PlanCount>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(Plan::ALL
            .iter()
            .map(|plan| PlanCount {
                plan: *plan,
                count: tables
                    .subscriptions
                    .values()
                    .filter(|s| s.active && s.plan == *plan)
                    .count() as i64,
            })
            .filter(|pc| pc.count > 0)
            .collect())
    }
}

#[async_trait]
impl UsageRepository for MemoryStore {
    async fn append_usage(&self, event: NewUsageEvent) -> StoreResult<UsageEvent> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        if !tables.user_exists(event.user_id) {
            return Err(StoreError::MissingReference(
                "usage_events_user_id_fkey".to_string(),
            ));
        }
        if let Some(key_id) = event.api_key_id {
            if !tables.api_keys.iter().any(|k| k.id == key_id) {
                return Err(StoreError::MissingReference(
                    "usage_events_api_key_id_fkey".to_string(),
                ));
            }
        }

        let stored = UsageEvent {
            id: tables.usage.len() as i64 + 1,
            user_id: event.user_id,
            api_key_id: event.api_key_id,
            endpoint: event.endpoint,
            method: event.method,
            status_code: i32::from(event.status_code),
            response_time_ms: event.response_time_ms,
            timestamp: event.timestamp,
        };
        tables.usage.push(stored.clone());
        Ok(stored)
    }

    async fn count_usage(
        &self,
        user_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables
            .usage
            .iter()
            .filter(|e| user_id.map_or(true, |id| e.user_id == id))
            .filter(|e| e.timestamp >= start && e.timestamp < end)
            .count() as i64)
    }

    async fn recent_usage(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<UsageEvent>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        let mut events: Vec<UsageEvent> = tables
            .usage
            .iter()
            .filter(|e| e.user_id == user_id && e.timestamp >= since)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn usage_by_day(&self, since: DateTime<Utc>) -> StoreResult<Vec<DailyCount>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        let mut days = BTreeMap::new();
        for event in tables.usage.iter().filter(|e| e.timestamp >= since) {
            *days.entry(event.timestamp.date_naive()).or_insert(0i64) += 1;
        }
        Ok(days
            .into_iter()
            .map(|(date, count)| DailyCount { date, count })
            .collect())
    }

    async fn usage_by_endpoint(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EndpointStats>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        let mut groups: HashMap<&str, (i64, f64)> = HashMap::new();
        for event in tables
            .usage
            .iter()
            .filter(|e| e.user_id == user_id && e.timestamp >= since)
        {
            let entry = groups.entry(event.endpoint.as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += event.response_time_ms;
        }

        let mut stats: Vec<EndpointStats> = groups
            .into_iter()
            .map(|(endpoint, (count, total_ms))| EndpointStats {
                endpoint: endpoint.to_string(),
                count,
                mean_response_time_ms: total_ms / count as f64,
            })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.endpoint.cmp(&b.endpoint)));
        Ok(stats)
    }

    async fn top_users(&self, since: DateTime<Utc>, limit: i64) -> StoreResult<Vec<TopUser>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;

        // user -> (count, first event id)
        let mut groups: HashMap<Uuid, (i64, i64)> = HashMap::new();
        for event in tables.usage.iter().filter(|e| e.timestamp >= since) {
            let entry = groups.entry(event.user_id).or_insert((0, event.id));
            entry.0 += 1;
            entry.1 = entry.1.min(event.id);
        }

        let mut ranked: Vec<(Uuid, i64, i64)> = groups
            .into_iter()
            .map(|(user_id, (count, first))| (user_id, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        Ok(ranked
            .into_iter()
            .filter_map(|(user_id, count, _)| {
                tables.users.iter().find(|u| u.id == user_id).map(|u| TopUser {
                    user_id,
                    username: u.username.clone(),
                    email: u.email.clone(),
                    count,
                })
            })
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.ensure_online()
    }
}

fn empty_subscription(user_id: Uuid, now: DateTime<Utc>) -> Subscription {
    Subscription {
        user_id,
        plan: Plan::Free,
        active: false,
        external_customer_ref: None,
        external_subscription_ref: None,
        period_start: None,
        period_end: None,
        cancel_at_period_end: false,
        created_at: now,
        updated_at: now,
    }
}
