//! Subscription registry
//!
//! Owns each user's plan and billing state. The only writers are
//! [`SubscriptionRegistry::begin_checkout`] and [`SubscriptionRegistry::apply`],
//! which consumes verified processor events. Every transition is an upsert
//! keyed by user or external reference, so redelivered events change nothing.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event::{BillingEvent, BillingEventKind, CheckoutSession, SubscriptionObject};
use super::BillingError;
use crate::models::{CheckoutCompletion, PeriodUpdate, Plan, PlanCount, Subscription, UnknownPlan};
use crate::store::{bounded, SharedStore, StoreError, StoreResult, DEFAULT_STORAGE_TIMEOUT};

/// What applying an event did
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Subscription),
    /// Acknowledged without effect
    Ignored(&'static str),
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    store: SharedStore,
    timeout: Duration,
}

impl SubscriptionRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            timeout: DEFAULT_STORAGE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Plan whose limits apply to `user_id` now; no record means free
    pub async fn current_plan(&self, user_id: Uuid) -> StoreResult<Plan> {
        self.current_plan_at(user_id, Utc::now()).await
    }

    pub async fn current_plan_at(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<Plan> {
        Ok(self
            .subscription(user_id)
            .await?
            .map(|sub| sub.effective_plan(now))
            .unwrap_or_default())
    }

    pub async fn subscription(&self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        bounded(self.timeout, self.store.find_subscription(user_id)).await
    }

    /// Marks a purchase of `plan` as started. Grants nothing until the
    /// processor confirms the checkout.
    pub async fn begin_checkout(
        &self,
        user_id: Uuid,
        plan: Plan,
        external_customer_ref: Option<String>,
    ) -> StoreResult<Subscription> {
        let sub = bounded(
            self.timeout,
            self.store
                .upsert_pending(user_id, plan, external_customer_ref),
        )
        .await?;
        debug!(user_id = %user_id, plan = %plan, state = ?sub.state(), "Checkout started");
        Ok(sub)
    }

    /// Active subscriptions per plan
    pub async fn plan_stats(&self) -> StoreResult<Vec<PlanCount>> {
        bounded(self.timeout, self.store.plan_counts()).await
    }

    /// Applies one verified processor event
    pub async fn apply(&self, event: &BillingEvent) -> Result<ApplyOutcome, BillingError> {
        let outcome = match &event.kind {
            BillingEventKind::CheckoutCompleted(session) => self.checkout_completed(session).await?,
            BillingEventKind::SubscriptionUpdated(object) => self.subscription_updated(object).await?,
            BillingEventKind::SubscriptionDeleted(object) => self.subscription_deleted(object).await?,
            BillingEventKind::Other(_) => ApplyOutcome::Ignored("unhandled event type"),
        };

        match &outcome {
            ApplyOutcome::Applied(sub) => info!(
                event_id = %event.id,
                event_type = event.type_name(),
                user_id = %sub.user_id,
                plan = %sub.plan,
                active = sub.active,
                "Billing event applied"
            ),
            ApplyOutcome::Ignored(reason) => info!(
                event_id = %event.id,
                event_type = event.type_name(),
                reason,
                "Billing event ignored"
            ),
        }

        Ok(outcome)
    }

    async fn checkout_completed(
        &self,
        session: &CheckoutSession,
    ) -> Result<ApplyOutcome, BillingError> {
        let (Some(user_id), Some(plan)) = (session.metadata.get("user_id"), session.metadata.get("plan"))
        else {
            return Ok(ApplyOutcome::Ignored("checkout without user metadata"));
        };

        let user_id = Uuid::parse_str(user_id)
            .map_err(|_| BillingError::Malformed(format!("user_id {user_id:?} is not a uuid")))?;
        let plan: Plan = plan
            .parse()
            .map_err(|e: UnknownPlan| BillingError::Malformed(e.to_string()))?;

        let completion = CheckoutCompletion {
            user_id,
            plan,
            external_customer_ref: session.customer.clone(),
            external_subscription_ref: session.subscription.clone(),
        };

        match bounded(self.timeout, self.store.upsert_checkout(completion)).await {
            Ok(Some(sub)) => Ok(ApplyOutcome::Applied(sub)),
            Ok(None) => {
                warn!(user_id = %user_id, "Checkout for a terminated subscription");
                Ok(ApplyOutcome::Ignored("subscription already terminated"))
            }
            Err(StoreError::MissingReference(_)) => {
                warn!(user_id = %user_id, "Checkout completed for unknown user");
                Ok(ApplyOutcome::Ignored("unknown user"))
            }
            Err(StoreError::Conflict(constraint)) => Err(BillingError::Malformed(format!(
                "subscription reference already bound to another user ({constraint})"
            ))),
            Err(e) => Err(BillingError::Storage(e)),
        }
    }

    async fn subscription_updated(
        &self,
        object: &SubscriptionObject,
    ) -> Result<ApplyOutcome, BillingError> {
        let update = PeriodUpdate {
            external_subscription_ref: object.id.clone(),
            period_start: object.period_start(),
            period_end: object.period_end(),
            cancel_at_period_end: object.cancel_at_period_end,
        };

        match bounded(self.timeout, self.store.update_period(update))
            .await
            .map_err(BillingError::Storage)?
        {
            Some(sub) => Ok(ApplyOutcome::Applied(sub)),
            None => {
                warn!(external_ref = %object.id, "Update for unknown subscription");
                Ok(ApplyOutcome::Ignored("no matching subscription"))
            }
        }
    }

    async fn subscription_deleted(
        &self,
        object: &SubscriptionObject,
    ) -> Result<ApplyOutcome, BillingError> {
        match bounded(self.timeout, self.store.reset_to_free(&object.id))
            .await
            .map_err(BillingError::Storage)?
        {
            Some(sub) => {
                debug!(user_id = %sub.user_id, "Subscription reset to free");
                Ok(ApplyOutcome::Applied(sub))
            }
            None => {
                warn!(external_ref = %object.id, "Deletion for unknown subscription");
                Ok(ApplyOutcome::Ignored("no matching subscription"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateUser, SubscriptionState};
    use crate::store::{MemoryStore, UserRepository};
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn setup() -> (Arc<MemoryStore>, SubscriptionRegistry, Uuid) {
        let memory = Arc::new(MemoryStore::new());
        let user = memory
            .create_user(CreateUser::new("billing@example.com", "billing"))
            .await
            .unwrap();
        let registry = SubscriptionRegistry::new(memory.clone());
        (memory, registry, user.id)
    }

    fn checkout(user_id: &str, plan: &str, sub_ref: &str) -> BillingEvent {
        let metadata = HashMap::from([
            ("user_id".to_string(), user_id.to_string()),
            ("plan".to_string(), plan.to_string()),
        ]);
        BillingEvent {
            id: "evt_checkout".to_string(),
            kind: BillingEventKind::CheckoutCompleted(CheckoutSession {
                customer: Some("cus_1".to_string()),
                subscription: Some(sub_ref.to_string()),
                metadata,
            }),
        }
    }

    fn subscription_object(sub_ref: &str, cancel: bool) -> SubscriptionObject {
        SubscriptionObject {
            id: sub_ref.to_string(),
            current_period_start: Some(1_717_200_000),
            current_period_end: Some(1_719_792_000),
            cancel_at_period_end: cancel,
        }
    }

    #[tokio::test]
    async fn test_no_record_means_free() {
        let (_, registry, user) = setup().await;
        assert_eq!(registry.current_plan(user).await.unwrap(), Plan::Free);
        assert!(registry.subscription(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_checkout_is_pending_and_grants_nothing() {
        let (_, registry, user) = setup().await;
        let sub = registry
            .begin_checkout(user, Plan::Pro, Some("cus_1".to_string()))
            .await
            .unwrap();
        assert_eq!(sub.state(), SubscriptionState::Pending);
        assert_eq!(registry.current_plan(user).await.unwrap(), Plan::Free);
    }

    #[tokio::test]
    async fn test_checkout_replay_is_noop() {
        let (_, registry, user) = setup().await;
        let event = checkout(&user.to_string(), "pro", "sub_1");

        let ApplyOutcome::Applied(first) = registry.apply(&event).await.unwrap() else {
            panic!("first delivery not applied");
        };
        let ApplyOutcome::Applied(second) = registry.apply(&event).await.unwrap() else {
            panic!("replay not applied");
        };
        assert_eq!(first, second);
        assert_eq!(registry.current_plan(user).await.unwrap(), Plan::Pro);
        assert_eq!(registry.plan_stats().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (_, registry, user) = setup().await;
        registry.begin_checkout(user, Plan::Starter, None).await.unwrap();
        registry
            .apply(&checkout(&user.to_string(), "starter", "sub_1"))
            .await
            .unwrap();

        let cancelling = BillingEvent {
            id: "evt_upd".to_string(),
            kind: BillingEventKind::SubscriptionUpdated(subscription_object("sub_1", true)),
        };
        registry.apply(&cancelling).await.unwrap();
        let sub = registry.subscription(user).await.unwrap().unwrap();
        assert_eq!(sub.state(), SubscriptionState::Cancelling);
        assert_eq!(sub.period_end.unwrap().timestamp(), 1_719_792_000);
        let inside = DateTime::from_timestamp(1_719_000_000, 0).unwrap();
        assert_eq!(registry.current_plan_at(user, inside).await.unwrap(), Plan::Starter);
        // the cancelled period is long over
        assert_eq!(registry.current_plan(user).await.unwrap(), Plan::Free);

        let deleted = BillingEvent {
            id: "evt_del".to_string(),
            kind: BillingEventKind::SubscriptionDeleted(subscription_object("sub_1", false)),
        };
        registry.apply(&deleted).await.unwrap();
        let sub = registry.subscription(user).await.unwrap().unwrap();
        assert_eq!(sub.state(), SubscriptionState::Free);
        assert!(sub.external_subscription_ref.is_none());
        assert_eq!(registry.current_plan(user).await.unwrap(), Plan::Free);

        // a late duplicate deletion finds nothing
        assert_eq!(
            registry.apply(&deleted).await.unwrap(),
            ApplyOutcome::Ignored("no matching subscription")
        );
    }

    #[tokio::test]
    async fn test_checkout_after_deletion_is_ignored() {
        let (_, registry, user) = setup().await;
        let event = checkout(&user.to_string(), "pro", "sub_1");
        registry.apply(&event).await.unwrap();
        registry
            .apply(&BillingEvent {
                id: "evt_del".to_string(),
                kind: BillingEventKind::SubscriptionDeleted(subscription_object("sub_1", false)),
            })
            .await
            .unwrap();

        assert_eq!(
            registry.apply(&event).await.unwrap(),
            ApplyOutcome::Ignored("subscription already terminated")
        );
        assert_eq!(registry.current_plan(user).await.unwrap(), Plan::Free);
    }

    #[tokio::test]
    async fn test_update_before_checkout_is_ignored() {
        let (_, registry, _) = setup().await;
        let event = BillingEvent {
            id: "evt_early".to_string(),
            kind: BillingEventKind::SubscriptionUpdated(subscription_object("sub_unknown", false)),
        };
        assert!(matches!(
            registry.apply(&event).await.unwrap(),
            ApplyOutcome::Ignored(_)
        ));
    }

    #[tokio::test]
    async fn test_checkout_metadata_handling() {
        let (_, registry, user) = setup().await;

        let missing = BillingEvent {
            id: "evt_nometa".to_string(),
            kind: BillingEventKind::CheckoutCompleted(CheckoutSession {
                customer: None,
                subscription: Some("sub_x".to_string()),
                metadata: HashMap::new(),
            }),
        };
        assert!(matches!(
            registry.apply(&missing).await.unwrap(),
            ApplyOutcome::Ignored(_)
        ));

        let bad_plan = checkout(&user.to_string(), "platinum", "sub_x");
        assert!(matches!(
            registry.apply(&bad_plan).await,
            Err(BillingError::Malformed(_))
        ));

        let bad_user = checkout("not-a-uuid", "pro", "sub_x");
        assert!(matches!(
            registry.apply(&bad_user).await,
            Err(BillingError::Malformed(_))
        ));

        let unknown_user = checkout(&Uuid::new_v4().to_string(), "pro", "sub_x");
        assert_eq!(
            registry.apply(&unknown_user).await.unwrap(),
            ApplyOutcome::Ignored("unknown user")
        );
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces() {
        let (memory, registry, user) = setup().await;
        memory.set_offline(true);
        assert!(registry.current_plan(user).await.unwrap_err().is_unavailable());
        assert!(matches!(
            registry.apply(&checkout(&user.to_string(), "pro", "sub_1")).await,
            Err(BillingError::Storage(_))
        ));
    }
}
