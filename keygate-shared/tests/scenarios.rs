/// End-to-end scenarios for the gateway core
///
/// Every service runs against the in-memory store, so no database is needed.
/// Run with: cargo test -p keygate-shared --test scenarios

use chrono::{DateTime, Duration, Utc};
use keygate_shared::auth::api_key::generate_api_key;
use keygate_shared::auth::{CredentialError, CredentialStore};
use keygate_shared::billing::{
    sign_payload, verify_and_parse, ApplyOutcome, SubscriptionRegistry, DEFAULT_TOLERANCE,
};
use keygate_shared::gate::{AccessGate, GateError};
use keygate_shared::ledger::UsageLedger;
use keygate_shared::models::{CreateUser, NewUsageEvent, Plan, User};
use keygate_shared::quota::{Admission, QuotaEnforcer, QuotaWindow};
use keygate_shared::store::{MemoryStore, SharedStore, UserRepository};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

const WEBHOOK_SECRET: &str = "whsec_scenarios";

struct Harness {
    memory: Arc<MemoryStore>,
    credentials: CredentialStore,
    ledger: UsageLedger,
    registry: SubscriptionRegistry,
    quota: QuotaEnforcer,
    gate: AccessGate,
}

impl Harness {
    fn new() -> Self {
        let memory = Arc::new(MemoryStore::new());
        let store: SharedStore = memory.clone();
        let credentials = CredentialStore::new(store.clone(), 10);
        let ledger = UsageLedger::new(store.clone());
        let registry = SubscriptionRegistry::new(store);
        let quota = QuotaEnforcer::new(registry.clone(), ledger.clone());
        let gate = AccessGate::new(credentials.clone(), quota.clone(), ledger.clone());
        Self {
            memory,
            credentials,
            ledger,
            registry,
            quota,
            gate,
        }
    }

    async fn user(&self, name: &str) -> User {
        self.memory
            .create_user(CreateUser::new(format!("{name}@example.com"), name))
            .await
            .unwrap()
    }

    async fn log_requests(&self, user: &User, n: usize, at: DateTime<Utc>) {
        for _ in 0..n {
            self.ledger
                .record(
                    NewUsageEvent::new(
                        user.id,
                        None,
                        "/v1/query",
                        "POST",
                        200,
                        std::time::Duration::from_millis(2),
                    )
                    .at(at),
                )
                .await
                .unwrap();
        }
    }

    /// Delivers a signed webhook, as the processor would
    async fn deliver(&self, body: serde_json::Value) -> ApplyOutcome {
        let payload = serde_json::to_vec(&body).unwrap();
        let now = Utc::now();
        let header = sign_payload(&payload, WEBHOOK_SECRET, now.timestamp()).unwrap();
        let event =
            verify_and_parse(&payload, Some(&header), WEBHOOK_SECRET, DEFAULT_TOLERANCE, now)
                .unwrap();
        self.registry.apply(&event).await.unwrap()
    }

    async fn purchase(&self, user: &User, plan: Plan, sub_ref: &str) {
        self.registry
            .begin_checkout(user.id, plan, Some("cus_test".to_string()))
            .await
            .unwrap();
        self.deliver(json!({
            "id": format!("evt_checkout_{sub_ref}"),
            "type": "checkout.session.completed",
            "data": { "object": {
                "customer": "cus_test",
                "subscription": sub_ref,
                "metadata": { "user_id": user.id.to_string(), "plan": plan.as_str() }
            }}
        }))
        .await;
    }
}

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn test_generated_tokens_are_unique() {
    let mut seen = HashSet::new();
    for _ in 0..2_000 {
        let (token, hash) = generate_api_key();
        assert!(seen.insert(token));
        assert!(seen.insert(hash));
    }

    let h = Harness::new();
    let mut issued = HashSet::new();
    for i in 0..5 {
        let user = h.user(&format!("owner{i}")).await;
        for j in 0..10 {
            let key = h.credentials.issue(user.id, &format!("key {j}")).await.unwrap();
            assert!(issued.insert(key.token));
        }
    }
    assert_eq!(issued.len(), 50);
}

#[tokio::test]
async fn test_revoked_deleted_and_unknown_keys_look_alike() {
    let h = Harness::new();
    let user = h.user("alice").await;
    let revoked = h.credentials.issue(user.id, "revoked").await.unwrap();
    let deleted = h.credentials.issue(user.id, "deleted").await.unwrap();
    h.credentials.revoke(revoked.key.id, user.id).await.unwrap();
    h.credentials.delete(deleted.key.id, user.id).await.unwrap();
    let (never_issued, _) = generate_api_key();

    let mut messages = Vec::new();
    for token in [&revoked.token, &deleted.token, &never_issued] {
        let err = h.credentials.resolve(token).await.unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKey));
        messages.push(err.to_string());

        let gate_err = h.gate.admit(Some(token)).await.unwrap_err();
        assert_eq!(gate_err.code(), "invalid_key");
    }
    messages.dedup();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_free_plan_admits_100_then_denies() {
    let h = Harness::new();
    let user = h.user("free").await;
    let now = at("2024-06-12T15:00:00Z");

    h.log_requests(&user, 99, now).await;
    assert!(h.quota.admit_at(user.id, now).await.unwrap().is_admitted());

    h.log_requests(&user, 1, now).await;
    match h.quota.admit_at(user.id, now).await.unwrap() {
        Admission::Deny(denial) => {
            assert_eq!(denial.reason(), "daily_limit_exceeded");
            assert_eq!(denial.limit, 100);
            assert_eq!(denial.current, 100);
        }
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_midnight_boundary() {
    let h = Harness::new();
    let user = h.user("boundary").await;
    let today = at("2024-06-12T10:00:00Z");

    h.log_requests(&user, 100, at("2024-06-11T23:59:59Z")).await;
    assert!(h.quota.admit_at(user.id, today).await.unwrap().is_admitted());

    h.log_requests(&user, 100, at("2024-06-12T00:00:00Z")).await;
    assert!(!h.quota.admit_at(user.id, today).await.unwrap().is_admitted());
}

#[tokio::test]
async fn test_duplicate_checkout_delivery_is_noop() {
    let h = Harness::new();
    let user = h.user("buyer").await;
    h.purchase(&user, Plan::Pro, "sub_dup").await;
    let before = h.registry.subscription(user.id).await.unwrap().unwrap();

    let replay = h
        .deliver(json!({
            "id": "evt_checkout_sub_dup",
            "type": "checkout.session.completed",
            "data": { "object": {
                "customer": "cus_test",
                "subscription": "sub_dup",
                "metadata": { "user_id": user.id.to_string(), "plan": "pro" }
            }}
        }))
        .await;

    assert_eq!(replay, ApplyOutcome::Applied(before.clone()));
    assert_eq!(h.registry.subscription(user.id).await.unwrap(), Some(before));
    let stats = h.registry.plan_stats().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].plan, Plan::Pro);
    assert_eq!(stats[0].count, 1);
}

#[tokio::test]
async fn test_non_owner_cannot_touch_key() {
    let h = Harness::new();
    let owner = h.user("owner").await;
    let intruder = h.user("intruder").await;
    let key = h.credentials.issue(owner.id, "prod").await.unwrap();

    for result in [
        h.credentials.revoke(key.key.id, intruder.id).await.map(|_| ()),
        h.credentials.toggle(key.key.id, intruder.id).await.map(|_| ()),
        h.credentials.delete(key.key.id, intruder.id).await,
    ] {
        assert!(matches!(result, Err(CredentialError::Forbidden)));
    }

    let keys = h.credentials.list(owner.id).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].active);
    assert!(h.credentials.resolve(&key.token).await.is_ok());
}

#[tokio::test]
async fn test_starter_plan_end_to_end() {
    let h = Harness::new();
    let user = h.user("starter").await;
    h.purchase(&user, Plan::Starter, "sub_starter").await;
    let key = h.credentials.issue(user.id, "K").await.unwrap();

    h.log_requests(&user, 999, Utc::now()).await;

    let status = h
        .gate
        .process(Some(&key.token), "/v1/query", "POST", |caller| async move {
            assert_eq!(caller.plan, Plan::Starter);
            200u16
        })
        .await
        .unwrap();
    assert_eq!(status, 200);

    let err = h
        .gate
        .process(Some(&key.token), "/v1/query", "POST", |_| async { 200u16 })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "rate_limit_exceeded");
    let GateError::RateLimitExceeded(denial) = err else {
        unreachable!()
    };
    assert_eq!(denial.window, QuotaWindow::Daily);
    assert_eq!(denial.limit, 1000);
    assert_eq!(denial.plan, Plan::Starter);
}

#[tokio::test]
async fn test_deleted_subscription_falls_back_to_free_limits() {
    let h = Harness::new();
    let user = h.user("churned").await;
    h.purchase(&user, Plan::Pro, "sub_pro").await;

    let now = Utc::now();
    h.log_requests(&user, 150, now).await;
    assert!(h.quota.admit_at(user.id, now).await.unwrap().is_admitted());

    let outcome = h
        .deliver(json!({
            "id": "evt_deleted",
            "type": "customer.subscription.deleted",
            "data": { "object": { "id": "sub_pro" } }
        }))
        .await;
    assert!(matches!(outcome, ApplyOutcome::Applied(_)));

    match h.quota.admit_at(user.id, now).await.unwrap() {
        Admission::Deny(denial) => {
            assert_eq!(denial.plan, Plan::Free);
            assert_eq!(denial.limit, 100);
        }
        other => panic!("expected free-plan denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_and_delete_arrive_out_of_order() {
    let h = Harness::new();
    let user = h.user("racy").await;
    h.purchase(&user, Plan::Pro, "sub_racy").await;

    h.deliver(json!({
        "id": "evt_del",
        "type": "customer.subscription.deleted",
        "data": { "object": { "id": "sub_racy" } }
    }))
    .await;
    let late_update = h
        .deliver(json!({
            "id": "evt_upd",
            "type": "customer.subscription.updated",
            "data": { "object": { "id": "sub_racy", "cancel_at_period_end": true } }
        }))
        .await;

    assert!(matches!(late_update, ApplyOutcome::Ignored(_)));
    assert_eq!(h.registry.current_plan(user.id).await.unwrap(), Plan::Free);
}

#[tokio::test]
async fn test_checkout_redelivered_after_deletion_stays_free() {
    let h = Harness::new();
    let user = h.user("lapsed").await;
    let checkout = json!({
        "id": "evt_checkout_sub_lapsed",
        "type": "checkout.session.completed",
        "data": { "object": {
            "customer": "cus_test",
            "subscription": "sub_lapsed",
            "metadata": { "user_id": user.id.to_string(), "plan": "pro" }
        }}
    });

    assert!(matches!(
        h.deliver(checkout.clone()).await,
        ApplyOutcome::Applied(_)
    ));
    h.deliver(json!({
        "id": "evt_del_lapsed",
        "type": "customer.subscription.deleted",
        "data": { "object": { "id": "sub_lapsed" } }
    }))
    .await;

    let late = h.deliver(checkout).await;
    assert_eq!(late, ApplyOutcome::Ignored("subscription already terminated"));
    assert_eq!(h.registry.current_plan(user.id).await.unwrap(), Plan::Free);
    assert!(h.registry.plan_stats().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deletion_delivered_before_checkout_wins() {
    let h = Harness::new();
    let user = h.user("reordered").await;

    let early = h
        .deliver(json!({
            "id": "evt_del_early",
            "type": "customer.subscription.deleted",
            "data": { "object": { "id": "sub_early" } }
        }))
        .await;
    assert!(matches!(early, ApplyOutcome::Ignored(_)));

    h.purchase(&user, Plan::Starter, "sub_early").await;
    assert_eq!(h.registry.current_plan(user.id).await.unwrap(), Plan::Free);
}

#[tokio::test]
async fn test_cancelled_period_end_applies_free_limits_before_deletion() {
    let h = Harness::new();
    let user = h.user("lapsing").await;
    h.purchase(&user, Plan::Pro, "sub_lapsing").await;

    let ended = Utc::now() - Duration::hours(1);
    h.deliver(json!({
        "id": "evt_upd_lapsing",
        "type": "customer.subscription.updated",
        "data": { "object": {
            "id": "sub_lapsing",
            "current_period_start": (ended - Duration::days(30)).timestamp(),
            "current_period_end": ended.timestamp(),
            "cancel_at_period_end": true
        }}
    }))
    .await;

    let now = Utc::now();
    h.log_requests(&user, 100, now).await;
    match h.quota.admit_at(user.id, now).await.unwrap() {
        Admission::Deny(denial) => assert_eq!(denial.plan, Plan::Free),
        other => panic!("expected free-plan denial, got {other:?}"),
    }
}

/// Admission and recording are separate steps, so concurrent requests from one
/// user may overshoot the cap by up to the number in flight.
#[tokio::test]
async fn test_concurrent_overshoot_is_bounded_by_concurrency() {
    let h = Harness::new();
    let user = h.user("burst").await;
    let key = h.credentials.issue(user.id, "burst").await.unwrap();
    h.log_requests(&user, 99, Utc::now()).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gate = h.gate.clone();
        let token = key.token.clone();
        handles.push(tokio::spawn(async move {
            gate.process(Some(&token), "/v1/query", "POST", |_| async { 200u16 })
                .await
                .is_ok()
        }));
    }

    let mut admitted = 0u64;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert!((1..=8).contains(&admitted));
    let (start, end) = QuotaWindow::Daily.bounds(Utc::now());
    let used = h.ledger.count_in_window(user.id, start, end).await.unwrap();
    assert_eq!(used, 99 + admitted);

    let later = Utc::now() + Duration::seconds(1);
    if QuotaWindow::Daily.bounds(later) == (start, end) {
        assert!(!h.quota.admit_at(user.id, later).await.unwrap().is_admitted());
    }
}
