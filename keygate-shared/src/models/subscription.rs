/// Subscription model
///
/// Each user has at most one subscription row. A user without a row, or
/// with an inactive row, is on the free plan. Rows are written only by the
/// subscription registry in response to checkout and billing events.
///
/// # Lifecycle
///
/// ```text
/// Free --begin_checkout--> Pending --checkout completed--> Active
/// Active --updated (cancel_at_period_end)--> Cancelling
/// Active | Cancelling --deleted--> Free
/// ```
///
/// # Schema
///
/// ```sql
/// CREATE TABLE subscriptions (
///     user_id UUID PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
///     plan VARCHAR(20) NOT NULL DEFAULT 'free',
///     active BOOLEAN NOT NULL DEFAULT FALSE,
///     external_customer_ref VARCHAR(255),
///     external_subscription_ref VARCHAR(255) UNIQUE,
///     period_start TIMESTAMPTZ,
///     period_end TIMESTAMPTZ,
///     cancel_at_period_end BOOLEAN NOT NULL DEFAULT FALSE,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Plan tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Plan {
    /// Every plan in the catalog, cheapest first
    pub const ALL: [Plan; 4] = [Plan::Free, Plan::Starter, Plan::Pro, Plan::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }
}

impl Default for Plan {
    fn default() -> Self {
        Plan::Free
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a plan name is not in the catalog
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan: {0}")]
pub struct UnknownPlan(pub String);

impl FromStr for Plan {
    type Err = UnknownPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "starter" => Ok(Plan::Starter),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            _ => Err(UnknownPlan(s.to_string())),
        }
    }
}

/// Stored subscription record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: Uuid,
    pub plan: Plan,
    pub active: bool,
    pub external_customer_ref: Option<String>,
    pub external_subscription_ref: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived lifecycle state of a user's subscription
///
/// A pending row is inactive but already names the plan being purchased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Free,
    Pending,
    Active,
    Cancelling,
}

impl Subscription {
    /// Plan whose limits apply at `now`.
    ///
    /// A cancelling subscription lapses to free once its period ends, even
    /// before the processor's deletion event arrives. A renewing one keeps
    /// its plan until the processor says otherwise.
    pub fn effective_plan(&self, now: DateTime<Utc>) -> Plan {
        let lapsed = self.cancel_at_period_end && self.is_expired(now);
        if self.active && !lapsed {
            self.plan
        } else {
            Plan::Free
        }
    }

    pub fn state(&self) -> SubscriptionState {
        match (self.active, self.cancel_at_period_end) {
            (true, true) => SubscriptionState::Cancelling,
            (true, false) => SubscriptionState::Active,
            (false, _) if self.plan != Plan::Free => SubscriptionState::Pending,
            (false, _) => SubscriptionState::Free,
        }
    }

    /// True once the paid period has ended
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.period_end.map(|end| end <= now).unwrap_or(false)
    }

    /// Whole days left in the current period, zero when expired or unknown
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        self.period_end
            .map(|end| (end - now).num_days().max(0))
            .unwrap_or(0)
    }
}

/// Upsert payload for a completed checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompletion {
    pub user_id: Uuid,
    pub plan: Plan,
    pub external_customer_ref: Option<String>,
    pub external_subscription_ref: Option<String>,
}

/// Billing-period refresh keyed by the external subscription reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodUpdate {
    pub external_subscription_ref: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

/// Number of active subscriptions on a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCount {
    pub plan: Plan,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subscription_at(active: bool, now: DateTime<Utc>) -> Subscription {
        Subscription {
            user_id: Uuid::new_v4(),
            plan: Plan::Pro,
            active,
            external_customer_ref: Some("cus_1".to_string()),
            external_subscription_ref: Some("sub_1".to_string()),
            period_start: Some(now - Duration::days(3)),
            period_end: Some(now + Duration::days(27)),
            cancel_at_period_end: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn subscription(active: bool) -> Subscription {
        subscription_at(active, Utc::now())
    }

    #[test]
    fn test_plan_parse_is_case_insensitive() {
        assert_eq!("Starter".parse::<Plan>().unwrap(), Plan::Starter);
        assert_eq!(" ENTERPRISE ".parse::<Plan>().unwrap(), Plan::Enterprise);
        assert!("platinum".parse::<Plan>().is_err());
    }

    #[test]
    fn test_plan_serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Pro).unwrap(), "\"pro\"");
    }

    #[test]
    fn test_inactive_subscription_is_free() {
        let now = Utc::now();
        assert_eq!(subscription(true).effective_plan(now), Plan::Pro);
        assert_eq!(subscription(false).effective_plan(now), Plan::Free);
    }

    #[test]
    fn test_cancelled_period_lapses_to_free() {
        let now = Utc::now();
        let mut sub = subscription_at(true, now);
        sub.cancel_at_period_end = true;
        assert_eq!(sub.effective_plan(now), Plan::Pro);

        let after = now + Duration::days(28);
        assert_eq!(sub.effective_plan(after), Plan::Free);

        // renewal pending: keeps the plan past period end
        sub.cancel_at_period_end = false;
        assert_eq!(sub.effective_plan(after), Plan::Pro);
    }

    #[test]
    fn test_state_derivation() {
        let mut sub = subscription(true);
        assert_eq!(sub.state(), SubscriptionState::Active);

        sub.cancel_at_period_end = true;
        assert_eq!(sub.state(), SubscriptionState::Cancelling);

        sub.active = false;
        assert_eq!(sub.state(), SubscriptionState::Pending);

        sub.plan = Plan::Free;
        assert_eq!(sub.state(), SubscriptionState::Free);
    }

    #[test]
    fn test_days_remaining_and_expiry() {
        let now = Utc::now();
        let mut sub = subscription_at(true, now);
        assert_eq!(sub.days_remaining(now), 27);
        assert_eq!(sub.days_remaining(now + Duration::hours(1)), 26);
        assert!(!sub.is_expired(now));

        sub.period_end = Some(now - Duration::hours(1));
        assert_eq!(sub.days_remaining(now), 0);
        assert!(sub.is_expired(now));

        sub.period_end = None;
        assert!(!sub.is_expired(now));
    }
}
