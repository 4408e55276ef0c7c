/// Quota enforcement for per-user request limits
///
/// Every plan caps requests per UTC day and per UTC calendar month.
/// Counts come straight from the usage ledger, so the only state is the
/// ledger itself.
///
/// # Limits by Plan
///
/// | Plan       | Daily     | Monthly   |
/// |------------|-----------|-----------|
/// | free       | 100       | 1,000     |
/// | starter    | 1,000     | 25,000    |
/// | pro        | 10,000    | 250,000   |
/// | enterprise | unlimited | unlimited |
///
/// # Decision
///
/// 1. Resolve the caller's plan (free when there is no active subscription)
/// 2. Unlimited daily limit: admit
/// 3. Daily count at or above the limit: deny (daily)
/// 4. Capped monthly limit and monthly count at or above it: deny (monthly)
/// 5. Otherwise admit
///
/// The check and the later ledger append are not atomic. Concurrent
/// requests can each observe `count < limit` and all be admitted, so a
/// window may overshoot by up to the number of in-flight requests.
///
/// # Example
///
/// ```
/// use keygate_shared::billing::SubscriptionRegistry;
/// use keygate_shared::ledger::UsageLedger;
/// use keygate_shared::quota::{Admission, QuotaEnforcer};
/// use keygate_shared::store::{MemoryStore, SharedStore};
/// use std::sync::Arc;
/// use uuid::Uuid;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store: SharedStore = Arc::new(MemoryStore::new());
/// let enforcer = QuotaEnforcer::new(
///     SubscriptionRegistry::new(store.clone()),
///     UsageLedger::new(store),
/// );
///
/// match enforcer.admit(Uuid::new_v4()).await? {
///     Admission::Admit { plan, .. } => println!("admitted on {plan}"),
///     Admission::Deny(denial) => println!("denied: {}", denial.message()),
/// }
/// # Ok(())
/// # }
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;
use uuid::Uuid;

use crate::billing::SubscriptionRegistry;
use crate::ledger::{day_bounds, month_bounds, UsageLedger};
use crate::models::Plan;
use crate::store::StoreResult;

/// A request limit; unlimited serializes as `-1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Capped(u64),
    Unlimited,
}

impl Limit {
    /// Requests left after `used`, None when unlimited
    pub fn remaining(&self, used: u64) -> Option<u64> {
        match self {
            Limit::Capped(limit) => Some(limit.saturating_sub(used)),
            Limit::Unlimited => None,
        }
    }

    pub fn is_exhausted(&self, used: u64) -> bool {
        matches!(self, Limit::Capped(limit) if used >= *limit)
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Capped(n) => serializer.serialize_u64(*n),
            Limit::Unlimited => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match i64::deserialize(deserializer)? {
            -1 => Ok(Limit::Unlimited),
            n if n >= 0 => Ok(Limit::Capped(n as u64)),
            n => Err(serde::de::Error::custom(format!("invalid limit {n}"))),
        }
    }
}

/// Quota window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Daily,
    Monthly,
}

impl QuotaWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaWindow::Daily => "daily",
            QuotaWindow::Monthly => "monthly",
        }
    }

    /// Half-open window containing `now`
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            QuotaWindow::Daily => day_bounds(now),
            QuotaWindow::Monthly => month_bounds(now),
        }
    }
}

/// Per-plan limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub daily: Limit,
    pub monthly: Limit,
}

impl PlanLimits {
    pub fn for_plan(plan: Plan) -> Self {
        match plan {
            Plan::Free => PlanLimits {
                daily: Limit::Capped(100),
                monthly: Limit::Capped(1_000),
            },
            Plan::Starter => PlanLimits {
                daily: Limit::Capped(1_000),
                monthly: Limit::Capped(25_000),
            },
            Plan::Pro => PlanLimits {
                daily: Limit::Capped(10_000),
                monthly: Limit::Capped(250_000),
            },
            Plan::Enterprise => PlanLimits {
                daily: Limit::Unlimited,
                monthly: Limit::Unlimited,
            },
        }
    }

    pub fn get(&self, window: QuotaWindow) -> Limit {
        match window {
            QuotaWindow::Daily => self.daily,
            QuotaWindow::Monthly => self.monthly,
        }
    }
}

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDenial {
    pub window: QuotaWindow,
    pub plan: Plan,
    pub limit: u64,
    pub current: u64,
    /// Start of the next window
    pub resets_at: DateTime<Utc>,
}

impl QuotaDenial {
    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self.window {
            QuotaWindow::Daily => "daily_limit_exceeded",
            QuotaWindow::Monthly => "monthly_limit_exceeded",
        }
    }

    pub fn message(&self) -> String {
        let window = match self.window {
            QuotaWindow::Daily => "Daily",
            QuotaWindow::Monthly => "Monthly",
        };
        format!(
            "{window} limit of {} requests exceeded on the {} plan",
            self.limit, self.plan
        )
    }

    /// Whole seconds until the window resets, at least one
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.resets_at - now).num_seconds().max(1) as u64
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit { plan: Plan, limits: PlanLimits },
    Deny(QuotaDenial),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit { .. })
    }
}

/// Current standing against both windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub plan: Plan,
    pub limits: PlanLimits,
    pub daily_used: u64,
    pub monthly_used: u64,
    pub daily_remaining: Option<u64>,
    pub monthly_remaining: Option<u64>,
    pub daily_resets_at: DateTime<Utc>,
    pub monthly_resets_at: DateTime<Utc>,
}

/// Admits or denies requests against the caller's plan
#[derive(Clone)]
pub struct QuotaEnforcer {
    registry: SubscriptionRegistry,
    ledger: UsageLedger,
}

impl QuotaEnforcer {
    pub fn new(registry: SubscriptionRegistry, ledger: UsageLedger) -> Self {
        Self { registry, ledger }
    }

    /// Checks `user_id` against the current windows
    pub async fn admit(&self, user_id: Uuid) -> StoreResult<Admission> {
        self.admit_at(user_id, Utc::now()).await
    }

    /// Checks `user_id` against the windows containing `now`
    pub async fn admit_at(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<Admission> {
        let plan = self.registry.current_plan_at(user_id, now).await?;
        let limits = PlanLimits::for_plan(plan);

        if limits.daily == Limit::Unlimited {
            return Ok(Admission::Admit { plan, limits });
        }

        for window in [QuotaWindow::Daily, QuotaWindow::Monthly] {
            let limit = limits.get(window);
            let Limit::Capped(cap) = limit else {
                continue;
            };

            let (start, end) = window.bounds(now);
            let current = self.ledger.count_in_window(user_id, start, end).await?;
            if limit.is_exhausted(current) {
                debug!(
                    user_id = %user_id,
                    plan = %plan,
                    window = window.as_str(),
                    limit = cap,
                    current,
                    "Quota exhausted"
                );
                return Ok(Admission::Deny(QuotaDenial {
                    window,
                    plan,
                    limit: cap,
                    current,
                    resets_at: end,
                }));
            }
        }

        Ok(Admission::Admit { plan, limits })
    }

    /// Usage and remaining allowance in the windows containing `now`
    pub async fn snapshot(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<QuotaSnapshot> {
        let plan = self.registry.current_plan_at(user_id, now).await?;
        let limits = PlanLimits::for_plan(plan);

        let (day_start, day_end) = day_bounds(now);
        let (month_start, month_end) = month_bounds(now);
        let daily_used = self.ledger.count_in_window(user_id, day_start, day_end).await?;
        let monthly_used = self
            .ledger
            .count_in_window(user_id, month_start, month_end)
            .await?;

        Ok(QuotaSnapshot {
            plan,
            limits,
            daily_used,
            monthly_used,
            daily_remaining: limits.daily.remaining(daily_used),
            monthly_remaining: limits.monthly.remaining(monthly_used),
            daily_resets_at: day_end,
            monthly_resets_at: month_end,
        })
    }
}
