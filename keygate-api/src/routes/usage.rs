/// Usage reporting endpoints
///
/// # Endpoints
///
/// - `GET /v1/usage` - Caller's quota standing (API key, not metered)
/// - `GET /v1/developer/usage?days=N` - Owner's recent events and endpoint stats
/// - `GET /v1/admin/stats?days=N` - Platform-wide dashboard (admins only)

use crate::{
    app::{AppState, OwnerContext},
    error::{ApiError, ApiResult},
    routes::admin::require_admin,
};
use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use keygate_shared::{
    auth::ResolvedCredential,
    ledger::MAX_RECENT_EVENTS,
    models::{DailyCount, EndpointStats, Plan, PlanCount, TopUser, UsageEvent, UserCounts},
    quota::{PlanLimits, QuotaSnapshot},
    store::bounded,
};
use serde::{Deserialize, Serialize};

/// Default look-back for dashboards
pub const DEFAULT_DAYS: i64 = 30;

/// Longest look-back accepted
pub const MAX_DAYS: i64 = 365;

/// Rows in the admin top-users table
pub const TOP_USERS_LIMIT: i64 = 10;

/// Dashboard look-back window
#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub days: Option<i64>,
}

impl DaysQuery {
    fn since(&self, now: DateTime<Utc>) -> ApiResult<(i64, DateTime<Utc>)> {
        let days = self.days.unwrap_or(DEFAULT_DAYS);
        if !(1..=MAX_DAYS).contains(&days) {
            return Err(ApiError::BadRequest(format!(
                "days must be between 1 and {MAX_DAYS}"
            )));
        }
        Ok((days, now - Duration::days(days)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WindowCounts {
    pub daily: u64,
    pub monthly: u64,
}

/// `null` means unlimited
#[derive(Debug, Serialize, Deserialize)]
pub struct WindowRemaining {
    pub daily: Option<u64>,
    pub monthly: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WindowResets {
    pub daily: DateTime<Utc>,
    pub monthly: DateTime<Utc>,
}

/// Quota standing of the calling key's owner
#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub plan: Plan,
    pub usage: WindowCounts,
    pub limits: PlanLimits,
    pub remaining: WindowRemaining,
    pub resets_at: WindowResets,
}

impl From<QuotaSnapshot> for UsageResponse {
    fn from(snapshot: QuotaSnapshot) -> Self {
        Self {
            plan: snapshot.plan,
            usage: WindowCounts {
                daily: snapshot.daily_used,
                monthly: snapshot.monthly_used,
            },
            limits: snapshot.limits,
            remaining: WindowRemaining {
                daily: snapshot.daily_remaining,
                monthly: snapshot.monthly_remaining,
            },
            resets_at: WindowResets {
                daily: snapshot.daily_resets_at,
                monthly: snapshot.monthly_resets_at,
            },
        }
    }
}

/// Owner dashboard
#[derive(Debug, Serialize, Deserialize)]
pub struct DeveloperUsageResponse {
    pub days: i64,
    pub summary: UsageResponse,
    pub endpoints: Vec<EndpointStats>,

    /// Newest first, at most 1000
    pub recent: Vec<UsageEvent>,
}

/// Platform dashboard
#[derive(Debug, Serialize, Deserialize)]
pub struct AdminStatsResponse {
    pub days: i64,
    pub requests_today: u64,
    pub users: UserCounts,
    pub plans: Vec<PlanCount>,
    pub daily: Vec<DailyCount>,
    pub top_users: Vec<TopUser>,
}

/// Current usage against the plan, for the key's owner
///
/// Reading this endpoint never consumes quota.
///
/// # Response
///
/// ```json
/// {
///   "plan": "free",
///   "usage": { "daily": 12, "monthly": 340 },
///   "limits": { "daily": 100, "monthly": 1000 },
///   "remaining": { "daily": 88, "monthly": 660 },
///   "resets_at": { "daily": "2025-01-04T00:00:00Z", "monthly": "2025-02-01T00:00:00Z" }
/// }
/// ```
pub async fn current_usage(
    State(state): State<AppState>,
    Extension(credential): Extension<ResolvedCredential>,
) -> ApiResult<Json<UsageResponse>> {
    let snapshot = state.quota.snapshot(credential.user.id, Utc::now()).await?;
    Ok(Json(snapshot.into()))
}

/// Owner dashboard: summary, per-endpoint stats and recent events
pub async fn developer_usage(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<Json<DeveloperUsageResponse>> {
    let now = Utc::now();
    let (days, since) = query.since(now)?;
    let user_id = owner.user.id;

    let summary = state.quota.snapshot(user_id, now).await?;
    let endpoints = state.ledger.aggregate_by_endpoint(user_id, since).await?;
    let recent = state
        .ledger
        .list_recent(user_id, since, MAX_RECENT_EVENTS)
        .await?;

    Ok(Json(DeveloperUsageResponse {
        days,
        summary: summary.into(),
        endpoints,
        recent,
    }))
}

/// Platform dashboard
///
/// # Errors
///
/// - `403 Forbidden`: Caller is not an admin
pub async fn admin_stats(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<Json<AdminStatsResponse>> {
    require_admin(&owner)?;

    let now = Utc::now();
    let (days, since) = query.since(now)?;

    let users = bounded(state.config.storage_timeout(), state.store.user_counts()).await?;
    let requests_today = state.ledger.count_today(now).await?;
    let plans = state.registry.plan_stats().await?;
    let daily = state.ledger.aggregate_by_day(since).await?;
    let top_users = state.ledger.top_users(since, TOP_USERS_LIMIT).await?;

    Ok(Json(AdminStatsResponse {
        days,
        requests_today,
        users,
        plans,
        daily,
        top_users,
    }))
}
