/// Billing endpoints
///
/// # Endpoints
///
/// - `POST /v1/billing/webhook` - Payment processor events (signature checked)
/// - `POST /v1/billing/checkout` - Record a started purchase (owner JWT)
/// - `GET /v1/billing/subscription` - Current plan and period (owner JWT)
///
/// The webhook reads the raw body: the signature covers the exact bytes sent,
/// so the payload must not be re-serialized before verification.

use crate::{
    app::{AppState, OwnerContext},
    error::{ApiError, ApiResult},
};
use axum::{
    extract::State,
    http::HeaderMap,
    Extension, Json,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use keygate_shared::{
    billing::{verify_and_parse, ApplyOutcome, SIGNATURE_HEADER},
    models::{Plan, Subscription, SubscriptionState},
    quota::PlanLimits,
};
use serde::{Deserialize, Serialize};

/// Webhook acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub received: bool,

    /// False when the event was acknowledged without effect
    pub applied: bool,
}

/// Start checkout request
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: Plan,

    /// Processor customer id, when the client already has one
    #[serde(default)]
    pub customer_ref: Option<String>,
}

/// Subscription status
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    /// Plan whose limits apply now
    pub plan: Plan,

    pub state: SubscriptionState,
    pub limits: PlanLimits,

    /// Plan being purchased while a checkout is pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_plan: Option<Plan>,

    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub days_remaining: i64,
}

impl SubscriptionResponse {
    fn from_record(sub: Option<&Subscription>, now: DateTime<Utc>) -> Self {
        let Some(sub) = sub else {
            return Self {
                plan: Plan::Free,
                state: SubscriptionState::Free,
                limits: PlanLimits::for_plan(Plan::Free),
                pending_plan: None,
                period_end: None,
                cancel_at_period_end: false,
                days_remaining: 0,
            };
        };

        let plan = sub.effective_plan(now);
        let state = sub.state();
        Self {
            plan,
            state,
            limits: PlanLimits::for_plan(plan),
            pending_plan: (state == SubscriptionState::Pending).then_some(sub.plan),
            period_end: sub.period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
            days_remaining: sub.days_remaining(now),
        }
    }
}

/// Payment processor webhook
///
/// # Endpoint
///
/// ```text
/// POST /v1/billing/webhook
/// Stripe-Signature: t=1717430400,v1=5257a869...
///
/// {"id": "evt_...", "type": "checkout.session.completed", "data": {"object": {...}}}
/// ```
///
/// # Errors
///
/// - `400 Bad Request` (`webhook_signature_invalid`): Missing, stale or wrong signature
/// - `400 Bad Request` (`webhook_malformed`): Verified but unusable payload
/// - `503 Service Unavailable`: Storage down; the processor will redeliver
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let event = verify_and_parse(
        &body,
        signature,
        &state.config.billing.webhook_secret,
        state.config.webhook_tolerance(),
        Utc::now(),
    )?;

    let outcome = state.registry.apply(&event).await?;

    Ok(Json(WebhookResponse {
        received: true,
        applied: matches!(outcome, ApplyOutcome::Applied(_)),
    }))
}

/// Record a started purchase
///
/// The paid plan takes effect only once the processor confirms the checkout.
pub async fn begin_checkout(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    if req.plan == Plan::Free {
        return Err(ApiError::BadRequest(
            "The free plan does not need a checkout".to_string(),
        ));
    }

    let sub = state
        .registry
        .begin_checkout(owner.user.id, req.plan, req.customer_ref)
        .await?;

    Ok(Json(SubscriptionResponse::from_record(Some(&sub), Utc::now())))
}

/// Current plan and billing period
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let sub = state.registry.subscription(owner.user.id).await?;
    Ok(Json(SubscriptionResponse::from_record(sub.as_ref(), Utc::now())))
}
