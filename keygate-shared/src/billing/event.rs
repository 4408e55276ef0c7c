//! Billing event payloads
//!
//! Deliveries use the processor's envelope:
//!
//! ```json
//! {
//!   "id": "evt_1Nx...",
//!   "type": "checkout.session.completed",
//!   "data": { "object": { ... } }
//! }
//! ```
//!
//! Only the three lifecycle types below are interpreted; any other type is
//! parsed as [`BillingEventKind::Other`] and acknowledged without effect.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed billing event: {0}")]
pub struct MalformedEvent(pub String);

/// A parsed delivery
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    pub kind: BillingEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEventKind {
    CheckoutCompleted(CheckoutSession),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    Other(String),
}

/// `data.object` of a completed checkout session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub customer: Option<String>,

    #[serde(default)]
    pub subscription: Option<String>,

    /// Set by us when the checkout was created: `user_id` and `plan`
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `data.object` of a subscription event
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,

    #[serde(default)]
    pub current_period_start: Option<i64>,

    #[serde(default)]
    pub current_period_end: Option<i64>,

    #[serde(default)]
    pub cancel_at_period_end: bool,
}

impl SubscriptionObject {
    pub fn period_start(&self) -> Option<DateTime<Utc>> {
        self.current_period_start
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.current_period_end
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

impl BillingEvent {
    /// Parses a raw (already verified) delivery body
    pub fn parse(payload: &[u8]) -> Result<Self, MalformedEvent> {
        let envelope: Envelope =
            serde_json::from_slice(payload).map_err(|e| MalformedEvent(e.to_string()))?;

        let kind = match envelope.kind.as_str() {
            CHECKOUT_COMPLETED => BillingEventKind::CheckoutCompleted(object(envelope.data)?),
            SUBSCRIPTION_UPDATED => BillingEventKind::SubscriptionUpdated(object(envelope.data)?),
            SUBSCRIPTION_DELETED => BillingEventKind::SubscriptionDeleted(object(envelope.data)?),
            _ => BillingEventKind::Other(envelope.kind),
        };

        Ok(BillingEvent {
            id: envelope.id,
            kind,
        })
    }

    pub fn type_name(&self) -> &str {
        match &self.kind {
            BillingEventKind::CheckoutCompleted(_) => CHECKOUT_COMPLETED,
            BillingEventKind::SubscriptionUpdated(_) => SUBSCRIPTION_UPDATED,
            BillingEventKind::SubscriptionDeleted(_) => SUBSCRIPTION_DELETED,
            BillingEventKind::Other(name) => name,
        }
    }
}

fn object<T: serde::de::DeserializeOwned>(data: EnvelopeData) -> Result<T, MalformedEvent> {
    serde_json::from_value(data.object).map_err(|e| MalformedEvent(e.to_string()))
}
