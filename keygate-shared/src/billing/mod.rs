//! Billing
//!
//! Plan state driven by the payment processor's webhooks.
//!
//! # Modules
//!
//! - [`signature`]: HMAC verification of deliveries
//! - [`event`]: Parsing of the event envelope
//! - [`registry`]: The subscription registry that applies events
//!
//! A delivery is only trusted after [`verify_and_parse`] succeeds:
//!
//! ```no_run
//! use keygate_shared::billing::{verify_and_parse, DEFAULT_TOLERANCE};
//!
//! # fn example(body: &[u8], header: Option<&str>) -> Result<(), keygate_shared::billing::BillingError> {
//! let event = verify_and_parse(body, header, "whsec_...", DEFAULT_TOLERANCE, chrono::Utc::now())?;
//! println!("{} {}", event.id, event.type_name());
//! # Ok(())
//! # }
//! ```

pub mod event;
pub mod registry;
pub mod signature;

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::store::StoreError;

pub use event::{BillingEvent, BillingEventKind, CheckoutSession, MalformedEvent, SubscriptionObject};
pub use registry::{ApplyOutcome, SubscriptionRegistry};
pub use signature::{sign_payload, verify_signature, SignatureError, DEFAULT_TOLERANCE, SIGNATURE_HEADER};

/// Billing errors
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("webhook signature invalid: {0}")]
    SignatureInvalid(#[from] SignatureError),

    #[error("webhook malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Storage(StoreError),
}

impl From<MalformedEvent> for BillingError {
    fn from(err: MalformedEvent) -> Self {
        BillingError::Malformed(err.0)
    }
}

/// Verifies the signature, then parses the body
pub fn verify_and_parse(
    payload: &[u8],
    signature_header: Option<&str>,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<BillingEvent, BillingError> {
    verify_signature(payload, signature_header, secret, tolerance, now)?;
    Ok(BillingEvent::parse(payload)?)
}
