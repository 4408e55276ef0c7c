/// Usage event model
///
/// One row per request admitted through the access gate. The table is
/// append-only: events are never updated or deleted by the core, and the
/// quota counters are derived from it rather than kept separately.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE usage_events (
///     id BIGSERIAL PRIMARY KEY,
///     user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
///     api_key_id UUID REFERENCES api_keys(id) ON DELETE SET NULL,
///     endpoint VARCHAR(255) NOT NULL,
///     method VARCHAR(16) NOT NULL,
///     status_code INTEGER NOT NULL,
///     response_time_ms DOUBLE PRECISION NOT NULL,
///     occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// CREATE INDEX usage_events_user_time_idx ON usage_events (user_id, occurred_at);
/// ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Recorded request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageEvent {
    /// Monotonic event ID
    pub id: i64,

    /// User the request was billed to
    pub user_id: Uuid,

    /// Key that authenticated the request; cleared if the key is deleted
    pub api_key_id: Option<Uuid>,

    /// Request path, e.g. "/v1/query"
    pub endpoint: String,

    /// HTTP method
    pub method: String,

    /// Status the handler responded with
    pub status_code: i32,

    /// Handler wall-clock time in milliseconds
    pub response_time_ms: f64,

    /// When the request was recorded
    #[sqlx(rename = "occurred_at")]
    pub timestamp: DateTime<Utc>,
}

/// Append payload for the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct NewUsageEvent {
    pub user_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl NewUsageEvent {
    pub fn new(
        user_id: Uuid,
        api_key_id: Option<Uuid>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        status_code: u16,
        elapsed: Duration,
    ) -> Self {
        Self {
            user_id,
            api_key_id,
            endpoint: endpoint.into(),
            method: method.into(),
            status_code,
            response_time_ms: elapsed.as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
        }
    }

    /// Overrides the event timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Requests per UTC calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: i64,
}

/// Request volume and latency for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EndpointStats {
    pub endpoint: String,
    pub count: i64,
    pub mean_response_time_ms: f64,
}

/// A heavy user in a reporting window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopUser {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_converts_elapsed_to_millis() {
        let event = NewUsageEvent::new(
            Uuid::new_v4(),
            None,
            "/v1/query",
            "POST",
            200,
            Duration::from_micros(12_500),
        );
        assert!((event.response_time_ms - 12.5).abs() < f64::EPSILON);
        assert_eq!(event.status_code, 200);
    }
}
