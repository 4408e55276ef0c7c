/// Liveness check
///
/// `GET /health` needs no credentials and is never metered. It always
/// answers 200 so load balancers keep routing while storage recovers; the
/// body says whether storage answered within the storage timeout.
///
/// ```json
/// { "status": "healthy", "version": "0.1.0", "storage": "reachable", "storage_latency_ms": 1.2 }
/// ```

use crate::{app::AppState, error::ApiResult};
use axum::{extract::State, Json};
use keygate_shared::store::bounded;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: String,
    pub version: String,

    /// `reachable` or `unreachable`
    pub storage: String,

    /// Ping round-trip; absent when storage did not answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_latency_ms: Option<f64>,
}

pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let started = Instant::now();
    let ping = bounded(state.config.storage_timeout(), state.store.ping()).await;

    let (status, storage, latency) = match ping {
        Ok(()) => (
            "healthy",
            "reachable",
            Some(started.elapsed().as_secs_f64() * 1000.0),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not reach storage");
            ("degraded", "unreachable", None)
        }
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: storage.to_string(),
        storage_latency_ms: latency,
    }))
}
