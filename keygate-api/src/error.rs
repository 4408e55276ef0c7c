/// Error handling for the API server
///
/// This module provides a unified error type that maps to HTTP responses.
/// All handlers should return `Result<T, ApiError>` which automatically
/// converts to appropriate HTTP status codes.
///
/// Every error body has the same shape:
///
/// ```json
/// { "error": "rate_limit_exceeded", "message": "Daily limit of 100 requests exceeded on the free plan" }
/// ```
///
/// Rate-limit denials add `reason`, `plan`, `window`, `limit`, `current`,
/// `limits` (`-1` meaning unlimited) and `resets_at`, plus a `Retry-After` header.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use keygate_shared::{
    auth::{jwt::JwtError, CredentialError},
    billing::BillingError,
    gate::GateError,
    models::Plan,
    quota::{PlanLimits, QuotaDenial, QuotaWindow},
    store::StoreError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// API result type alias
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400)
    BadRequest(String),

    /// Unauthorized (401) - owner session problems
    Unauthorized(String),

    /// Forbidden (403)
    Forbidden(String),

    /// Not found (404)
    NotFound(String),

    /// Conflict (409)
    Conflict(String),

    /// Unprocessable entity (422) - validation errors
    ValidationError(Vec<ValidationErrorDetail>),

    /// No API key presented (401)
    MissingCredential,

    /// Unknown, revoked or deleted API key (401)
    InvalidKey,

    /// Key owner is deactivated (403)
    AccountInactive,

    /// Plan quota exhausted (429)
    RateLimitExceeded(QuotaDenial),

    /// Active key cap reached (409)
    KeyQuotaExceeded { limit: u32 },

    /// Webhook failed verification (400); the failed check is not disclosed
    WebhookSignatureInvalid,

    /// Webhook verified but unusable (400)
    WebhookMalformed(String),

    /// Internal server error (500)
    InternalError(String),

    /// Storage unreachable or too slow (503)
    ServiceUnavailable(String),
}

/// Validation error detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    /// Field that failed validation
    pub field: String,

    /// Error message
    pub message: String,
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code (e.g., "invalid_key", "rate_limit_exceeded")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<ValidationErrorDetail>>,

    #[serde(flatten)]
    pub rate_limit: Option<RateLimitBody>,
}

/// Extra fields on a rate-limit denial
#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitBody {
    /// Always `rate_limit_exceeded`
    pub reason: String,

    /// `daily_limit_exceeded` or `monthly_limit_exceeded`
    pub exceeded: String,

    pub plan: Plan,
    pub window: QuotaWindow,
    pub limit: u64,
    pub current: u64,
    pub limits: PlanLimits,
    pub resets_at: DateTime<Utc>,
}

impl From<&QuotaDenial> for RateLimitBody {
    fn from(denial: &QuotaDenial) -> Self {
        Self {
            reason: "rate_limit_exceeded".to_string(),
            exceeded: denial.reason().to_string(),
            plan: denial.plan,
            window: denial.window,
            limit: denial.limit,
            current: denial.current,
            limits: PlanLimits::for_plan(denial.plan),
            resets_at: denial.resets_at,
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_)
            | ApiError::WebhookSignatureInvalid
            | ApiError::WebhookMalformed(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) | ApiError::MissingCredential | ApiError::InvalidKey => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Forbidden(_) | ApiError::AccountInactive => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) | ApiError::KeyQuotaExceeded { .. } => StatusCode::CONFLICT,
            ApiError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable code for the `error` field
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::ValidationError(_) => "validation_error",
            ApiError::MissingCredential => "missing_credential",
            ApiError::InvalidKey => "invalid_key",
            ApiError::AccountInactive => "account_inactive",
            ApiError::RateLimitExceeded(_) => "rate_limit_exceeded",
            ApiError::KeyQuotaExceeded { .. } => "quota_exceeded",
            ApiError::WebhookSignatureInvalid => "webhook_signature_invalid",
            ApiError::WebhookMalformed(_) => "webhook_malformed",
            ApiError::InternalError(_) => "internal_error",
            ApiError::ServiceUnavailable(_) => "storage_unavailable",
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ApiError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ApiError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ApiError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ApiError::ValidationError(errors) => {
                write!(f, "Validation failed: {} errors", errors.len())
            }
            ApiError::MissingCredential => write!(f, "API key required"),
            ApiError::InvalidKey => write!(f, "Invalid API key"),
            ApiError::AccountInactive => write!(f, "Account is inactive"),
            ApiError::RateLimitExceeded(denial) => write!(f, "{}", denial.message()),
            ApiError::KeyQuotaExceeded { limit } => {
                write!(f, "Maximum of {} active API keys reached", limit)
            }
            ApiError::WebhookSignatureInvalid => write!(f, "Invalid webhook signature"),
            ApiError::WebhookMalformed(msg) => write!(f, "Malformed webhook: {}", msg),
            ApiError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            ApiError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let (message, details, rate_limit) = match &self {
            ApiError::ValidationError(errors) => (
                "Request validation failed".to_string(),
                Some(errors.clone()),
                None,
            ),
            ApiError::RateLimitExceeded(denial) => {
                (denial.message(), None, Some(RateLimitBody::from(denial)))
            }
            ApiError::InternalError(msg) => {
                // Log internal errors but don't expose details to clients
                tracing::error!("Internal error: {}", msg);
                ("An internal error occurred".to_string(), None, None)
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::error!("Storage unavailable: {}", msg);
                (
                    "Service temporarily unavailable, retry later".to_string(),
                    None,
                    None,
                )
            }
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg) => (msg.clone(), None, None),
            other => (other.to_string(), None, None),
        };

        let retry_after = match &self {
            ApiError::RateLimitExceeded(denial) => Some(denial.retry_after_secs(Utc::now())),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error: code.to_string(),
            message,
            details,
            rate_limit,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            e if e.is_unavailable() => ApiError::ServiceUnavailable(e.to_string()),
            StoreError::Conflict(constraint) => {
                ApiError::Conflict(format!("Constraint violation: {}", constraint))
            }
            StoreError::KeyLimitReached { limit } => ApiError::KeyQuotaExceeded { limit },
            e => ApiError::InternalError(e.to_string()),
        }
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::MissingCredential => ApiError::MissingCredential,
            GateError::InvalidKey => ApiError::InvalidKey,
            GateError::AccountInactive => ApiError::AccountInactive,
            GateError::RateLimitExceeded(denial) => ApiError::RateLimitExceeded(denial),
            GateError::StorageUnavailable(e) => e.into(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::InvalidKey => ApiError::InvalidKey,
            CredentialError::NotFound => ApiError::NotFound("API key not found".to_string()),
            CredentialError::Forbidden => {
                ApiError::Forbidden("Not the owner of this API key".to_string())
            }
            CredentialError::UnknownOwner => ApiError::Unauthorized("Unknown user".to_string()),
            CredentialError::QuotaExceeded { limit } => ApiError::KeyQuotaExceeded { limit },
            CredentialError::InvalidName(message) => {
                ApiError::ValidationError(vec![ValidationErrorDetail {
                    field: "name".to_string(),
                    message,
                }])
            }
            CredentialError::Storage(e) => e.into(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::SignatureInvalid(reason) => {
                tracing::warn!(%reason, "Rejected webhook delivery");
                ApiError::WebhookSignatureInvalid
            }
            BillingError::Malformed(msg) => ApiError::WebhookMalformed(msg),
            BillingError::Storage(e) => e.into(),
        }
    }
}

/// Convert JWT errors to API errors
impl From<JwtError> for ApiError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => ApiError::Unauthorized("Token expired".to_string()),
            JwtError::InvalidIssuer => ApiError::Unauthorized("Invalid token issuer".to_string()),
            JwtError::CreateError(msg) => ApiError::InternalError(msg),
            _ => ApiError::Unauthorized(format!("Invalid token: {}", err)),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| ValidationErrorDetail {
                    field: field.to_string(),
                    message: e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Invalid {}", field)),
                })
            })
            .collect();
        ApiError::ValidationError(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denial() -> QuotaDenial {
        QuotaDenial {
            window: QuotaWindow::Daily,
            plan: Plan::Starter,
            limit: 1000,
            current: 1000,
            resets_at: Utc::now() + chrono::Duration::hours(3),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::BadRequest("Invalid input".to_string());
        assert_eq!(err.to_string(), "Bad request: Invalid input");

        let err = ApiError::NotFound("Key not found".to_string());
        assert_eq!(err.to_string(), "Not found: Key not found");
    }

    #[tokio::test]
    async fn test_rate_limit_response_carries_plan_and_limits() {
        let response = ApiError::RateLimitExceeded(denial()).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry > 0);

        let body = body_json(response).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["reason"], "rate_limit_exceeded");
        assert_eq!(body["exceeded"], "daily_limit_exceeded");
        assert_eq!(body["plan"], "starter");
        assert_eq!(body["window"], "daily");
        assert_eq!(body["limit"], 1000);
        assert_eq!(body["limits"]["monthly"], 25000);
    }

    #[tokio::test]
    async fn test_signature_failure_does_not_leak_reason() {
        let err: ApiError =
            BillingError::SignatureInvalid(keygate_shared::billing::SignatureError::Stale).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "webhook_signature_invalid");
        assert_eq!(body["message"], "Invalid webhook signature");
    }

    #[tokio::test]
    async fn test_storage_errors_are_503_without_details() {
        let err: ApiError = StoreError::Unavailable("pool timed out".to_string()).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"], "storage_unavailable");
        assert!(!body["message"].as_str().unwrap().contains("pool"));
    }

    #[test]
    fn test_gate_codes_map_to_statuses() {
        assert_eq!(
            ApiError::from(GateError::MissingCredential).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::from(GateError::InvalidKey).code(), "invalid_key");
        assert_eq!(
            ApiError::from(GateError::AccountInactive).status(),
            StatusCode::FORBIDDEN
        );
    }
}
