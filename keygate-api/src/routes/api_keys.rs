/// API key management endpoints
///
/// This module provides CRUD endpoints for API key management.
/// All endpoints require the owner's JWT; a key can only be changed by the
/// user who owns it.
///
/// # Endpoints
///
/// - `POST /v1/api-keys` - Issue API key
/// - `GET /v1/api-keys` - List API keys
/// - `POST /v1/api-keys/:id/toggle` - Flip active flag
/// - `POST /v1/api-keys/:id/revoke` - Deactivate API key
/// - `DELETE /v1/api-keys/:id` - Delete API key

use crate::{
    app::{AppState, OwnerContext},
    error::ApiResult,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use keygate_shared::models::ApiKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Create API key request
#[derive(Debug, Deserialize, Validate)]
pub struct CreateApiKeyRequest {
    /// API key name/description
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
}

/// Create API key response
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateApiKeyResponse {
    pub id: Uuid,

    /// The plaintext API key (ONLY returned on creation)
    ///
    /// IMPORTANT: This is the only time the plaintext key is shown.
    /// Store it securely as it cannot be retrieved later.
    pub key: String,

    pub name: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
}

/// API key list item (masked)
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiKeyListItem {
    pub id: Uuid,
    pub name: String,

    /// Key prefix (e.g., "kg_7Hq2xPz")
    pub key_prefix: String,

    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<ApiKey> for ApiKeyListItem {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id,
            name: key.display_name,
            key_prefix: key.key_prefix,
            active: key.active,
            created_at: key.created_at,
            last_used_at: key.last_used_at,
        }
    }
}

/// List API keys response
#[derive(Debug, Serialize, Deserialize)]
pub struct ListApiKeysResponse {
    pub keys: Vec<ApiKeyListItem>,

    /// Active keys currently held
    pub active: usize,

    /// Maximum active keys per user
    pub max_active: u32,
}

/// Issue API key
///
/// # Endpoint
///
/// ```text
/// POST /v1/api-keys
/// Authorization: Bearer <jwt_token>
/// Content-Type: application/json
///
/// { "name": "Production Server" }
/// ```
///
/// # Response
///
/// ```json
/// {
///   "id": "uuid",
///   "key": "kg_7Hq2xPz...",
///   "name": "Production Server",
///   "key_prefix": "kg_7Hq2xPz",
///   "created_at": "2025-01-03T12:00:00Z"
/// }
/// ```
///
/// # Errors
///
/// - `401 Unauthorized`: Missing or invalid JWT token
/// - `409 Conflict` (`quota_exceeded`): Active key cap reached
/// - `422 Unprocessable Entity`: Validation failed
pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Json(req): Json<CreateApiKeyRequest>,
) -> ApiResult<(StatusCode, Json<CreateApiKeyResponse>)> {
    req.validate()?;

    let issued = state.credentials.issue(owner.user.id, &req.name).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            id: issued.key.id,
            key: issued.token,
            name: issued.key.display_name,
            key_prefix: issued.key.key_prefix,
            created_at: issued.key.created_at,
        }),
    ))
}

/// List API keys
///
/// Newest first. Keys are masked (only prefix shown).
pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
) -> ApiResult<Json<ListApiKeysResponse>> {
    let keys = state.credentials.list(owner.user.id).await?;
    let active = keys.iter().filter(|k| k.active).count();

    Ok(Json(ListApiKeysResponse {
        keys: keys.into_iter().map(ApiKeyListItem::from).collect(),
        active,
        max_active: state.credentials.max_active_keys(),
    }))
}

/// Flip a key's active flag
///
/// Re-activation counts against the active key cap.
///
/// # Errors
///
/// - `403 Forbidden`: Key belongs to another user
/// - `404 Not Found`: No such key
/// - `409 Conflict` (`quota_exceeded`): Re-activation would exceed the cap
pub async fn toggle_api_key(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiKeyListItem>> {
    let key = state.credentials.toggle(id, owner.user.id).await?;
    Ok(Json(key.into()))
}

/// Deactivate a key; already inactive keys are returned unchanged
pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiKeyListItem>> {
    let key = state.credentials.revoke(id, owner.user.id).await?;
    Ok(Json(key.into()))
}

/// Permanently delete a key
///
/// Usage already recorded for the key is kept.
pub async fn delete_api_key(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.credentials.delete(id, owner.user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
