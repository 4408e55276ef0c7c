/// Account administration
///
/// Admin-only endpoints behind the owner JWT. Deactivating an account is the
/// only way a user ends up refused with `account_inactive` by the gate.
///
/// # Endpoints
///
/// - `GET /v1/admin/users?email=` - Look up an account by email
/// - `POST /v1/admin/users/:id/toggle-active` - Flip an account's active flag

use crate::{
    app::{AppState, OwnerContext},
    error::{ApiError, ApiResult},
};
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use keygate_shared::{models::User, store::bounded};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct UserLookupQuery {
    pub email: String,
}

/// Refuses callers without the admin flag
pub fn require_admin(owner: &OwnerContext) -> ApiResult<()> {
    if owner.user.admin {
        return Ok(());
    }
    tracing::warn!(user_id = %owner.user.id, "Non-admin called an admin endpoint");
    Err(ApiError::Forbidden("Admin access required".to_string()))
}

/// Find an account by email (case-insensitive)
///
/// # Errors
///
/// - `403 Forbidden`: Caller is not an admin
/// - `404 Not Found`: No account with that email
pub async fn find_user(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Query(query): Query<UserLookupQuery>,
) -> ApiResult<Json<User>> {
    require_admin(&owner)?;

    bounded(
        state.config.storage_timeout(),
        state.store.find_user_by_email(&query.email),
    )
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound("User not found".to_string()))
}

/// Activate or deactivate an account
///
/// Keys stay as they are; the gate refuses every key of an inactive account.
///
/// # Errors
///
/// - `400 Bad Request`: Admin targeted their own account
/// - `403 Forbidden`: Caller is not an admin
/// - `404 Not Found`: No such user
pub async fn toggle_user_active(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<User>> {
    require_admin(&owner)?;
    if id == owner.user.id {
        return Err(ApiError::BadRequest(
            "You cannot deactivate your own account".to_string(),
        ));
    }

    let timeout = state.config.storage_timeout();
    let mut user = bounded(timeout, state.store.find_user(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let active = !user.active;
    if !bounded(timeout, state.store.set_user_active(id, active)).await? {
        return Err(ApiError::NotFound("User not found".to_string()));
    }
    user.active = active;

    tracing::info!(
        admin_id = %owner.user.id,
        user_id = %id,
        active,
        "Account active flag changed"
    );
    Ok(Json(user))
}
