/// Access gate middleware
///
/// Puts [`AccessGate`](keygate_shared::gate::AccessGate) in front of a group
/// of routes. Two flavours:
///
/// - [`metered_layer`]: full pipeline; every admitted request is counted
///   against the caller's plan and recorded with its final status and latency
/// - [`key_auth_layer`]: key resolution only, for routes that report on
///   quota and must not consume it
///
/// Handlers behind either layer read the caller from request extensions:
///
/// ```no_run
/// use axum::Extension;
/// use keygate_shared::gate::AdmittedCaller;
///
/// async fn handler(Extension(caller): Extension<AdmittedCaller>) -> String {
///     format!("plan: {}", caller.plan)
/// }
/// ```

use crate::{app::AppState, error::ApiError};
use axum::{
    extract::{OriginalUri, Request, State},
    middleware::Next,
    response::Response,
};
use keygate_shared::gate::extract_credential;

/// Full access-gate pipeline around the wrapped routes
pub async fn metered_layer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let credential = extract_credential(req.headers(), req.uri());

    // Nested routers see a stripped path; meter the path the client called
    let endpoint = req
        .extensions()
        .get::<OriginalUri>()
        .map(|OriginalUri(uri)| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().to_string();

    let response = state
        .gate
        .process(credential.as_deref(), &endpoint, &method, move |caller| {
            req.extensions_mut().insert(caller);
            next.run(req)
        })
        .await?;

    Ok(response)
}

/// Resolves the API key and injects the credential, without metering
pub async fn key_auth_layer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let credential = extract_credential(req.headers(), req.uri());
    let resolved = state.gate.authenticate(credential.as_deref()).await?;
    req.extensions_mut().insert(resolved);
    Ok(next.run(req).await)
}
