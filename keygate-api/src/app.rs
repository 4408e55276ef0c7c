/// Application state and router builder
///
/// This module defines the shared application state and provides
/// a function to build the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use keygate_api::{app::AppState, config::Config};
/// use keygate_shared::db::pool::{create_pool, DatabaseConfig};
/// use keygate_shared::store::PgStore;
/// use std::sync::Arc;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::from_env()?;
/// let pool = create_pool(DatabaseConfig::new(config.database.url.clone())).await?;
/// let state = AppState::new(Arc::new(PgStore::new(pool)), config);
/// let app = keygate_api::app::build_router(state);
/// # Ok(())
/// # }
/// ```

use crate::{
    config::Config,
    error::ApiError,
    middleware::access_gate::{key_auth_layer, metered_layer},
    routes::completions::{CompletionBackend, EchoBackend},
};
use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use keygate_shared::{
    auth::{jwt, CredentialStore},
    billing::SubscriptionRegistry,
    gate::{AccessGate, API_KEY_HEADER},
    ledger::UsageLedger,
    models::User,
    quota::QuotaEnforcer,
    store::{bounded, SharedStore},
};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

/// Shared application state
///
/// This is cloned for each request handler via Axum's `State` extractor.
/// Every service is a cheap handle over the same store.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub config: Arc<Config>,
    pub credentials: CredentialStore,
    pub ledger: UsageLedger,
    pub registry: SubscriptionRegistry,
    pub quota: QuotaEnforcer,
    pub gate: AccessGate,
    pub backend: Arc<dyn CompletionBackend>,
}

impl AppState {
    /// Wires every service over `store`, bounded by the configured timeout
    pub fn new(store: SharedStore, config: Config) -> Self {
        let timeout = config.storage_timeout();
        let credentials = CredentialStore::new(store.clone(), config.limits.max_active_keys)
            .with_timeout(timeout);
        let ledger = UsageLedger::new(store.clone()).with_timeout(timeout);
        let registry = SubscriptionRegistry::new(store.clone()).with_timeout(timeout);
        let quota = QuotaEnforcer::new(registry.clone(), ledger.clone());
        let gate = AccessGate::new(credentials.clone(), quota.clone(), ledger.clone());

        Self {
            store,
            config: Arc::new(config),
            credentials,
            ledger,
            registry,
            quota,
            gate,
            backend: Arc::new(EchoBackend),
        }
    }

    /// Replaces the downstream model client
    pub fn with_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Gets JWT secret for token operations
    pub fn jwt_secret(&self) -> &str {
        &self.config.jwt.secret
    }
}

/// Authenticated account owner, set by the JWT layer
#[derive(Debug, Clone)]
pub struct OwnerContext {
    pub user: User,
}

/// Builds the complete Axum router with all routes and middleware
///
/// # Architecture
///
/// ```text
/// /
/// ├── /health                        # Health check (public)
/// └── /v1/
///     ├── /api-keys/                 # Key management (owner JWT)
///     │   ├── POST   /               # Issue key
///     │   ├── GET    /               # List keys
///     │   ├── POST   /:id/toggle     # Flip active flag
///     │   ├── POST   /:id/revoke     # Deactivate
///     │   └── DELETE /:id            # Delete
///     ├── /billing/
///     │   ├── POST /webhook          # Processor events (signed)
///     │   ├── POST /checkout         # Start a purchase (owner JWT)
///     │   └── GET  /subscription     # Current plan (owner JWT)
///     ├── GET /usage                 # Quota standing (API key, unmetered)
///     ├── GET /developer/usage       # Owner dashboard (owner JWT)
///     ├── GET /admin/stats           # Platform dashboard (owner JWT, admin)
///     ├── GET /admin/users?email=    # Account lookup (owner JWT, admin)
///     ├── POST /admin/users/:id/toggle-active   # (owner JWT, admin)
///     └── POST /query|research|code|analyze   # Metered (access gate)
/// ```
///
/// # Middleware Stack
///
/// Applied in order (bottom to top):
/// 1. Logging (tower-http TraceLayer)
/// 2. CORS (tower-http CorsLayer)
/// 3. Authentication and metering (per-route basis)
pub fn build_router(state: AppState) -> Router {
    use crate::routes;

    // Health check (public, no auth)
    let health_routes = Router::new().route("/health", get(routes::health::health_check));

    // API key routes (require JWT authentication)
    let api_key_routes = Router::new()
        .route(
            "/",
            post(routes::api_keys::create_api_key).get(routes::api_keys::list_api_keys),
        )
        .route("/:id", axum::routing::delete(routes::api_keys::delete_api_key))
        .route("/:id/toggle", post(routes::api_keys::toggle_api_key))
        .route("/:id/revoke", post(routes::api_keys::revoke_api_key))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_layer,
        ));

    let billing_owner_routes = Router::new()
        .route("/checkout", post(routes::billing::begin_checkout))
        .route("/subscription", get(routes::billing::get_subscription))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_layer,
        ));

    // The webhook authenticates by signature, not by session
    let billing_routes = Router::new()
        .route("/webhook", post(routes::billing::webhook))
        .merge(billing_owner_routes);

    let dashboard_routes = Router::new()
        .route("/developer/usage", get(routes::usage::developer_usage))
        .route("/admin/stats", get(routes::usage::admin_stats))
        .route("/admin/users", get(routes::admin::find_user))
        .route(
            "/admin/users/:id/toggle-active",
            post(routes::admin::toggle_user_active),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_layer,
        ));

    // Key-authenticated but never counted against quota
    let usage_routes = Router::new()
        .route("/usage", get(routes::usage::current_usage))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            key_auth_layer,
        ));

    let metered_routes = Router::new()
        .route("/query", post(routes::completions::query))
        .route("/research", post(routes::completions::research))
        .route("/code", post(routes::completions::code))
        .route("/analyze", post(routes::completions::analyze))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metered_layer,
        ));

    // Build complete v1 API
    let v1_routes = Router::new()
        .nest("/api-keys", api_key_routes)
        .nest("/billing", billing_routes)
        .merge(dashboard_routes)
        .merge(usage_routes)
        .merge(metered_routes);

    // Configure CORS based on environment
    let cors = if state.config.api.cors_origins.iter().any(|o| o == "*") {
        // Development mode: permissive CORS
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                HeaderName::from_static(API_KEY_HEADER),
            ])
            .allow_credentials(true)
            .max_age(std::time::Duration::from_secs(3600))
    };

    // Combine all routes with middleware stack
    Router::new()
        .merge(health_routes)
        .nest("/v1", v1_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors)
        .with_state(state)
}

/// JWT authentication middleware layer
///
/// Validates the owner's bearer token, loads the account and injects
/// [`OwnerContext`] into request extensions.
async fn jwt_auth_layer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    // Extract Authorization header
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing authorization header".to_string()))?;

    // Parse Bearer token
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::BadRequest("Expected Bearer token".to_string()))?;

    let claims = jwt::validate_token(token, state.jwt_secret())?;

    let user = bounded(state.config.storage_timeout(), state.store.find_user(claims.sub))
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Unknown user".to_string()))?;
    if !user.active {
        return Err(ApiError::AccountInactive);
    }

    req.extensions_mut().insert(OwnerContext { user });

    Ok(next.run(req).await)
}
