//! Common test utilities for integration tests
//!
//! This module provides shared infrastructure for integration tests:
//! - An app wired to the in-memory store (no database needed)
//! - Test user creation and JWT token generation
//! - Request helpers returning status, headers and parsed JSON

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use keygate_api::app::{build_router, AppState};
use keygate_api::config::{
    ApiConfig, BillingConfig, Config, DatabaseConfig, JwtConfig, LimitsConfig,
};
use keygate_api::routes::completions::CompletionBackend;
use keygate_shared::auth::jwt::{create_token, Claims};
use keygate_shared::models::{CreateUser, User};
use keygate_shared::store::{MemoryStore, UserRepository};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test-secret-key-at-least-32-bytes-long";
pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const MAX_ACTIVE_KEYS: u32 = 3;

pub fn test_config() -> Config {
    Config {
        api: ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            production: false,
        },
        database: DatabaseConfig {
            url: "postgresql://unused".to_string(),
            max_connections: 1,
        },
        jwt: JwtConfig {
            secret: JWT_SECRET.to_string(),
        },
        billing: BillingConfig {
            webhook_secret: WEBHOOK_SECRET.to_string(),
            webhook_tolerance_secs: 300,
        },
        limits: LimitsConfig {
            max_active_keys: MAX_ACTIVE_KEYS,
            storage_timeout_ms: 1000,
        },
    }
}

/// Test context containing all necessary resources
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub state: AppState,
    pub app: Router,
    pub user: User,
    pub jwt_token: String,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    pub async fn with_backend(backend: Arc<dyn CompletionBackend>) -> Self {
        Self::build(Some(backend)).await
    }

    async fn build(backend: Option<Arc<dyn CompletionBackend>>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mut state = AppState::new(store.clone(), test_config());
        if let Some(backend) = backend {
            state = state.with_backend(backend);
        }
        let app = build_router(state.clone());

        let user = store
            .create_user(CreateUser::new("owner@example.com", "owner"))
            .await
            .unwrap();
        let jwt_token = token_for(user.id);

        TestContext {
            store,
            state,
            app,
            user,
            jwt_token,
        }
    }

    /// Creates another user and returns it with a session token
    pub async fn create_user(&self, name: &str, admin: bool) -> (User, String) {
        let mut data = CreateUser::new(format!("{name}@example.com"), name);
        if admin {
            data = data.admin();
        }
        let user = self.store.create_user(data).await.unwrap();
        let token = token_for(user.id);
        (user, token)
    }

    /// Returns authorization header value
    pub fn auth_header(&self) -> String {
        format!("Bearer {}", self.jwt_token)
    }

    /// Issues a key for the context user through the API
    pub async fn issue_key(&self, name: &str) -> String {
        let (status, _, body) = self
            .send(json_request(
                "POST",
                "/v1/api-keys",
                Some(&self.auth_header()),
                Some(serde_json::json!({ "name": name })),
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["key"].as_str().unwrap().to_string()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, body)
    }

    /// Usage events recorded for the context user in the last hour
    pub async fn recorded(&self) -> Vec<keygate_shared::models::UsageEvent> {
        self.state
            .ledger
            .list_recent(
                self.user.id,
                chrono::Utc::now() - chrono::Duration::hours(1),
                1000,
            )
            .await
            .unwrap()
    }
}

pub fn token_for(user_id: Uuid) -> String {
    create_token(&Claims::new(user_id), JWT_SECRET).unwrap()
}

/// Builds a request with an optional bearer header and JSON body
pub fn json_request(
    method: &str,
    uri: &str,
    authorization: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = authorization {
        builder = builder.header("authorization", auth);
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Builds a metered request carrying `key` in the `X-API-Key` header
pub fn keyed_request(method: &str, uri: &str, key: &str, body: Option<Value>) -> Request<Body> {
    let mut request = json_request(method, uri, None, body);
    request
        .headers_mut()
        .insert("x-api-key", key.parse().unwrap());
    request
}
