/// Access gate
///
/// The per-request pipeline in front of every metered handler:
///
/// 1. Extract the presented key (`X-API-Key` header, else `api_key` query parameter)
/// 2. Resolve it to an active key and owner; refuse inactive accounts
/// 3. Ask the quota enforcer to admit the owner
/// 4. Run the handler
/// 5. Record one usage event with the handler's real status and latency
///
/// Denied requests are never recorded, so a rejection cannot consume quota.
/// Storage failures in stages 2-3 fail the request closed; a failure while
/// recording is logged and the handler's response is still returned.
///
/// # Example
///
/// ```no_run
/// use keygate_shared::gate::{AccessGate, AdmittedCaller};
///
/// # async fn example(gate: AccessGate) -> Result<(), keygate_shared::gate::GateError> {
/// let status = gate
///     .process(Some("kg_..."), "/v1/query", "POST", |caller: AdmittedCaller| async move {
///         tracing::info!(plan = %caller.plan, "serving");
///         200u16
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```

use axum::{
    extract::Query,
    http::{HeaderMap, Uri},
    response::Response,
};
use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::auth::{CredentialError, CredentialStore, ResolvedCredential};
use crate::ledger::UsageLedger;
use crate::models::{ApiKey, NewUsageEvent, Plan, User};
use crate::quota::{Admission, PlanLimits, QuotaDenial, QuotaEnforcer};
use crate::store::StoreError;

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameter accepted when the header is absent
pub const API_KEY_QUERY_PARAM: &str = "api_key";

/// Reads the presented key, preferring the header over the query string
pub fn extract_credential(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    Query::<HashMap<String, String>>::try_from_uri(uri)
        .ok()
        .and_then(|Query(mut params)| params.remove(API_KEY_QUERY_PARAM))
        .filter(|v| !v.is_empty())
}

/// Reasons the gate refuses a request
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    #[error("no API key presented")]
    MissingCredential,

    #[error("invalid API key")]
    InvalidKey,

    #[error("account is inactive")]
    AccountInactive,

    #[error("{}", .0.message())]
    RateLimitExceeded(QuotaDenial),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(StoreError),
}

impl GateError {
    /// Machine-readable reason code returned to callers
    pub fn code(&self) -> &'static str {
        match self {
            GateError::MissingCredential => "missing_credential",
            GateError::InvalidKey => "invalid_key",
            GateError::AccountInactive => "account_inactive",
            GateError::RateLimitExceeded(_) => "rate_limit_exceeded",
            GateError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

impl From<CredentialError> for GateError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Storage(e) => GateError::StorageUnavailable(e),
            _ => GateError::InvalidKey,
        }
    }
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        GateError::StorageUnavailable(err)
    }
}

/// A caller that passed stages 1-3
#[derive(Debug, Clone)]
pub struct AdmittedCaller {
    pub user: User,
    pub api_key: ApiKey,
    pub plan: Plan,
    pub limits: PlanLimits,
}

/// Handler output whose status code is recorded in the ledger
pub trait Metered {
    fn status_code(&self) -> u16;
}

impl Metered for Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

impl Metered for u16 {
    fn status_code(&self) -> u16 {
        *self
    }
}

#[derive(Clone)]
pub struct AccessGate {
    credentials: CredentialStore,
    quota: QuotaEnforcer,
    ledger: UsageLedger,
}

impl AccessGate {
    pub fn new(credentials: CredentialStore, quota: QuotaEnforcer, ledger: UsageLedger) -> Self {
        Self {
            credentials,
            quota,
            ledger,
        }
    }

    /// Stages 1-2: a usable key held by an active account
    pub async fn authenticate(
        &self,
        credential: Option<&str>,
    ) -> Result<ResolvedCredential, GateError> {
        let token = credential.ok_or(GateError::MissingCredential)?;
        let resolved = self.credentials.resolve(token).await?;

        if !resolved.user.active {
            debug!(user_id = %resolved.user.id, "Rejected key of inactive account");
            return Err(GateError::AccountInactive);
        }
        Ok(resolved)
    }

    /// Stages 1-3, then marks the key as used
    pub async fn admit(&self, credential: Option<&str>) -> Result<AdmittedCaller, GateError> {
        let ResolvedCredential { user, api_key } = self.authenticate(credential).await?;

        match self.quota.admit(user.id).await? {
            Admission::Admit { plan, limits } => {
                self.credentials.record_use(api_key.id).await;
                Ok(AdmittedCaller {
                    user,
                    api_key,
                    plan,
                    limits,
                })
            }
            Admission::Deny(denial) => {
                warn!(
                    user_id = %user.id,
                    api_key_id = %api_key.id,
                    reason = denial.reason(),
                    limit = denial.limit,
                    "Rate limit exceeded"
                );
                Err(GateError::RateLimitExceeded(denial))
            }
        }
    }

    /// Runs the full pipeline around `handler`
    pub async fn process<F, Fut, T>(
        &self,
        credential: Option<&str>,
        endpoint: &str,
        method: &str,
        handler: F,
    ) -> Result<T, GateError>
    where
        F: FnOnce(AdmittedCaller) -> Fut,
        Fut: Future<Output = T>,
        T: Metered,
    {
        let caller = self.admit(credential).await?;
        let user_id = caller.user.id;
        let api_key_id = caller.api_key.id;

        let started = Instant::now();
        let output = handler(caller).await;
        let elapsed = started.elapsed();

        let status = output.status_code();
        let event = NewUsageEvent::new(user_id, Some(api_key_id), endpoint, method, status, elapsed);
        if let Err(e) = self.ledger.record(event).await {
            error!(
                user_id = %user_id,
                endpoint,
                status,
                error = %e,
                "Failed to record usage; request served unmetered"
            );
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::SubscriptionRegistry;
    use crate::models::CreateUser;
    use crate::quota::QuotaWindow;
    use crate::store::{MemoryStore, SharedStore, UserRepository};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        memory: Arc<MemoryStore>,
        gate: AccessGate,
        ledger: UsageLedger,
        credentials: CredentialStore,
        user: User,
        token: String,
    }

    async fn fixture() -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let store: SharedStore = memory.clone();
        let user = memory
            .create_user(CreateUser::new("gate@example.com", "gate"))
            .await
            .unwrap();

        let credentials = CredentialStore::new(store.clone(), 10);
        let ledger = UsageLedger::new(store.clone());
        let quota = QuotaEnforcer::new(SubscriptionRegistry::new(store), ledger.clone());
        let token = credentials.issue(user.id, "gate").await.unwrap().token;

        Fixture {
            gate: AccessGate::new(credentials.clone(), quota, ledger.clone()),
            memory,
            ledger,
            credentials,
            user,
            token,
        }
    }

    async fn used_today(f: &Fixture) -> u64 {
        let (start, end) = QuotaWindow::Daily.bounds(Utc::now());
        f.ledger.count_in_window(f.user.id, start, end).await.unwrap()
    }

    #[test]
    fn test_extract_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, "kg_header".parse().unwrap());
        let uri: Uri = "/v1/query?api_key=kg_query".parse().unwrap();
        assert_eq!(extract_credential(&headers, &uri).as_deref(), Some("kg_header"));

        let empty = HeaderMap::new();
        assert_eq!(extract_credential(&empty, &uri).as_deref(), Some("kg_query"));

        let bare: Uri = "/v1/query".parse().unwrap();
        assert_eq!(extract_credential(&empty, &bare), None);
    }

    #[tokio::test]
    async fn test_admitted_request_is_recorded_with_real_status() {
        let f = fixture().await;
        let status = f
            .gate
            .process(Some(&f.token), "/v1/query", "POST", |_| async { 502u16 })
            .await
            .unwrap();
        assert_eq!(status, 502);

        let events = f
            .ledger
            .list_recent(f.user.id, Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status_code, 502);
        assert_eq!(events[0].endpoint, "/v1/query");
        assert!(events[0].api_key_id.is_some());

        let key = &f.credentials.list(f.user.id).await.unwrap()[0];
        assert!(key.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_rejections_carry_codes_and_skip_handler() {
        let f = fixture().await;
        let called = AtomicBool::new(false);

        let cases = [
            (None, "missing_credential"),
            (Some("kg_not_a_real_key"), "invalid_key"),
        ];
        for (credential, code) in cases {
            let err = f
                .gate
                .process(credential, "/v1/query", "POST", |_| async {
                    called.store(true, Ordering::SeqCst);
                    200u16
                })
                .await
                .unwrap_err();
            assert_eq!(err.code(), code);
        }
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(used_today(&f).await, 0);
    }

    #[tokio::test]
    async fn test_inactive_account_is_refused() {
        let f = fixture().await;
        f.memory.set_user_active(f.user.id, false).await.unwrap();
        let err = f.gate.admit(Some(&f.token)).await.unwrap_err();
        assert!(matches!(err, GateError::AccountInactive));
    }

    #[tokio::test]
    async fn test_denied_requests_do_not_consume_quota() {
        let f = fixture().await;
        for _ in 0..100 {
            f.gate
                .process(Some(&f.token), "/v1/query", "POST", |_| async { 200u16 })
                .await
                .unwrap();
        }

        for _ in 0..3 {
            let err = f
                .gate
                .process(Some(&f.token), "/v1/query", "POST", |_| async { 200u16 })
                .await
                .unwrap_err();
            let GateError::RateLimitExceeded(denial) = err else {
                panic!("expected rate limit");
            };
            assert_eq!(denial.window, QuotaWindow::Daily);
            assert_eq!(denial.limit, 100);
        }
        assert_eq!(used_today(&f).await, 100);
    }

    #[tokio::test]
    async fn test_storage_outage_fails_closed() {
        let f = fixture().await;
        f.memory.set_offline(true);
        let err = f.gate.admit(Some(&f.token)).await.unwrap_err();
        assert!(matches!(err, GateError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_recording_failure_still_returns_response() {
        let f = fixture().await;
        let memory = f.memory.clone();
        let status = f
            .gate
            .process(Some(&f.token), "/v1/query", "POST", |_| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                memory.set_offline(true);
                200u16
            })
            .await
            .unwrap();
        assert_eq!(status, 200);

        f.memory.set_offline(false);
        assert_eq!(used_today(&f).await, 0);
    }
}
