/// Metered completion endpoints
///
/// Thin wrappers that turn each request into a prompt for the model backend.
/// They sit behind the access gate, which has already admitted the caller
/// and will record the response status and latency; these handlers never
/// see quota or usage.
///
/// # Endpoints
///
/// - `POST /v1/query` - `{ "prompt": "...", "stream": false }`
/// - `POST /v1/research` - `{ "topic": "..." }`
/// - `POST /v1/code` - `{ "requirements": "..." }`
/// - `POST /v1/analyze` - `{ "content": "..." }`

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use async_trait::async_trait;
use axum::{extract::State, Extension, Json};
use keygate_shared::{gate::AdmittedCaller, models::Plan};
use serde::{Deserialize, Serialize};

/// Failure reported by the model backend
#[derive(Debug, thiserror::Error)]
#[error("completion backend failed: {0}")]
pub struct BackendError(pub String);

/// Downstream model client
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Produces a completion for `prompt`
    async fn complete(&self, prompt: &str, stream: bool) -> Result<String, BackendError>;
}

/// Answers with the prompt itself; stands in until a model client is wired
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoBackend;

#[async_trait]
impl CompletionBackend for EchoBackend {
    async fn complete(&self, prompt: &str, _stream: bool) -> Result<String, BackendError> {
        Ok(prompt.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub prompt: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResearchRequest {
    pub topic: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub requirements: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub response: String,
    pub plan: Plan,
}

fn required(field: &str, value: Option<String>) -> ApiResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))
}

async fn run(
    state: &AppState,
    caller: &AdmittedCaller,
    prompt: &str,
    stream: bool,
) -> ApiResult<Json<CompletionResponse>> {
    let response = state.backend.complete(prompt, stream).await.map_err(|e| {
        tracing::warn!(user_id = %caller.user.id, error = %e, "Completion failed");
        ApiError::InternalError(e.to_string())
    })?;

    Ok(Json(CompletionResponse {
        response,
        plan: caller.plan,
    }))
}

pub async fn query(
    State(state): State<AppState>,
    Extension(caller): Extension<AdmittedCaller>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<CompletionResponse>> {
    let prompt = required("prompt", req.prompt)?;
    run(&state, &caller, &prompt, req.stream).await
}

pub async fn research(
    State(state): State<AppState>,
    Extension(caller): Extension<AdmittedCaller>,
    Json(req): Json<ResearchRequest>,
) -> ApiResult<Json<CompletionResponse>> {
    let topic = required("topic", req.topic)?;
    let prompt = format!(
        "Research the following topic and summarize the key findings with sources:\n\n{topic}"
    );
    run(&state, &caller, &prompt, false).await
}

pub async fn code(
    State(state): State<AppState>,
    Extension(caller): Extension<AdmittedCaller>,
    Json(req): Json<CodeRequest>,
) -> ApiResult<Json<CompletionResponse>> {
    let requirements = required("requirements", req.requirements)?;
    let prompt = format!("Write code that meets these requirements:\n\n{requirements}");
    run(&state, &caller, &prompt, false).await
}

pub async fn analyze(
    State(state): State<AppState>,
    Extension(caller): Extension<AdmittedCaller>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<Json<CompletionResponse>> {
    let content = required("content", req.content)?;
    let prompt = format!("Analyze the following content:\n\n{content}");
    run(&state, &caller, &prompt, false).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_backend_returns_prompt() {
        let out = EchoBackend.complete("hello", true).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_required_rejects_blank() {
        assert!(required("prompt", None).is_err());
        assert!(required("prompt", Some("   ".to_string())).is_err());
        assert_eq!(required("prompt", Some("hi".to_string())).unwrap(), "hi");
    }
}
