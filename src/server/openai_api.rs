//! OpenAI-compatible HTTP API.
//!
//! Implements the subset of the OpenAI API a local orchestrator can serve:
//! - POST /v1/chat/completions
//! - POST /v1/completions
//! - POST /v1/embeddings
//! - GET /v1/models
//! - GET /health
//! - GET /metrics
//!
//! plus the raw protocol over WebSocket at GET /v1/ws.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::orchestrator::client::{ClientError, OrchestratorClient, ResponseStream};
use crate::protocol::{
    Command, ErrorKind, InferenceConfig, InferenceEvent, OutputBody, ThoughtEvent,
};
use crate::server::streaming::response_to_sse_stream;
use crate::server::ws::ws_handler;

/// Application state shared across handlers.
pub struct AppState {
    pub client: OrchestratorClient,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/ws", get(ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    /// Surface reasoning as `reasoning_content`.
    #[serde(default)]
    pub show_thinking: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

/// Chat completion response (non-streaming).
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: String,
}

/// Completion request (non-chat).
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub seed: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Embedding request. `input` is one string or a list.
#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub input: EmbeddingInput,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

impl EmbeddingInput {
    fn into_vec(self) -> Vec<String> {
        match self {
            EmbeddingInput::One(s) => vec![s],
            EmbeddingInput::Many(v) => v,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingData {
    pub object: String,
    pub index: usize,
    pub embedding: Vec<f32>,
}

/// Model listing response.
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub engine_state: String,
    pub model_resident: bool,
    pub strategy: String,
}

/// Error body in the OpenAI shape.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A failed request, rendered as an OpenAI error object.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn timeout() -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            kind: "timeout",
            message: "Request timed out".to_string(),
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        let (status, kind) = match &err {
            ClientError::Failed(e) => match e.kind {
                ErrorKind::Protocol => (StatusCode::BAD_REQUEST, "invalid_request_error"),
                ErrorKind::Asset => (StatusCode::NOT_FOUND, "model_not_found"),
                ErrorKind::Engine => (StatusCode::INTERNAL_SERVER_ERROR, "engine_error"),
            },
            ClientError::Closed | ClientError::Incomplete => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            ClientError::Unexpected(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let message = match err {
            ClientError::Failed(e) => e.message,
            other => other.to_string(),
        };
        Self {
            status,
            kind,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.message,
                kind: self.kind.to_string(),
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ─── Helpers ───────────────────────────────────────────────────────────────

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Rough token estimate: ~1 token per 4 chars.
fn approx_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

fn model_name(requested: &Option<String>) -> String {
    requested.clone().unwrap_or_else(|| "default".to_string())
}

/// Flatten a chat transcript into a single prompt.
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn request_config(
    defaults: &InferenceConfig,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    seed: Option<u32>,
    show_thinking: Option<bool>,
) -> InferenceConfig {
    InferenceConfig {
        max_tokens: max_tokens.unwrap_or(defaults.max_tokens),
        temperature: temperature.unwrap_or(defaults.temperature),
        seed: seed.or(defaults.seed),
        show_thinking: show_thinking.unwrap_or(defaults.show_thinking),
        context_size: defaults.context_size,
    }
}

/// Text accumulated from one response.
#[derive(Debug, Default)]
struct Collected {
    content: String,
    reasoning: String,
    chunks: usize,
    embedding: Option<Vec<f32>>,
}

async fn collect_response(mut response: ResponseStream) -> Result<Collected, ClientError> {
    let mut collected = Collected::default();
    while let Some(body) = response.next().await {
        match body {
            OutputBody::Event(InferenceEvent::Content(text)) => {
                collected.content.push_str(&text);
                collected.chunks += 1;
            }
            OutputBody::Event(InferenceEvent::Thought(ThoughtEvent::Delta(text))) => {
                collected.reasoning.push_str(&text);
            }
            OutputBody::Event(InferenceEvent::Embedding(vector)) => {
                collected.embedding = Some(vector);
            }
            OutputBody::Event(InferenceEvent::Complete) => return Ok(collected),
            OutputBody::Error(e) => return Err(ClientError::Failed(e)),
            _ => {}
        }
    }
    Err(ClientError::Incomplete)
}

async fn within<T>(
    state: &AppState,
    fut: impl std::future::Future<Output = Result<T, ClientError>>,
) -> Result<T, ApiError> {
    let limit = Duration::from_secs(state.config.server.request_timeout_secs);
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => Err(ApiError::timeout()),
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let prompt = render_prompt(&req.messages);
    let config = request_config(
        &state.config.inference,
        req.max_tokens,
        req.temperature,
        req.seed,
        req.show_thinking,
    );

    let response = state
        .client
        .submit(Command::Infer {
            model: req.model.clone(),
            prompt: prompt.clone(),
            config,
        })
        .await?;
    let request_id = response.id().to_string();

    info!(
        request_id = %request_id,
        model = ?req.model,
        messages = req.messages.len(),
        stream = req.stream,
        "Chat completion request"
    );

    if req.stream {
        // Dropping the SSE body on disconnect cancels the request.
        let stream = response_to_sse_stream(response, model_name(&req.model));
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let collected = within(&state, collect_response(response)).await?;
    let prompt_tokens = approx_tokens(&prompt);
    let completion_tokens = approx_tokens(&collected.content);

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: model_name(&req.model),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: collected.content,
                reasoning_content: (!collected.reasoning.is_empty()).then_some(collected.reasoning),
            },
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    };

    Ok(Json(response).into_response())
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let config = request_config(
        &state.config.inference,
        req.max_tokens,
        req.temperature,
        req.seed,
        Some(false),
    );
    let response = state
        .client
        .submit(Command::Infer {
            model: req.model.clone(),
            prompt: req.prompt.clone(),
            config,
        })
        .await?;
    let request_id = response.id().to_string();
    let collected = within(&state, collect_response(response)).await?;

    let prompt_tokens = approx_tokens(&req.prompt);
    let completion_tokens = approx_tokens(&collected.content);

    Ok(Json(CompletionResponse {
        id: format!("cmpl-{request_id}"),
        object: "text_completion".to_string(),
        created: unix_now(),
        model: model_name(&req.model),
        choices: vec![CompletionChoice {
            index: 0,
            text: collected.content,
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    }))
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let inputs = req.input.into_vec();
    let mut data = Vec::with_capacity(inputs.len());
    let mut prompt_tokens = 0;

    for (index, input) in inputs.into_iter().enumerate() {
        prompt_tokens += approx_tokens(&input);
        let response = state
            .client
            .submit(Command::Embed {
                model: req.model.clone(),
                input,
                config: state.config.inference.clone(),
            })
            .await?;
        let collected = within(&state, collect_response(response)).await?;
        let embedding = collected.embedding.ok_or_else(|| {
            ApiError::from(ClientError::Unexpected("no embedding in response".to_string()))
        })?;
        data.push(EmbeddingData {
            object: "embedding".to_string(),
            index,
            embedding,
        });
    }

    Ok(Json(EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: model_name(&req.model),
        usage: Usage {
            prompt_tokens,
            completion_tokens: 0,
            total_tokens: prompt_tokens,
        },
    }))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelList>, ApiError> {
    let names = within(&state, state.client.list_models()).await?;
    Ok(Json(ModelList {
        object: "list".to_string(),
        data: names
            .into_iter()
            .map(|id| ModelInfo {
                id,
                object: "model".to_string(),
                created: 0,
                owned_by: "local".to_string(),
            })
            .collect(),
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let engine_state = state.client.state();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        engine_state: engine_state.to_string(),
        model_resident: engine_state.is_resident(),
        strategy: state.config.orchestrator.strategy().to_string(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorEvent;

    #[test]
    fn test_render_prompt() {
        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: "be brief".into(),
                reasoning_content: None,
            },
            ChatMessage {
                role: "user".into(),
                content: "hi".into(),
                reasoning_content: None,
            },
        ];
        assert_eq!(render_prompt(&messages), "system: be brief\nuser: hi");
    }

    #[test]
    fn test_request_config_overrides_defaults() {
        let defaults = InferenceConfig::default();
        let config = request_config(&defaults, Some(16), None, Some(7), Some(true));
        assert_eq!(config.max_tokens, 16);
        assert_eq!(config.temperature, defaults.temperature);
        assert_eq!(config.seed, Some(7));
        assert!(config.show_thinking);
    }

    #[test]
    fn test_error_status_mapping() {
        let err = ApiError::from(ClientError::Failed(ErrorEvent {
            kind: ErrorKind::Asset,
            message: "missing".into(),
        }));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "missing");

        let err = ApiError::from(ClientError::Closed);
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_embedding_input_forms() {
        let one: EmbeddingRequest = serde_json::from_str(r#"{"input": "a"}"#).unwrap();
        assert_eq!(one.input.into_vec(), vec!["a".to_string()]);
        let many: EmbeddingRequest = serde_json::from_str(r#"{"input": ["a", "b"]}"#).unwrap();
        assert_eq!(many.input.into_vec().len(), 2);
    }
}
