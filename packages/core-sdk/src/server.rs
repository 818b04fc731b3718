use std::sync::Arc;

use anyhow::Result;
use async_stream::stream;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::{
    config::Config,
    llm::{ChatModel, ModelBackend, OpenRouterBackend},
    models::{
        GenerationChunk, GenerationRequest, GenerationResponse, AVAILABLE_MODELS, DEFAULT_MODEL,
        DEFAULT_TEMPERATURE,
    },
    telemetry,
};

pub const PROMPT_REQUIRED: &str = "Prompt is required";
pub const API_KEY_MISSING: &str = "API key not configured";

type ApiError = (StatusCode, Json<Value>);

/**
 * \brief Shared, read-only handler state.
 */
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn ModelBackend>,
}

impl AppState {
    pub fn new(config: Config, backend: impl ModelBackend + 'static) -> Self {
        Self {
            config: Arc::new(config),
            backend: Arc::new(backend),
        }
    }
}

/**
 * \brief Build the proxy routes.
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(generate))
        .route("/generate", post(generate))
        .route("/generate/stream", post(generate_stream))
        .route("/health", get(health_check))
        .route("/models", get(list_models))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/**
 * \brief Start the proxy on `addr` (e.g. "127.0.0.1:3000") against the real upstream.
 */
pub async fn run(config: Config, addr: &str) -> Result<()> {
    telemetry::configure(&config);
    if !config.has_api_key() {
        telemetry::log_error("server.config", "OPENROUTER_API_KEY not configured");
    }
    let app = router(AppState::new(config, OpenRouterBackend));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sync,
    Stream,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Sync => "sync",
            Mode::Stream => "stream",
        }
    }
}

/**
 * \brief POST /generate: one JSON answer.
 */
pub async fn generate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<GenerationResponse>, ApiError> {
    let (request, model) = prepare(&state, &body, Mode::Sync)?;

    match model.invoke(&request.prompt).await {
        Ok(content) => {
            telemetry::log_event(
                "server.generate",
                &format!(
                    "mode=sync model={} content_len={}",
                    request.model,
                    content.len()
                ),
            );
            Ok(Json(GenerationResponse::success(
                content,
                request.model,
                request.temperature,
            )))
        }
        Err(e) => Err(upstream_failure(Mode::Sync, &request, e)),
    }
}

/**
 * \brief POST /generate/stream: `{"content"}` events followed by `{"done":true}`.
 */
pub async fn generate_stream(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (request, model) = prepare(&state, &body, Mode::Stream)?;

    let mut deltas = model
        .stream(&request.prompt)
        .await
        .map_err(|e| upstream_failure(Mode::Stream, &request, e))?;

    // Nothing has been sent yet, so a failure here can still become a 500.
    let first = match deltas.next().await {
        Some(Ok(delta)) => Some(delta),
        Some(Err(e)) => return Err(upstream_failure(Mode::Stream, &request, e)),
        None => None,
    };

    let model_name = request.model;
    let events = stream! {
        let mut sent = 0usize;
        if let Some(delta) = first {
            sent += 1;
            yield content_event(delta);
        }
        let mut failed = false;
        while let Some(item) = deltas.next().await {
            match item {
                Ok(delta) => {
                    sent += 1;
                    yield content_event(delta);
                }
                Err(e) => {
                    telemetry::log_error(
                        "server.generate",
                        &format!("mode=stream model={} failed after {} deltas: {}", model_name, sent, e),
                    );
                    yield Event::default()
                        .event("error")
                        .json_data(GenerationChunk::Error { error: e.to_string() });
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            telemetry::log_event(
                "server.generate",
                &format!("mode=stream model={} deltas={}", model_name, sent),
            );
            yield Event::default().json_data(GenerationChunk::Done { done: true });
        }
    };

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new())
        .into_response())
}

fn content_event(content: String) -> Result<Event, axum::Error> {
    Event::default().json_data(GenerationChunk::Content { content })
}

/**
 * \brief Validate, check configuration, apply defaults and build the upstream model.
 */
fn prepare(
    state: &AppState,
    raw: &[u8],
    mode: Mode,
) -> Result<(GenerationRequest, Box<dyn ChatModel>), ApiError> {
    let body = normalize_body(raw);

    let Some(prompt) = extract_prompt(&body) else {
        return Err(error_json(StatusCode::BAD_REQUEST, PROMPT_REQUIRED));
    };

    if !state.config.has_api_key() {
        telemetry::log_error("server.config", "OPENROUTER_API_KEY not configured");
        return Err(error_json(StatusCode::INTERNAL_SERVER_ERROR, API_KEY_MISSING));
    }

    let request = resolve_request(prompt, &body);
    telemetry::log_event(
        "server.generate",
        &format!(
            "mode={} model={} temperature={} prompt_len={}",
            mode.as_str(),
            request.model,
            request.temperature,
            request.prompt.len()
        ),
    );

    let settings = state
        .config
        .client_settings(&request.model, request.temperature.clone())
        .ok_or_else(|| error_json(StatusCode::INTERNAL_SERVER_ERROR, API_KEY_MISSING))?;
    let model = state
        .backend
        .connect(settings)
        .map_err(|e| upstream_failure(mode, &request, e))?;

    Ok((request, model))
}

/**
 * \brief Accept a JSON object, a JSON-encoded string of one, or anything else as a raw string.
 */
fn normalize_body(raw: &[u8]) -> Value {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(decoded) => decoded,
            Err(_) => {
                telemetry::log_event("server.generate", "body is not JSON, using as is");
                Value::String(inner)
            }
        },
        Ok(v) => v,
        Err(_) => {
            telemetry::log_event("server.generate", "body is not JSON, using as is");
            Value::String(String::from_utf8_lossy(raw).into_owned())
        }
    }
}

fn extract_prompt(body: &Value) -> Option<String> {
    body.get("prompt")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
}

fn resolve_request(prompt: String, body: &Value) -> GenerationRequest {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_MODEL)
        .to_string();
    let temperature = match body.get("temperature") {
        Some(v) if !v.is_null() => v.clone(),
        _ => Value::from(DEFAULT_TEMPERATURE),
    };
    GenerationRequest {
        prompt,
        model,
        temperature,
    }
}

fn error_json(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}

fn upstream_failure(mode: Mode, request: &GenerationRequest, err: anyhow::Error) -> ApiError {
    let message = err.to_string();
    telemetry::log_error(
        "server.generate",
        &format!(
            "mode={} model={} upstream failed: {}",
            mode.as_str(),
            request.model,
            message
        ),
    );
    let body = match mode {
        Mode::Sync => json!(GenerationResponse::failure(message)),
        Mode::Stream => json!(GenerationChunk::Error { error: message }),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body))
}

/**
 * \brief GET /health: reports whether the deployment has an upstream key.
 */
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "api_key_configured": state.config.has_api_key(),
        "base_url": state.config.base_url,
    }))
}

async fn list_models() -> Json<Value> {
    Json(json!({ "models": AVAILABLE_MODELS }))
}
