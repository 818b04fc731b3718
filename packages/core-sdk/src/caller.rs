use anyhow::anyhow;
use async_stream::try_stream;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::{
    llm::{sse_data, DeltaStream},
    models::{AISettings, GenerationChunk},
};

/**
 * \brief How a failed generation should be explained to the user.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /** \brief The proxy or the provider is down, overloaded or refusing credentials. */
    ServiceUnavailable,
    /** \brief The selected model id is unknown or unusable. */
    MisconfiguredModel,
    Generic,
}

/**
 * \brief A generation call that did not produce text. `message` is the server's text verbatim.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailure {
    /** \brief HTTP status of the proxy response; `None` when the proxy was unreachable. */
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GenerationFailure {}

const SERVICE_CODES: [&str; 6] = ["401", "403", "500", "502", "503", "504"];

/**
 * \brief Whether `message` reports one of the service codes as an HTTP or provider status,
 * e.g. "failed: 503 Service Unavailable" or "upstream error 401:". Other numbers do not count.
 */
fn reports_service_status(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    SERVICE_CODES.iter().any(|code| {
        [": ", "error ", "status "].iter().any(|lead| {
            let needle = format!("{}{}", lead, code);
            lower.match_indices(&needle).any(|(at, _)| {
                let after = lower[at + needle.len()..].chars().next();
                !after.is_some_and(|c| c.is_ascii_alphanumeric())
            })
        })
    })
}

impl GenerationFailure {
    fn transport(err: reqwest::Error) -> Self {
        Self {
            status: None,
            message: format!("could not reach the generation service: {}", err),
        }
    }

    pub fn kind(&self) -> FailureKind {
        if self.message.to_ascii_lowercase().contains("model") {
            return FailureKind::MisconfiguredModel;
        }
        let status_says_service = match self.status {
            None => true,
            Some(code) => code >= 500 || code == 401 || code == 403,
        };
        if status_says_service || reports_service_status(&self.message) {
            FailureKind::ServiceUnavailable
        } else {
            FailureKind::Generic
        }
    }

    pub fn guidance(&self) -> &'static str {
        match self.kind() {
            FailureKind::ServiceUnavailable => {
                "The AI service is currently unavailable. Try again later or review your generation settings."
            }
            FailureKind::MisconfiguredModel => {
                "The selected model could not be used. Pick a different model in your generation settings."
            }
            FailureKind::Generic => {
                "The text could not be generated. Try again or review your generation settings."
            }
        }
    }
}

/**
 * \brief HTTP client for a running generation proxy.
 */
#[derive(Debug, Clone)]
pub struct GenerationCaller {
    http: reqwest::Client,
    endpoint: String,
}

impl GenerationCaller {
    /**
     * \brief `endpoint` is the proxy base URL, e.g. "http://127.0.0.1:3000".
     */
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /**
     * \brief Synchronous generation; returns `content` or the server's error message.
     */
    pub async fn generate_text(
        &self,
        prompt: &str,
        model: &str,
        temperature: f64,
    ) -> Result<String, GenerationFailure> {
        let resp = self
            .http
            .post(format!("{}/generate", self.endpoint))
            .json(&request_body(prompt, model, temperature))
            .send()
            .await
            .map_err(GenerationFailure::transport)?;

        let status = resp.status();
        let text = resp.text().await.map_err(GenerationFailure::transport)?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status.is_success() && body.get("ok") == Some(&Value::Bool(true)) {
            if let Some(content) = body.get("content").and_then(Value::as_str) {
                return Ok(content.to_string());
            }
        }
        Err(failure_from(status, &body, text))
    }

    /**
     * \brief Generate with the user's stored preferences.
     */
    pub async fn generate_with_settings(
        &self,
        prompt: &str,
        settings: &AISettings,
    ) -> Result<String, GenerationFailure> {
        self.generate_text(prompt, &settings.model, settings.temperature)
            .await
    }

    /**
     * \brief Streaming generation. The returned stream fails if the server reports an error
     * or closes without the done sentinel.
     */
    pub async fn stream_text(
        &self,
        prompt: &str,
        model: &str,
        temperature: f64,
    ) -> Result<DeltaStream, GenerationFailure> {
        let resp = self
            .http
            .post(format!("{}/generate/stream", self.endpoint))
            .json(&request_body(prompt, model, temperature))
            .send()
            .await
            .map_err(GenerationFailure::transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(GenerationFailure::transport)?;
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            return Err(failure_from(status, &body, text));
        }

        let frames = sse_data(resp.bytes_stream());
        let out = try_stream! {
            let mut frames = Box::pin(frames);
            let mut done = false;
            while let Some(data) = frames.next().await {
                let chunk: GenerationChunk = serde_json::from_str(&data?)?;
                match chunk {
                    GenerationChunk::Content { content } => {
                        yield content;
                    }
                    GenerationChunk::Done { .. } => {
                        done = true;
                        break;
                    }
                    GenerationChunk::Error { error } => {
                        Err::<(), _>(anyhow!(error))?;
                    }
                }
            }
            if !done {
                Err::<(), _>(anyhow!("stream ended before completion"))?;
            }
        };
        Ok(Box::pin(out))
    }
}

fn request_body(prompt: &str, model: &str, temperature: f64) -> Value {
    json!({
        "prompt": prompt,
        "model": model,
        "temperature": temperature,
    })
}

fn failure_from(status: reqwest::StatusCode, body: &Value, raw: String) -> GenerationFailure {
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            if raw.trim().is_empty() {
                format!("generation failed with status {}", status)
            } else {
                raw
            }
        });
    GenerationFailure {
        status: Some(status.as_u16()),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        server::{
            router,
            tests::{keyed_config, FakeBackend, Script},
            AppState,
        },
    };
    use std::sync::Arc;

    async fn spawn_proxy(config: Config, backend: Arc<FakeBackend>) -> String {
        let state = AppState {
            config: Arc::new(config),
            backend,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind proxy");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.ok();
        });
        format!("http://{}", addr)
    }

    fn failure(status: Option<u16>, message: &str) -> GenerationFailure {
        GenerationFailure {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            failure(Some(500), "upstream request failed: 404 Not Found -> {\"error\":{\"message\":\"bad/x is not a valid model ID\"}}").kind(),
            FailureKind::MisconfiguredModel
        );
        assert_eq!(
            failure(Some(500), "upstream request failed: 503 Service Unavailable -> overloaded").kind(),
            FailureKind::ServiceUnavailable
        );
        assert_eq!(
            failure(Some(500), "API key not configured").kind(),
            FailureKind::ServiceUnavailable
        );
        assert_eq!(
            failure(None, "could not reach the generation service: connection refused").kind(),
            FailureKind::ServiceUnavailable
        );
        assert_eq!(
            failure(Some(400), "Prompt is required").kind(),
            FailureKind::Generic
        );
        assert_eq!(
            failure(Some(400), "upstream error 401: No auth credentials found").kind(),
            FailureKind::ServiceUnavailable
        );
        assert!(failure(Some(400), "x").guidance().contains("generation settings"));
    }

    #[test]
    fn test_incidental_numbers_are_not_service_codes() {
        assert_eq!(
            failure(Some(400), "prompt used 500 tokens, limit is 403 words").kind(),
            FailureKind::Generic
        );
        assert_eq!(
            failure(Some(400), "request id 15034 rejected").kind(),
            FailureKind::Generic
        );
        assert_eq!(
            failure(Some(400), "upstream error 4010: quota").kind(),
            FailureKind::Generic
        );
        assert_eq!(
            failure(Some(400), "upstream request failed: 502 Bad Gateway -> ").kind(),
            FailureKind::ServiceUnavailable
        );
        assert_eq!(
            failure(Some(400), "generation failed with status 504").kind(),
            FailureKind::ServiceUnavailable
        );
    }

    #[tokio::test]
    async fn test_generate_text_returns_content() {
        let backend = Arc::new(FakeBackend::text(&["Courage ", "is..."]));
        let base = spawn_proxy(keyed_config(), backend.clone()).await;
        let caller = GenerationCaller::new(format!("{}/", base));
        assert_eq!(caller.endpoint(), base);

        let text = caller
            .generate_text("Write about courage", "openai/gpt-4", 1.2)
            .await
            .expect("generate");
        assert_eq!(text, "Courage is...");

        let connects = backend.connects.lock().expect("lock");
        assert_eq!(connects[0].model, "openai/gpt-4");
        assert_eq!(connects[0].temperature, 1.2);
    }

    #[tokio::test]
    async fn test_generate_with_settings_uses_stored_preferences() {
        let backend = Arc::new(FakeBackend::text(&["ok"]));
        let base = spawn_proxy(keyed_config(), backend.clone()).await;
        let settings = AISettings {
            user_id: "user-1".to_string(),
            model: "anthropic/claude-3-haiku".to_string(),
            temperature: 0.3,
        };
        GenerationCaller::new(base)
            .generate_with_settings("hi", &settings)
            .await
            .expect("generate");
        let connects = backend.connects.lock().expect("lock");
        assert_eq!(connects[0].model, "anthropic/claude-3-haiku");
        assert_eq!(connects[0].temperature, 0.3);
    }

    #[tokio::test]
    async fn test_generate_text_carries_server_errors() {
        let backend = Arc::new(FakeBackend::text(&["unused"]));
        let base = spawn_proxy(Config::default(), backend.clone()).await;
        let err = GenerationCaller::new(base.clone())
            .generate_text("hi", "openai/gpt-4", 0.7)
            .await
            .expect_err("no key");
        assert_eq!(err, failure(Some(500), "API key not configured"));

        let err = GenerationCaller::new(base)
            .generate_text("", "openai/gpt-4", 0.7)
            .await
            .expect_err("empty prompt");
        assert_eq!(err, failure(Some(400), "Prompt is required"));
        assert_eq!(backend.upstream_calls(), 0);

        let msg = "upstream request failed: 404 Not Found -> model not found";
        let backend = Arc::new(FakeBackend::new(Script::Reject(msg.to_string())));
        let base = spawn_proxy(keyed_config(), backend).await;
        let err = GenerationCaller::new(base)
            .generate_text("hi", "bad/model", 0.7)
            .await
            .expect_err("upstream failure");
        assert_eq!(err.message, msg);
        assert_eq!(err.kind(), FailureKind::MisconfiguredModel);
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_a_transport_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = GenerationCaller::new(format!("http://{}", addr))
            .generate_text("hi", "openai/gpt-4", 0.7)
            .await
            .expect_err("nothing listening");
        assert_eq!(err.status, None);
        assert_eq!(err.kind(), FailureKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_stream_text_over_http_matches_sync() {
        let parts = ["Courage ", "is ", "acting ", "anyway."];
        let backend = Arc::new(FakeBackend::text(&parts));
        let base = spawn_proxy(keyed_config(), backend).await;
        let caller = GenerationCaller::new(base);

        let deltas: Vec<String> = caller
            .stream_text("Write about courage", "openai/gpt-4", 0.7)
            .await
            .expect("stream")
            .map(|d| d.expect("delta"))
            .collect()
            .await;
        assert_eq!(deltas, parts.iter().map(|p| p.to_string()).collect::<Vec<_>>());

        let full = caller
            .generate_text("Write about courage", "openai/gpt-4", 0.7)
            .await
            .expect("sync");
        assert_eq!(deltas.concat(), full);
    }

    #[tokio::test]
    async fn test_stream_text_reports_mid_stream_error() {
        let backend = Arc::new(FakeBackend::new(Script::Deltas(vec![
            Ok("partial".to_string()),
            Err("connection reset".to_string()),
        ])));
        let base = spawn_proxy(keyed_config(), backend).await;
        let mut stream = GenerationCaller::new(base)
            .stream_text("hi", "openai/gpt-4", 0.7)
            .await
            .expect("stream starts");
        assert_eq!(stream.next().await.expect("first").expect("ok"), "partial");
        let err = stream.next().await.expect("second").expect_err("error frame");
        assert_eq!(err.to_string(), "connection reset");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_text_error_before_start() {
        let backend = Arc::new(FakeBackend::new(Script::Reject("upstream error 429: Rate limited".to_string())));
        let base = spawn_proxy(keyed_config(), backend).await;
        let err = match GenerationCaller::new(base)
            .stream_text("hi", "openai/gpt-4", 0.7)
            .await
        {
            Ok(_) => panic!("expected failure before the stream starts"),
            Err(e) => e,
        };
        assert_eq!(err, failure(Some(500), "upstream error 429: Rate limited"));
    }

    #[tokio::test]
    async fn test_routes_health_models_and_methods() {
        let backend = Arc::new(FakeBackend::text(&["ok"]));
        let base = spawn_proxy(keyed_config(), backend).await;
        let http = reqwest::Client::new();

        let health: Value = http
            .get(format!("{}/health", base))
            .send()
            .await
            .expect("health")
            .json()
            .await
            .expect("health json");
        assert_eq!(health["ok"], true);
        assert_eq!(health["api_key_configured"], true);

        let models: Value = http
            .get(format!("{}/models", base))
            .send()
            .await
            .expect("models")
            .json()
            .await
            .expect("models json");
        let ids: Vec<&str> = models["models"]
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|m| m["id"].as_str())
            .collect();
        assert!(ids.contains(&crate::models::DEFAULT_MODEL));

        let resp = http
            .get(format!("{}/generate", base))
            .send()
            .await
            .expect("get generate");
        assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

        let root: Value = http
            .post(&base)
            .body(r#""{\"prompt\":\"hi\"}""#)
            .send()
            .await
            .expect("post root")
            .json()
            .await
            .expect("root json");
        assert_eq!(root["ok"], true);
        assert_eq!(root["content"], "ok");
    }
}
