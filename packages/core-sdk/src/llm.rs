use std::{pin::Pin, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::models::Message;

/** \brief Forward-only sequence of text deltas; ends when the provider signals completion. */
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/**
 * \brief Everything needed to talk to the chat-completion provider for one request.
 */
#[derive(Clone)]
pub struct ClientSettings {
    pub model: String,
    /** \brief Sent to the provider exactly as the caller supplied it. */
    pub temperature: Value,
    pub api_key: String,
    pub base_url: String,
    /** \brief `HTTP-Referer` attribution header. */
    pub referrer: String,
    /** \brief `X-Title` attribution header. */
    pub title: String,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("referrer", &self.referrer)
            .field("title", &self.title)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/**
 * \brief A configured chat model: one-shot or incremental generation for a single prompt.
 */
#[async_trait]
pub trait ChatModel: Send + Sync {
    /**
     * \brief Wait for the complete answer.
     */
    async fn invoke(&self, prompt: &str) -> Result<String>;

    /**
     * \brief Start an incremental answer. Errors raised before the first delta are
     * returned here; later ones arrive as stream items.
     */
    async fn stream(&self, prompt: &str) -> Result<DeltaStream>;
}

/**
 * \brief Builds chat models from per-request settings.
 */
pub trait ModelBackend: Send + Sync {
    fn connect(&self, settings: ClientSettings) -> Result<Box<dyn ChatModel>>;
}

/**
 * \brief Backend that talks to the real OpenAI-compatible router.
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenRouterBackend;

impl ModelBackend for OpenRouterBackend {
    fn connect(&self, settings: ClientSettings) -> Result<Box<dyn ChatModel>> {
        Ok(Box::new(UpstreamClient::new(settings)?))
    }
}

/**
 * \brief reqwest-based client for `{base_url}/chat/completions`.
 */
pub struct UpstreamClient {
    http: reqwest::Client,
    settings: ClientSettings,
}

impl UpstreamClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", settings.api_key))
            .context("API key is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            "http-referer",
            HeaderValue::from_str(&settings.referrer).context("invalid referrer header")?,
        );
        headers.insert(
            "x-title",
            HeaderValue::from_str(&settings.title).context("invalid title header")?,
        );

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = settings.timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build()?;
        Ok(Self { http, settings })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let body = json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "messages": [Message::user(prompt)],
            "stream": stream
        });

        let mut req = self.http.post(self.completions_url()).json(&body);
        // A whole-request timeout would cut long streams short.
        if !stream {
            if let Some(timeout) = self.settings.timeout {
                req = req.timeout(timeout);
            }
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("upstream request failed: {} -> {}", status, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatModel for UpstreamClient {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        let resp = self.send(prompt, false).await?;
        let text = resp.text().await?;
        let v: Value = serde_json::from_str(&text).map_err(|e| {
            anyhow!(
                "upstream returned an unparseable body: {} ({})",
                e,
                preview(&text)
            )
        })?;
        extract_openai_content(&v)
    }

    async fn stream(&self, prompt: &str) -> Result<DeltaStream> {
        let resp = self.send(prompt, true).await?;
        Ok(Box::pin(sse_deltas(resp.bytes_stream())))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseBlock {
    Delta(String),
    /** \brief Chunk carrying a `finish_reason`, possibly with a last piece of text. */
    Finished(Option<String>),
    Done,
    Skip,
}

/**
 * \brief Split a raw event-stream body into the data payloads of its events.
 * Comment-only events are skipped; `\r\n` line endings are accepted.
 */
pub fn sse_data<S, B, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buf = Vec::<u8>::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            buf.extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));
            while let Some(pos) = find_double_newline(&buf) {
                let block = buf.drain(..pos + 2).collect::<Vec<u8>>();
                if let Some(data) = extract_data(&block) {
                    yield data;
                }
            }
        }

        if let Some(data) = extract_data(&buf) {
            yield data;
        }
    }
}

/**
 * \brief Turn a raw chat-completion event stream into text deltas.
 * The provider must signal completion with `[DONE]` or a `finish_reason`;
 * a body that ends without either yields a final error.
 */
pub fn sse_deltas<S, B, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    try_stream! {
        let mut frames = Box::pin(sse_data(bytes));
        let mut completed = false;
        while let Some(data) = frames.next().await {
            match parse_data(&data?)? {
                SseBlock::Delta(delta) => {
                    yield delta;
                }
                SseBlock::Finished(last) => {
                    completed = true;
                    if let Some(delta) = last {
                        yield delta;
                    }
                }
                // Dropping `frames` here releases the connection.
                SseBlock::Done => {
                    completed = true;
                    break;
                }
                SseBlock::Skip => {}
            }
        }
        if !completed {
            Err::<(), _>(anyhow!("upstream stream ended before completion"))?;
        }
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn parse_data(data: &str) -> Result<SseBlock> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseBlock::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseBlock::Done);
    }
    let v: Value = serde_json::from_str(data)
        .map_err(|e| anyhow!("malformed upstream event: {} ({})", e, preview(data)))?;
    if let Some(err) = v.get("error") {
        return Err(anyhow!(upstream_error_message(err)));
    }
    let delta = parse_openai_delta(&v).filter(|d| !d.is_empty());
    Ok(match (delta, has_finish_reason(&v)) {
        (delta, true) => SseBlock::Finished(delta),
        (Some(delta), false) => SseBlock::Delta(delta),
        (None, false) => SseBlock::Skip,
    })
}

fn has_finish_reason(v: &Value) -> bool {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .is_some_and(|r| !r.is_null())
}

fn parse_openai_delta(v: &Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_openai_content(v: &Value) -> Result<String> {
    if let Some(err) = v.get("error") {
        return Err(anyhow!(upstream_error_message(err)));
    }
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("upstream response has no message content: {}", preview(&v.to_string())))
}

fn upstream_error_message(err: &Value) -> String {
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| err.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| err.to_string());
    match err.get("code") {
        Some(code) if !code.is_null() => format!("upstream error {}: {}", code, message),
        _ => format!("upstream error: {}", message),
    }
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 200;
    match text.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
