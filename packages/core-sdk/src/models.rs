use serde::{Deserialize, Serialize};
use serde_json::Value;

/** \brief Baseline model used when a request does not name one. */
pub const DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo";

/** \brief Sampling temperature used when a request does not set one. */
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/**
 * \brief A validated generation request with defaults already applied.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /** \brief Non-empty prompt text. */
    pub prompt: String,
    pub model: String,
    /** \brief Forwarded and echoed as-is; the upstream provider owns type and range checks. */
    pub temperature: Value,
}

/**
 * \brief Synchronous endpoint payload: `{ok, content, model, temperature}` or `{ok:false, error}`.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerationResponse {
    Success {
        ok: bool,
        content: String,
        model: String,
        temperature: Value,
    },
    Failure {
        ok: bool,
        error: String,
    },
}

impl GenerationResponse {
    pub fn success(content: String, model: String, temperature: Value) -> Self {
        GenerationResponse::Success {
            ok: true,
            content,
            model,
            temperature,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        GenerationResponse::Failure {
            ok: false,
            error: error.into(),
        }
    }
}

/**
 * \brief One event of the streaming endpoint.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerationChunk {
    Content { content: String },
    Done { done: bool },
    Error { error: String },
}

/**
 * \brief Per-user generation preferences kept by the document store.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AISettings {
    #[serde(default)]
    pub user_id: String,
    pub model: String,
    pub temperature: f64,
}

impl Default for AISettings {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/**
 * \brief Chat message, same shape as the OpenAI chat format.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief system/user/assistant */
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief Catalog entry for a model offered through the router.
 */
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub is_free: bool,
    pub provider: &'static str,
}

pub const AVAILABLE_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "meta-llama/llama-3.2-3b-instruct:free",
        name: "Llama 3.2 3B (Free)",
        description: "Fast free model from Meta",
        is_free: true,
        provider: "Meta",
    },
    ModelInfo {
        id: "meta-llama/llama-3.2-1b-instruct:free",
        name: "Llama 3.2 1B (Free)",
        description: "Very fast free model",
        is_free: true,
        provider: "Meta",
    },
    ModelInfo {
        id: "google/gemma-2-9b-it:free",
        name: "Gemma 2 9B (Free)",
        description: "Free model from Google",
        is_free: true,
        provider: "Google",
    },
    ModelInfo {
        id: "microsoft/phi-3-mini-128k-instruct:free",
        name: "Phi-3 Mini (Free)",
        description: "Compact model from Microsoft",
        is_free: true,
        provider: "Microsoft",
    },
    ModelInfo {
        id: "qwen/qwen-2-7b-instruct:free",
        name: "Qwen 2 7B (Free)",
        description: "Free model from Alibaba",
        is_free: true,
        provider: "Alibaba",
    },
    ModelInfo {
        id: "openai/gpt-3.5-turbo",
        name: "GPT-3.5 Turbo",
        description: "Fast and cheap",
        is_free: false,
        provider: "OpenAI",
    },
    ModelInfo {
        id: "openai/gpt-4o-mini",
        name: "GPT-4o Mini",
        description: "Balance of quality and cost",
        is_free: false,
        provider: "OpenAI",
    },
    ModelInfo {
        id: "anthropic/claude-3-haiku",
        name: "Claude 3 Haiku",
        description: "Fast and precise",
        is_free: false,
        provider: "Anthropic",
    },
    ModelInfo {
        id: "google/gemini-pro",
        name: "Gemini Pro",
        description: "Capable model from Google",
        is_free: false,
        provider: "Google",
    },
];

pub fn free_models() -> impl Iterator<Item = &'static ModelInfo> {
    AVAILABLE_MODELS.iter().filter(|m| m.is_free)
}

pub fn paid_models() -> impl Iterator<Item = &'static ModelInfo> {
    AVAILABLE_MODELS.iter().filter(|m| !m.is_free)
}

/**
 * \brief Look up a catalog entry by router id.
 */
pub fn find_model(id: &str) -> Option<&'static ModelInfo> {
    AVAILABLE_MODELS.iter().find(|m| m.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_response_shape() {
        let resp = GenerationResponse::success(
            "Courage is...".to_string(),
            "openai/gpt-4".to_string(),
            json!(1.2),
        );
        let v = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(
            v,
            json!({"ok": true, "content": "Courage is...", "model": "openai/gpt-4", "temperature": 1.2})
        );
    }

    #[test]
    fn test_failure_response_shape() {
        let v = serde_json::to_value(GenerationResponse::failure("boom")).expect("serialize");
        assert_eq!(v, json!({"ok": false, "error": "boom"}));
    }

    #[test]
    fn test_chunk_shapes() {
        let content = GenerationChunk::Content {
            content: "hi".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&content).expect("serialize"),
            r#"{"content":"hi"}"#
        );
        let done = GenerationChunk::Done { done: true };
        assert_eq!(
            serde_json::to_string(&done).expect("serialize"),
            r#"{"done":true}"#
        );
        let parsed: GenerationChunk =
            serde_json::from_str(r#"{"error":"lost"}"#).expect("deserialize");
        assert_eq!(
            parsed,
            GenerationChunk::Error {
                error: "lost".to_string()
            }
        );
    }

    #[test]
    fn test_ai_settings_default_matches_baseline() {
        let s = AISettings::default();
        assert_eq!(s.model, DEFAULT_MODEL);
        assert_eq!(s.temperature, DEFAULT_TEMPERATURE);
    }

    #[test]
    fn test_catalog_filters_partition_models() {
        let free = free_models().count();
        let paid = paid_models().count();
        assert_eq!(free + paid, AVAILABLE_MODELS.len());
        assert!(free_models().all(|m| m.id.ends_with(":free")));
        assert!(find_model(DEFAULT_MODEL).is_some());
        assert!(find_model("nope/unknown").is_none());
    }
}
