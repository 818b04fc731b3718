use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use crate::llm::ClientSettings;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_APP_URL: &str = "http://localhost:8081";
pub const DEFAULT_APP_NAME: &str = "Sparks App";

/**
 * \brief Process-wide settings, read once at startup and shared read-only.
 */
#[derive(Clone)]
pub struct Config {
    /** \brief Upstream key; `None` means the deployment is not provisioned. */
    pub api_key: Option<String>,
    pub base_url: String,
    /** \brief Sent as `HTTP-Referer` for attribution. */
    pub app_url: String,
    /** \brief Sent as `X-Title` for attribution. */
    pub app_name: String,
    pub upstream_timeout: Option<Duration>,
    pub telemetry_enabled: bool,
    pub log_dir: PathBuf,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("app_url", &self.app_url)
            .field("app_name", &self.app_name)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("telemetry_enabled", &self.telemetry_enabled)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            app_url: DEFAULT_APP_URL.to_string(),
            app_name: DEFAULT_APP_NAME.to_string(),
            upstream_timeout: None,
            telemetry_enabled: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /**
     * \brief Build the configuration from process environment variables.
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief Build the configuration from an arbitrary key lookup.
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let upstream_timeout = match non_empty("SPARKS_UPSTREAM_TIMEOUT_SECS") {
            Some(raw) => Some(parse_timeout(&raw).context("invalid SPARKS_UPSTREAM_TIMEOUT_SECS")?),
            None => None,
        };

        Ok(Self {
            api_key: non_empty("OPENROUTER_API_KEY"),
            base_url: non_empty("SPARKS_UPSTREAM_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            app_url: non_empty("APP_URL").unwrap_or_else(|| DEFAULT_APP_URL.to_string()),
            app_name: non_empty("APP_NAME").unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
            upstream_timeout,
            telemetry_enabled: non_empty("SPARKS_TELEMETRY")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            log_dir: non_empty("SPARKS_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /**
     * \brief Upstream client settings for one request; `None` when no key is provisioned.
     */
    pub fn client_settings(&self, model: &str, temperature: Value) -> Option<ClientSettings> {
        let api_key = self.api_key.clone()?;
        Some(ClientSettings {
            model: model.to_string(),
            temperature,
            api_key,
            base_url: self.base_url.clone(),
            referrer: self.app_url.clone(),
            title: self.app_name.clone(),
            timeout: self.upstream_timeout,
        })
    }
}

fn parse_timeout(raw: &str) -> Result<Duration> {
    let secs: u64 = raw.trim().parse()?;
    if secs == 0 {
        return Err(anyhow!("timeout must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
