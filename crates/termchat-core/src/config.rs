//! Client configuration: a JSON file validated into an immutable [`ChatConfig`].
//!
//! ```json
//! {
//!   "max_retries": 3,
//!   "system_prompt": "You are a helpful assistant.",
//!   "dynamic_prompt": "Current directory: $PWD",
//!   "providers": {
//!     "active": "openrouter",
//!     "models": {
//!       "openrouter": {
//!         "model": "openai/gpt-4-turbo",
//!         "api_key": "${OPENROUTER_API_KEY}",
//!         "model_endpoint": "https://openrouter.ai/api/v1/chat/completions"
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_PROVIDER: &str = "openrouter";
pub const DEFAULT_MODEL: &str = "openai/gpt-4-turbo";
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Environment variables consulted, in order, when no credential is configured.
pub const API_KEY_ENV_VARS: [&str; 2] = ["TERMCHAT_API_KEY", "OPENROUTER_API_KEY"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("undefined variable ${{{name}}} in config (not set in environment)")]
    UndefinedVariable { name: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    max_retries: Option<u32>,
    system_prompt: Option<String>,
    #[serde(default)]
    dynamic_prompt: String,
    #[serde(default)]
    encrypted: bool,
    providers: RawProviders,
    backoff_unit_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
    capture_history_length: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProviders {
    active: String,
    #[serde(default)]
    models: HashMap<String, RawModel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModel {
    model: String,
    #[serde(default)]
    api_key: String,
    model_endpoint: String,
}

/// Validated client configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Name of the active provider entry.
    pub provider: String,
    /// Provider-specific model id.
    pub model: String,
    /// Bearer credential.
    pub api_key: String,
    /// Chat-completions URL.
    pub endpoint: String,
    /// Total attempt budget per turn (at least 1).
    pub max_retries: u32,
    pub system_prompt: String,
    /// Appended to the system prompt after `$VAR` expansion.
    pub dynamic_prompt: String,
    /// Backoff before retry `n` is `backoff_unit * 2^n`.
    pub backoff_unit: Duration,
    pub connect_timeout: Duration,
    /// Number of terminal lines captured into the system prompt.
    pub capture_history_length: usize,
}

impl fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("max_retries", &self.max_retries)
            .field("backoff_unit", &self.backoff_unit)
            .field("connect_timeout", &self.connect_timeout)
            .field("capture_history_length", &self.capture_history_length)
            .finish_non_exhaustive()
    }
}

impl ChatConfig {
    /// OpenRouter defaults with the given credential.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_retries: 3,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            dynamic_prompt: String::new(),
            backoff_unit: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            capture_history_length: 20,
        }
    }

    /// Builds the default configuration from `TERMCHAT_API_KEY` or
    /// `OPENROUTER_API_KEY`, honoring `TERMCHAT_MODEL` and `TERMCHAT_ENDPOINT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new(api_key_from(&lookup).unwrap_or_default());
        if let Some(model) = lookup("TERMCHAT_MODEL").filter(|m| !m.trim().is_empty()) {
            config.model = model;
        }
        if let Some(endpoint) = lookup("TERMCHAT_ENDPOINT").filter(|e| !e.trim().is_empty()) {
            config.endpoint = endpoint;
        }
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parses and validates JSON config text, resolving `${VAR}` references
    /// from the process environment.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_json_with(text, |key| std::env::var(key).ok())
    }

    fn from_json_with(
        text: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        if raw.encrypted {
            return Err(ConfigError::Validation(
                "encrypted configuration values are not supported".into(),
            ));
        }

        let active = raw.providers.active.trim().to_string();
        let Some(entry) = raw.providers.models.get(&active) else {
            return Err(ConfigError::Validation(format!(
                "active provider '{active}' has no entry under providers.models"
            )));
        };

        let mut api_key = resolve_variables(&entry.api_key, &lookup)?;
        if api_key.trim().is_empty() {
            api_key = api_key_from(&lookup).unwrap_or_default();
        }

        let defaults = Self::new(String::new());
        let config = Self {
            provider: active,
            model: resolve_variables(&entry.model, &lookup)?,
            api_key,
            endpoint: resolve_variables(&entry.model_endpoint, &lookup)?,
            max_retries: raw.max_retries.unwrap_or(defaults.max_retries),
            system_prompt: raw.system_prompt.unwrap_or(defaults.system_prompt),
            dynamic_prompt: raw.dynamic_prompt,
            backoff_unit: raw
                .backoff_unit_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_unit),
            connect_timeout: raw
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            capture_history_length: raw
                .capture_history_length
                .unwrap_or(defaults.capture_history_length),
        };
        config.validate()?;
        Ok(config)
    }

    /// Overrides the model id.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Overrides the endpoint (proxies or test servers).
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Overrides the attempt budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Overrides the backoff unit.
    pub fn backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn dynamic_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.dynamic_prompt = prompt.into();
        self
    }

    /// Checks the invariants the client relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation("model must not be empty".into()));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "missing API key for provider '{}' (set {} or {})",
                self.provider, API_KEY_ENV_VARS[0], API_KEY_ENV_VARS[1]
            )));
        }
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::Validation(format!("invalid endpoint '{}': {e}", self.endpoint))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "endpoint must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Validation(
                "max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn api_key_from(lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    API_KEY_ENV_VARS
        .iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.trim().is_empty())
}

/// Resolves `${VAR}` references; an unset variable is an error.
fn resolve_variables(
    input: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            if !closed || name.is_empty() {
                // malformed, keep literally
                result.push_str("${");
                result.push_str(&name);
                continue;
            }
            let value = lookup(&name).ok_or(ConfigError::UndefinedVariable { name })?;
            result.push_str(&value);
        } else {
            result.push(ch);
        }
    }
    Ok(result)
}

/// Shell-style expansion of `$VAR` and `${VAR}`. Unset variables expand to
/// an empty string.
pub fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            if closed {
                result.push_str(&lookup(&name).unwrap_or_default());
            } else {
                result.push_str("${");
                result.push_str(&name);
            }
            continue;
        }
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            result.push('$');
        } else {
            result.push_str(&lookup(&name).unwrap_or_default());
        }
    }
    result
}
