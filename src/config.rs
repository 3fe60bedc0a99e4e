//! Backend and episode configuration.

use std::path::Path;
use std::time::Duration;

use derive_getters::Getters;
use derive_more::{Display, Error};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::backends::{GenerationParams, Provider};
use crate::message::ContextPolicy;

/// One model entry of the backend configuration file.
#[derive(Debug, Clone, PartialEq, Getters, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Name players refer to the model by.
    name: String,

    /// Provider family serving the model.
    provider: Provider,

    /// Provider-side model identifier. Defaults to `name`.
    #[serde(default)]
    model_id: Option<String>,

    /// Alternative names resolving to this entry.
    #[serde(default)]
    aliases: Vec<String>,

    /// Context window in tokens.
    #[serde(default = "default_context_window")]
    context_window_tokens: usize,

    /// Sampling temperature.
    #[serde(default)]
    temperature: f32,

    /// Completion budget in tokens.
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,

    /// Endpoint override (required for self-hosted engines).
    #[serde(default)]
    endpoint: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default)]
    api_key_env: Option<String>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,

    /// Shared request budget per minute for this provider.
    #[serde(default = "default_requests_per_minute")]
    requests_per_minute: u32,
}

fn default_context_window() -> usize {
    8192
}

fn default_max_tokens() -> u32 {
    100
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_requests_per_minute() -> u32 {
    60
}

impl ModelEntry {
    /// Creates an entry with default limits.
    pub fn new(name: impl Into<String>, provider: Provider) -> Self {
        Self {
            name: name.into(),
            provider,
            model_id: None,
            aliases: Vec::new(),
            context_window_tokens: default_context_window(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            endpoint: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            requests_per_minute: default_requests_per_minute(),
        }
    }

    /// Adds an alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Sets the provider-side model identifier.
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Sets the context window.
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window_tokens = tokens;
        self
    }

    /// Returns the identifier sent to the provider.
    pub fn resolved_model_id(&self) -> &str {
        self.model_id.as_deref().unwrap_or(&self.name)
    }

    /// Returns the sampling parameters.
    pub fn generation(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    /// Returns the per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Environment variable consulted for credentials.
    ///
    /// Hosted providers fall back to `OPENAI_API_KEY` and
    /// `ANTHROPIC_API_KEY`; local engines need none.
    pub fn credential_env(&self) -> Option<&str> {
        match (&self.api_key_env, self.provider) {
            (Some(var), _) => Some(var.as_str()),
            (None, Provider::OpenAI) => Some("OPENAI_API_KEY"),
            (None, Provider::Anthropic) => Some("ANTHROPIC_API_KEY"),
            (None, _) => None,
        }
    }
}

/// Backend configuration: the models available to a run.
#[derive(Debug, Clone, Default, PartialEq, Getters, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Configured models, in priority order.
    #[serde(default)]
    models: Vec<ModelEntry>,
}

impl BackendsConfig {
    /// Creates a configuration from entries.
    pub fn new(models: Vec<ModelEntry>) -> Self {
        Self { models }
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the document is not valid backend configuration.
    #[instrument(skip(content))]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::new(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        debug!(models = config.models.len(), "Parsed backend config");
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        debug!("Loading config from file");
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("Failed to read config file: {}", e)))?;
        let config = Self::from_toml_str(&content)?;
        info!(models = config.models.len(), "Config loaded successfully");
        Ok(config)
    }

    /// Rejects entries no adapter could serve.
    fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.models {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::new("Model entry with empty name".to_string()));
            }
            if entry.provider == Provider::OpenAICompatible && entry.endpoint.is_none() {
                return Err(ConfigError::new(format!(
                    "Model '{}' uses openai_compatible but has no endpoint",
                    entry.name
                )));
            }
            if entry.max_tokens as usize >= entry.context_window_tokens {
                return Err(ConfigError::new(format!(
                    "Model '{}' max_tokens {} does not fit context window {}",
                    entry.name, entry.max_tokens, entry.context_window_tokens
                )));
            }
        }
        Ok(())
    }
}

/// Bounded retry of transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Setters)]
#[setters(prefix = "with_")]
pub struct RetryPolicy {
    /// Total attempts per request, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` after `attempt` failures:
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Whether a clarification re-prompt occupies a slot of the turn limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetryAccounting {
    /// Retries are charged only against the per-player violation budget.
    #[default]
    Exempt,
    /// Every retry also counts as a turn toward `max_turns`.
    ConsumesTurn,
}

/// Explicit per-episode configuration handed to the game master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Setters)]
#[setters(prefix = "with_")]
pub struct EpisodeConfig {
    /// Hard upper bound on game-progress turns.
    pub max_turns: usize,
    /// Invalid responses tolerated per player before aborting.
    pub violation_limit: u32,
    /// Transient provider failure handling.
    pub provider_retry: RetryPolicy,
    /// How clarification re-prompts are charged.
    pub retry_accounting: RetryAccounting,
    /// Context bounds applied to every player.
    pub context_policy: ContextPolicy,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            violation_limit: 2,
            provider_retry: RetryPolicy::default(),
            retry_accounting: RetryAccounting::Exempt,
            context_policy: ContextPolicy::default(),
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, Display, Error)]
#[display("Config error: {} at {}:{}", message, file, line)]
pub struct ConfigError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(message: String) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message,
            line: loc.line(),
            file: loc.file(),
        }
    }
}
