//! Backend adapters: one uniform generation contract over many providers.
//!
//! Every provider family implements [`Backend`]. Adapters normalize their
//! provider's request format, error codes and token accounting into a
//! [`RawResponse`] so that nothing downstream branches on provider identity.

mod anthropic;
mod error;
mod guard;
mod ollama;
mod openai;
mod programmatic;
mod rate_limit;
mod scripted;
mod util;

pub use anthropic::AnthropicBackend;
pub use error::{BackendError, BackendErrorKind};
pub use guard::GuardedBackend;
pub use ollama::OllamaBackend;
pub use openai::OpenAIBackend;
pub use programmatic::ProgrammaticBackend;
pub use rate_limit::{ProviderUsage, QuotaRegistry, RateLimiter, UsageSnapshot};
pub use scripted::{ScriptedBackend, ScriptedReply};
pub use util::{
    check_context_window, ensure_alternating_roles, estimate_message_tokens, estimate_tokens,
    estimate_usage,
};

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Provider family an adapter talks to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum Provider {
    /// OpenAI hosted API.
    #[serde(rename = "openai")]
    #[strum(serialize = "openai")]
    OpenAI,
    /// Self-hosted OpenAI-compatible server (vLLM, llama.cpp, LM Studio).
    #[serde(rename = "openai_compatible")]
    #[strum(serialize = "openai_compatible")]
    OpenAICompatible,
    /// Anthropic hosted API.
    #[serde(rename = "anthropic")]
    #[strum(serialize = "anthropic")]
    Anthropic,
    /// Local Ollama engine.
    #[serde(rename = "ollama")]
    #[strum(serialize = "ollama")]
    Ollama,
    /// Scripted game logic standing in for a model.
    #[serde(rename = "programmatic")]
    #[strum(serialize = "programmatic")]
    Programmatic,
    /// Pre-recorded replies, used for tests and transcript replay.
    #[serde(rename = "scripted")]
    #[strum(serialize = "scripted")]
    Scripted,
}

/// Sampling parameters sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: f32,
    /// Completion budget in tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    100
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Prompt and completion token counts for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the request.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// `true` when at least one count came from the fallback estimate.
    pub estimated: bool,
}

impl TokenUsage {
    /// Prompt plus completion tokens.
    pub fn total(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the completion or a stop sequence.
    Stop,
    /// Completion budget exhausted.
    Length,
    /// Provider-side content filtering.
    ContentFilter,
    /// Anything else the provider reported.
    Other(String),
    /// The provider did not report a reason.
    Unknown,
}

/// Normalized result of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    /// Generated text.
    pub text: String,
    /// Token accounting, exact or estimated.
    pub token_usage: TokenUsage,
    /// Stop reason.
    pub finish_reason: FinishReason,
}

/// A provider adapter bound to one model.
///
/// Implementations perform exactly one provider call per invocation; retries
/// belong to the game master so they show up in the transcript.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Provider family of this adapter.
    fn provider(&self) -> Provider;

    /// Generates a completion for the full message history.
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<RawResponse, BackendError>;

    /// Generates one completion per history in `requests`, in order.
    ///
    /// Adapters with a native batch endpoint override this. The default
    /// calls [`Backend::generate`] once per history.
    async fn generate_batch(
        &self,
        requests: &[Vec<Message>],
        params: &GenerationParams,
    ) -> Vec<Result<RawResponse, BackendError>> {
        let mut responses = Vec::with_capacity(requests.len());
        for messages in requests {
            responses.push(self.generate(messages, params).await);
        }
        responses
    }
}
