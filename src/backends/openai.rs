//! OpenAI and OpenAI-compatible chat completion adapter.

use std::time::Duration;

use async_openai::{
    Client as OpenAIClient,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, FinishReason as OpenAIFinishReason,
    },
};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, error, info, instrument};

use super::util::{check_context_window, usage_or_estimate};
use super::{Backend, BackendError, FinishReason, GenerationParams, Provider, RawResponse};
use crate::message::{Message, Role};

/// Adapter for the OpenAI chat completions API.
///
/// Also serves self-hosted engines exposing the same API (vLLM, llama.cpp,
/// LM Studio) when constructed with [`OpenAIBackend::compatible`]; those
/// servers often omit usage, so counts fall back to the estimate.
#[derive(Debug, Clone)]
pub struct OpenAIBackend {
    client: OpenAIClient<OpenAIConfig>,
    provider: Provider,
    model_id: String,
    context_window: usize,
}

impl OpenAIBackend {
    /// Creates an adapter for the hosted OpenAI API.
    #[instrument(skip_all, fields(model_id = %model_id))]
    pub fn new(api_key: String, model_id: String, context_window: usize) -> Self {
        info!("Creating OpenAI backend");
        Self {
            client: OpenAIClient::with_config(OpenAIConfig::new().with_api_key(api_key))
                .with_backoff(single_attempt()),
            provider: Provider::OpenAI,
            model_id,
            context_window,
        }
    }

    /// Creates an adapter for an OpenAI-compatible server at `api_base`.
    #[instrument(skip_all, fields(model_id = %model_id, api_base = %api_base))]
    pub fn compatible(
        api_base: String,
        api_key: Option<String>,
        model_id: String,
        context_window: usize,
    ) -> Self {
        info!("Creating OpenAI-compatible backend");
        let config = OpenAIConfig::new()
            .with_api_base(api_base)
            .with_api_key(api_key.unwrap_or_else(|| "EMPTY".to_string()));
        Self {
            client: OpenAIClient::with_config(config).with_backoff(single_attempt()),
            provider: Provider::OpenAICompatible,
            model_id,
            context_window,
        }
    }

    fn build_messages(
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, BackendError> {
        messages
            .iter()
            .map(|message| {
                let built = match message.role() {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(message.content())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(message.content())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(message.content())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| {
                    error!(error = ?e, role = %message.role(), "Failed to build message");
                    BackendError::fatal(format!("Failed to build {} message: {}", message.role(), e))
                })
            })
            .collect()
    }
}

/// Backoff policy that gives up after the first failure, so 429 and 5xx
/// responses reach [`classify`] and the game master's retry budget.
fn single_attempt() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build()
}

/// Maps async-openai failures onto the backend taxonomy.
fn classify(err: OpenAIError) -> BackendError {
    match err {
        OpenAIError::Reqwest(e) => {
            let retryable_status = e
                .status()
                .is_some_and(|s| s.as_u16() == 429 || s.is_server_error());
            if e.is_timeout() || e.is_connect() || retryable_status {
                BackendError::transient(format!("OpenAI transport error: {}", e))
            } else {
                BackendError::fatal(format!("OpenAI transport error: {}", e))
            }
        }
        OpenAIError::ApiError(api) => {
            let detail = format!("{:?}", api).to_lowercase();
            // async-openai reports 5xx bodies verbatim, without an error type.
            let server_error = api.r#type.is_none();
            if server_error
                || detail.contains("rate_limit")
                || detail.contains("server_error")
                || detail.contains("overloaded")
            {
                BackendError::transient(format!("OpenAI API error: {}", api.message))
            } else {
                BackendError::fatal(format!("OpenAI API error: {}", api.message))
            }
        }
        OpenAIError::JSONDeserialize(e) => {
            BackendError::malformed(format!("Failed to decode OpenAI response: {}", e))
        }
        other => BackendError::fatal(format!("OpenAI error: {}", other)),
    }
}

fn finish_reason(reason: Option<OpenAIFinishReason>) -> FinishReason {
    match reason {
        Some(OpenAIFinishReason::Stop) => FinishReason::Stop,
        Some(OpenAIFinishReason::Length) => FinishReason::Length,
        Some(OpenAIFinishReason::ContentFilter) => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(format!("{:?}", other).to_lowercase()),
        None => FinishReason::Unknown,
    }
}

#[async_trait::async_trait]
impl Backend for OpenAIBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    #[instrument(skip(self, messages, params), fields(provider = %self.provider, model = %self.model_id))]
    #[allow(deprecated)]
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<RawResponse, BackendError> {
        check_context_window(messages, params.max_tokens, self.context_window)?;

        debug!("Building chat completion request");
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_id)
            .messages(Self::build_messages(messages)?)
            .max_tokens(params.max_tokens)
            .temperature(params.temperature)
            .build()
            .map_err(|e| {
                error!(error = ?e, "Failed to build request");
                BackendError::fatal(format!("Failed to build request: {}", e))
            })?;

        debug!("Sending request to OpenAI");
        let response = self.client.chat().create(request).await.map_err(classify)?;

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            error!("No choices in OpenAI response");
            BackendError::malformed("No choices in OpenAI response")
        })?;
        let text = choice.message.content.ok_or_else(|| {
            error!("No content in OpenAI response");
            BackendError::malformed("No content in OpenAI response")
        })?;

        let (prompt, completion) = match response.usage {
            Some(usage) => (Some(usage.prompt_tokens), Some(usage.completion_tokens)),
            None => (None, None),
        };
        let token_usage = usage_or_estimate(prompt, completion, messages, &text);

        info!(content_length = text.len(), estimated = token_usage.estimated, "Generated completion");
        Ok(RawResponse {
            text,
            token_usage,
            finish_reason: finish_reason(choice.finish_reason),
        })
    }
}
