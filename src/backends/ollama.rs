//! Local Ollama engine adapter.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use super::util::{check_context_window, usage_or_estimate};
use super::{Backend, BackendError, FinishReason, GenerationParams, Provider, RawResponse};
use crate::message::Message;

const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

/// Adapter for a locally hosted Ollama server (`/api/chat`).
///
/// Ollama applies the model's own chat template server-side and reports
/// `prompt_eval_count`/`eval_count`; the prompt count is omitted when the
/// prompt was served from cache, in which case it is estimated.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    endpoint: String,
    model_id: String,
    context_window: usize,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: String,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
    num_ctx: usize,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OllamaBackend {
    /// Creates an adapter. `endpoint` defaults to `http://localhost:11434`.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`BackendError`] if the HTTP client cannot be built.
    #[instrument(skip_all, fields(model_id = %model_id))]
    pub fn new(
        model_id: String,
        endpoint: Option<String>,
        context_window: usize,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        info!("Creating Ollama backend");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::fatal(format!("Failed to build HTTP client: {}", e)))?;
        let endpoint = endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model_id,
            context_window,
        })
    }
}

#[async_trait::async_trait]
impl Backend for OllamaBackend {
    fn provider(&self) -> Provider {
        Provider::Ollama
    }

    #[instrument(skip(self, messages, params), fields(model = %self.model_id))]
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<RawResponse, BackendError> {
        check_context_window(messages, params.max_tokens, self.context_window)?;

        let request_body = ChatRequest {
            model: &self.model_id,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role().to_string(),
                    content: m.content(),
                })
                .collect(),
            stream: false,
            options: ChatOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
                num_ctx: self.context_window,
            },
        };

        debug!("Sending request to Ollama");
        let response = self
            .client
            .post(format!("{}/api/chat", self.endpoint))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                error!(error = ?e, "Ollama request failed");
                if e.is_timeout() || e.is_connect() {
                    BackendError::transient(format!("Ollama request failed: {}", e))
                } else {
                    BackendError::fatal(format!("Ollama request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!(error = ?e, "Failed to read Ollama response");
            BackendError::transient(format!("Failed to read response: {}", e))
        })?;
        if !status.is_success() {
            error!(status = %status, response = %body, "Ollama error");
            return Err(BackendError::from_status(status.as_u16(), &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            error!(error = ?e, "Failed to parse Ollama response");
            BackendError::malformed(format!("Failed to parse response: {}", e))
        })?;
        let text = parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| BackendError::malformed("No message in Ollama response"))?;

        let token_usage =
            usage_or_estimate(parsed.prompt_eval_count, parsed.eval_count, messages, &text);
        let finish_reason = match parsed.done_reason.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_string()),
            None => FinishReason::Unknown,
        };

        info!(content_length = text.len(), estimated = token_usage.estimated, "Generated completion");
        Ok(RawResponse {
            text,
            token_usage,
            finish_reason,
        })
    }
}
