//! Anthropic messages API adapter.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use super::util::{check_context_window, ensure_alternating_roles, split_system, usage_or_estimate};
use super::{Backend, BackendError, FinishReason, GenerationParams, Provider, RawResponse};
use crate::message::{Message, Role};

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Adapter for Anthropic Claude models.
///
/// The API requires strictly alternating user/assistant turns starting with
/// a user turn and takes the system prompt in a separate field, so history
/// is normalized before sending.
#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model_id: String,
    context_window: usize,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl AnthropicBackend {
    /// Creates an adapter. `endpoint` defaults to the public messages API.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`BackendError`] if the HTTP client cannot be built.
    #[instrument(skip_all, fields(model_id = %model_id))]
    pub fn new(
        api_key: String,
        model_id: String,
        endpoint: Option<String>,
        context_window: usize,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        info!("Creating Anthropic backend");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::fatal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            model_id,
            context_window,
        })
    }

    fn wire_messages(messages: &[Message]) -> (Option<String>, Vec<WireMessage>) {
        let (system, conversation) = split_system(messages);
        let wire = ensure_alternating_roles(&conversation, true)
            .into_iter()
            .skip_while(|m| m.role() == Role::Assistant)
            .map(|m| WireMessage {
                role: match m.role() {
                    Role::Assistant => "assistant",
                    _ => "user",
                },
                content: m.content().to_string(),
            })
            .collect();
        (system, wire)
    }
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
        None => FinishReason::Unknown,
    }
}

#[async_trait::async_trait]
impl Backend for AnthropicBackend {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    #[instrument(skip(self, messages, params), fields(model = %self.model_id))]
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<RawResponse, BackendError> {
        check_context_window(messages, params.max_tokens, self.context_window)?;

        debug!("Building Anthropic API request");
        let (system, wire) = Self::wire_messages(messages);
        if wire.is_empty() {
            return Err(BackendError::fatal("No user message to send"));
        }
        let request_body = MessagesRequest {
            model: &self.model_id,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            system,
            messages: wire,
        };

        debug!("Sending request to Anthropic");
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                error!(error = ?e, "Anthropic API request failed");
                if e.is_timeout() || e.is_connect() {
                    BackendError::transient(format!("Anthropic API request failed: {}", e))
                } else {
                    BackendError::fatal(format!("Anthropic API request failed: {}", e))
                }
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            error!(error = ?e, "Failed to read Anthropic response");
            BackendError::transient(format!("Failed to read response: {}", e))
        })?;

        if !status.is_success() {
            error!(status = %status, response = %response_text, "Anthropic API error");
            return Err(BackendError::from_status(status.as_u16(), &response_text));
        }

        debug!(response_length = response_text.len(), "Parsing Anthropic response");
        let parsed: MessagesResponse = serde_json::from_str(&response_text).map_err(|e| {
            error!(error = ?e, response = %response_text, "Failed to parse Anthropic response");
            BackendError::malformed(format!("Failed to parse response: {}", e))
        })?;

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        if text.is_empty() && parsed.content.iter().all(|b| b.kind != "text") {
            error!("No text content in Anthropic response");
            return Err(BackendError::malformed("No text content in Anthropic response"));
        }

        let (prompt, completion) = match &parsed.usage {
            Some(usage) => (usage.input_tokens, usage.output_tokens),
            None => (None, None),
        };
        let token_usage = usage_or_estimate(prompt, completion, messages, &text);

        info!(content_length = text.len(), "Generated completion");
        Ok(RawResponse {
            text,
            token_usage,
            finish_reason: finish_reason(parsed.stop_reason.as_deref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_is_lifted_and_roles_alternate() {
        let messages = vec![
            Message::system("Play fair."),
            Message::assistant("stray"),
            Message::user("a"),
            Message::user("b"),
            Message::assistant("c"),
        ];
        let (system, wire) = AnthropicBackend::wire_messages(&messages);
        assert_eq!(system.as_deref(), Some("Play fair."));
        let roles: Vec<_> = wire.iter().map(|m| m.role).collect();
        assert_eq!(roles, ["user", "assistant"]);
        assert_eq!(wire[0].content, "a\n\nb");
    }

    #[test]
    fn stop_reasons_are_normalized() {
        assert_eq!(finish_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(finish_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(finish_reason(None), FinishReason::Unknown);
    }
}
