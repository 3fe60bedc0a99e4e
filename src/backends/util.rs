//! Request shaping helpers shared by the adapters.

use tracing::{debug, instrument};

use super::{BackendError, TokenUsage};
use crate::message::{Message, Role};

/// Fixed per-message overhead added by chat templates (role markers, separators).
pub const MESSAGE_FRAMING_TOKENS: usize = 4;

/// Characters per token assumed by the fallback estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimates the token count of `text` as `ceil(chars / 4)`.
///
/// Used whenever a provider does not report exact usage.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Estimates the tokens one chat message occupies, framing included.
pub fn estimate_message_tokens(text: &str) -> usize {
    estimate_tokens(text) + MESSAGE_FRAMING_TOKENS
}

/// Estimates usage for a request/response pair using the fallback rule.
pub fn estimate_usage(messages: &[Message], completion: &str) -> TokenUsage {
    let prompt: usize = messages
        .iter()
        .map(|m| estimate_message_tokens(m.content()))
        .sum();
    TokenUsage {
        prompt_tokens: saturate(prompt),
        completion_tokens: saturate(estimate_tokens(completion)),
        estimated: true,
    }
}

/// Combines provider-reported counts with the fallback for missing halves.
pub fn usage_or_estimate(
    prompt: Option<u32>,
    completion: Option<u32>,
    messages: &[Message],
    text: &str,
) -> TokenUsage {
    match (prompt, completion) {
        (Some(prompt_tokens), Some(completion_tokens)) => TokenUsage {
            prompt_tokens,
            completion_tokens,
            estimated: false,
        },
        (prompt, completion) => {
            let fallback = estimate_usage(messages, text);
            TokenUsage {
                prompt_tokens: prompt.unwrap_or(fallback.prompt_tokens),
                completion_tokens: completion.unwrap_or(fallback.completion_tokens),
                estimated: true,
            }
        }
    }
}

fn saturate(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Refuses a request whose prompt plus completion budget exceeds the window.
#[instrument(skip(messages), fields(messages = messages.len()))]
pub fn check_context_window(
    messages: &[Message],
    max_tokens: u32,
    context_window: usize,
) -> Result<(), BackendError> {
    let prompt: usize = messages
        .iter()
        .map(|m| estimate_message_tokens(m.content()))
        .sum();
    let needed = prompt + max_tokens as usize;
    if needed > context_window {
        return Err(BackendError::fatal(format!(
            "context overflow: {} prompt tokens + {} completion tokens exceed window of {}",
            prompt, max_tokens, context_window
        )));
    }
    debug!(prompt, needed, context_window, "Request fits context window");
    Ok(())
}

/// Merges consecutive same-role messages so roles strictly alternate.
///
/// Merged contents are joined by a blank line. An empty system message is
/// removed when `cull_empty_system` is set.
pub fn ensure_alternating_roles(messages: &[Message], cull_empty_system: bool) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        if cull_empty_system && message.role() == Role::System && message.content().is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.role() == message.role() => {
                let merged = format!("{}\n\n{}", last.content(), message.content());
                let pinned = last.is_pinned() || message.is_pinned();
                let mut replacement = Message::new(message.role(), merged);
                if pinned {
                    replacement = replacement.pinned();
                }
                *last = replacement;
            }
            _ => out.push(message.clone()),
        }
    }
    out
}

/// Splits system messages from the conversation for providers with a
/// dedicated system field.
pub fn split_system(messages: &[Message]) -> (Option<String>, Vec<Message>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role() == Role::System)
        .map(Message::content)
        .filter(|c| !c.is_empty())
        .collect();
    let rest = messages
        .iter()
        .filter(|m| m.role() != Role::System)
        .cloned()
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, rest)
}
