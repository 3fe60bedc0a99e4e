//! Backend that plays back a fixed queue of replies.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::util::estimate_usage;
use super::{Backend, BackendError, BackendErrorKind, FinishReason, GenerationParams, Provider, RawResponse};
use crate::message::{Message, SnapshotMessage};

/// One queued outcome of a [`ScriptedBackend`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Answer immediately with this text.
    Text(String),
    /// Answer with this text after a delay (exercises timeouts).
    Delayed {
        /// How long the call takes.
        after: Duration,
        /// Text returned once the delay elapses.
        text: String,
    },
    /// Fail with this error.
    Error(BackendErrorKind),
}

impl ScriptedReply {
    /// Immediate text reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Delayed text reply.
    pub fn delayed(after: Duration, text: impl Into<String>) -> Self {
        Self::Delayed {
            after,
            text: text.into(),
        }
    }

    /// Transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Error(BackendErrorKind::Transient(message.into()))
    }

    /// Fatal failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Error(BackendErrorKind::Fatal(message.into()))
    }
}

/// Replays queued replies in order and records every request it receives.
///
/// Once the queue is empty every call fails fatally, so a game that asks for
/// more turns than were scripted ends instead of hanging.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<Vec<SnapshotMessage>>>,
}

impl ScriptedBackend {
    /// Creates a backend that answers with `replies` in order.
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Creates a backend answering with plain texts.
    pub fn from_texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(texts.into_iter().map(ScriptedReply::text))
    }

    /// Returns the histories received so far, oldest first.
    pub async fn requests(&self) -> Vec<Vec<SnapshotMessage>> {
        self.requests.lock().await.clone()
    }

    /// Returns the number of replies not yet consumed.
    pub async fn remaining(&self) -> usize {
        self.replies.lock().await.len()
    }
}

#[async_trait::async_trait]
impl Backend for ScriptedBackend {
    fn provider(&self) -> Provider {
        Provider::Scripted
    }

    #[instrument(skip(self, messages, _params), fields(messages = messages.len()))]
    async fn generate(
        &self,
        messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<RawResponse, BackendError> {
        self.requests
            .lock()
            .await
            .push(messages.iter().map(Message::snapshot).collect());

        let reply = self.replies.lock().await.pop_front();
        let text = match reply {
            Some(ScriptedReply::Text(text)) => text,
            Some(ScriptedReply::Delayed { after, text }) => {
                tokio::time::sleep(after).await;
                text
            }
            Some(ScriptedReply::Error(kind)) => {
                debug!(%kind, "Scripted failure");
                return Err(BackendError::new(kind));
            }
            None => {
                warn!("Script exhausted");
                return Err(BackendError::fatal("script exhausted"));
            }
        };

        Ok(RawResponse {
            token_usage: estimate_usage(messages, &text),
            text,
            finish_reason: FinishReason::Stop,
        })
    }
}
