//! Backend driven by game logic instead of a model.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::util::estimate_usage;
use super::{Backend, BackendError, FinishReason, GenerationParams, Provider, RawResponse};
use crate::message::Message;

type Responder = dyn Fn(&[Message]) -> String + Send + Sync;

/// Answers every request by calling a closure over the full history.
///
/// Lets scripted opponents (or a human bridge) occupy a player slot through
/// the same contract as a model.
#[derive(Clone)]
pub struct ProgrammaticBackend {
    name: String,
    responder: Arc<Responder>,
}

impl ProgrammaticBackend {
    /// Creates a backend named `name` that answers with `responder`.
    pub fn new(
        name: impl Into<String>,
        responder: impl Fn(&[Message]) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            responder: Arc::new(responder),
        }
    }

    /// Returns the stand-in's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ProgrammaticBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgrammaticBackend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Backend for ProgrammaticBackend {
    fn provider(&self) -> Provider {
        Provider::Programmatic
    }

    #[instrument(skip(self, messages, _params), fields(name = %self.name))]
    async fn generate(
        &self,
        messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<RawResponse, BackendError> {
        let text = (self.responder)(messages);
        debug!(length = text.len(), "Programmatic response");
        Ok(RawResponse {
            token_usage: estimate_usage(messages, &text),
            text,
            finish_reason: FinishReason::Stop,
        })
    }
}
