//! Backend error types.

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

/// Classification of a failed generation call.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Timeout, 5xx, rate limit or connection failure. Retryable.
    #[display("transient provider error: {_0}")]
    Transient(String),
    /// Auth failure, invalid model, context overflow. Never retried.
    #[display("fatal provider error: {_0}")]
    Fatal(String),
    /// The provider answered but the content could not be decoded as text.
    #[display("malformed provider response: {_0}")]
    MalformedResponse(String),
}

/// Backend error with location tracking.
#[derive(Debug, Clone, Display, Error)]
#[display("Backend error: {} at {}:{}", kind, file, line)]
pub struct BackendError {
    /// What went wrong.
    pub kind: BackendErrorKind,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl BackendError {
    /// Creates a new backend error with caller location tracking.
    #[track_caller]
    #[instrument(skip(kind))]
    pub fn new(kind: BackendErrorKind) -> Self {
        let loc = std::panic::Location::caller();
        error!(error_kind = %kind, "Backend error created");
        Self {
            kind,
            line: loc.line(),
            file: loc.file(),
        }
    }

    /// Creates a retryable error.
    #[track_caller]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transient(message.into()))
    }

    /// Creates a non-retryable error.
    #[track_caller]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Fatal(message.into()))
    }

    /// Creates an error for undecodable provider content.
    #[track_caller]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::MalformedResponse(message.into()))
    }

    /// Returns `true` if the call may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, BackendErrorKind::Transient(_))
    }

    /// Classifies an HTTP status from a provider.
    ///
    /// 408, 429 and every 5xx (including Anthropic's 529 "overloaded") are
    /// transient; everything else is fatal.
    #[track_caller]
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        if status == 408 || status == 429 || (500..600).contains(&status) {
            Self::transient(message)
        } else {
            Self::fatal(message)
        }
    }
}
