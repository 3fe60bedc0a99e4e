//! Append-only episode transcripts and exactly-once results.

use std::path::Path;

use derive_more::{Display, Error};
use derive_new::new;
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::backends::{BackendErrorKind, GenerationParams, Provider, TokenUsage};
use crate::game::ContinuationSignal;
use crate::message::SnapshotMessage;

/// Classification of one recorded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutcomeFlag {
    /// Parsed and applied.
    Valid,
    /// The game could not parse the response.
    ParseFailure,
    /// The response broke a game rule.
    RuleViolation,
    /// Retryable provider failure.
    TransientError,
    /// Non-retryable provider failure.
    FatalError,
    /// Provider content could not be decoded.
    MalformedResponse,
    /// A response arrived after cancellation and was not validated.
    Cancelled,
}

impl OutcomeFlag {
    /// Flag recorded for a provider failure of `kind`.
    pub fn from_error(kind: &BackendErrorKind) -> Self {
        match kind {
            BackendErrorKind::Transient(_) => Self::TransientError,
            BackendErrorKind::Fatal(_) => Self::FatalError,
            BackendErrorKind::MalformedResponse(_) => Self::MalformedResponse,
        }
    }

    /// Returns `true` if a response was received but rejected by the game.
    pub fn is_violation(self) -> bool {
        matches!(self, Self::ParseFailure | Self::RuleViolation)
    }
}

/// One attempt within one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Setters)]
#[setters(prefix = "with_", strip_option)]
pub struct TranscriptEvent {
    /// Position in the transcript, assigned on append.
    #[setters(skip)]
    pub sequence: usize,
    /// Game-progress turn the attempt belongs to.
    #[setters(skip)]
    pub turn_index: usize,
    /// Round the turn belongs to, starting at 0.
    #[serde(default)]
    pub round: usize,
    /// Attempt number within the turn, starting at 1.
    #[setters(skip)]
    pub attempt: u32,
    /// Player that was asked.
    #[setters(skip)]
    pub player_id: String,
    /// Context the player held when the request was made, prompt included.
    #[setters(skip)]
    pub request_context_snapshot: Vec<SnapshotMessage>,
    /// Text returned by the backend.
    pub raw_response: Option<String>,
    /// Structured action, when the response parsed.
    pub parsed_action: Option<serde_json::Value>,
    /// Top-level state fields changed by the action.
    pub resulting_state_delta: Option<serde_json::Value>,
    /// Classification.
    #[setters(skip)]
    pub outcome_flag: OutcomeFlag,
    /// Violation message or other explanation.
    pub detail: Option<String>,
    /// Provider failure, for error outcomes.
    pub error: Option<BackendErrorKind>,
    /// Tokens spent on the call.
    pub token_usage: Option<TokenUsage>,
    /// Reward the game assigned to the applied action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
}

impl TranscriptEvent {
    /// Creates an event with only the mandatory fields set.
    pub fn new(
        turn_index: usize,
        attempt: u32,
        player_id: impl Into<String>,
        request_context_snapshot: Vec<SnapshotMessage>,
        outcome_flag: OutcomeFlag,
    ) -> Self {
        Self {
            sequence: 0,
            turn_index,
            round: 0,
            attempt,
            player_id: player_id.into(),
            request_context_snapshot,
            raw_response: None,
            parsed_action: None,
            resulting_state_delta: None,
            outcome_flag,
            detail: None,
            error: None,
            token_usage: None,
            reward: None,
        }
    }
}

/// Final status of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EpisodeStatus {
    /// The game signalled a win.
    Success,
    /// The game signalled a loss or draw, or turns ran out.
    Loss,
    /// Stopped by the engine: violations, cancellation.
    Aborted,
    /// Stopped by a provider or engine failure.
    Error,
}

/// Why an episode stopped without the game deciding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EndReason {
    /// The turn limit was reached.
    Exhausted,
    /// A player exceeded the violation budget.
    RetryLimitExceeded,
    /// Transient provider failures outlasted the retry budget.
    ProviderRetryExhausted,
    /// The provider failed fatally.
    FatalError,
    /// The provider returned undecodable content.
    MalformedResponse,
    /// The episode was cancelled from outside.
    Cancelled,
    /// The engine itself failed; the transcript holds everything recorded
    /// before the failure.
    EngineFailure,
}

/// Outcome of one episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeResult {
    /// Final status.
    pub status: EpisodeStatus,
    /// Game-progress turns started.
    pub turn_count: usize,
    /// Why the engine stopped the episode, if the game did not.
    pub aborted_reason: Option<EndReason>,
    /// Terminal signal reported by the game, if any.
    pub signal: Option<ContinuationSignal>,
    /// Explanation of an engine failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EpisodeResult {
    /// Result for a terminal game signal. Draws count as losses.
    pub fn from_signal(signal: ContinuationSignal, turn_count: usize) -> Self {
        let status = match signal {
            ContinuationSignal::Win => EpisodeStatus::Success,
            ContinuationSignal::Loss | ContinuationSignal::Draw | ContinuationSignal::Continue => {
                EpisodeStatus::Loss
            }
        };
        Self {
            status,
            turn_count,
            aborted_reason: None,
            signal: Some(signal),
            detail: None,
        }
    }

    /// Result for an episode the engine ended.
    pub fn ended(status: EpisodeStatus, turn_count: usize, reason: EndReason) -> Self {
        Self {
            status,
            turn_count,
            aborted_reason: Some(reason),
            signal: None,
            detail: None,
        }
    }

    /// Attaches an explanation.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Who played a seat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, new)]
pub struct PlayerRecord {
    /// Player id.
    #[new(into)]
    pub id: String,
    /// Role in the game.
    #[new(into)]
    pub role: String,
    /// Registered model name.
    #[new(into)]
    pub model: String,
    /// Provider family.
    pub provider: Provider,
    /// Context window of the model, when known.
    #[new(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<usize>,
    /// Sampling parameters the seat was played with, when known.
    #[new(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationParams>,
}

impl PlayerRecord {
    /// Records the context window and sampling parameters of the seat.
    pub fn with_limits(mut self, context_window_tokens: usize, generation: GenerationParams) -> Self {
        self.context_window_tokens = Some(context_window_tokens);
        self.generation = Some(generation);
        self
    }
}

/// Ordered, serializable record of one episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    /// Run the episode belongs to.
    pub run_id: String,
    /// Episode identifier, unique within the run.
    pub episode_id: String,
    /// Game name.
    pub game: String,
    /// Seats in play order.
    pub players: Vec<PlayerRecord>,
    /// Attempts in order.
    pub events: Vec<TranscriptEvent>,
    /// Outcome, absent while the episode is running.
    pub result: Option<EpisodeResult>,
}

impl Transcript {
    /// Serializes to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if serialization fails.
    pub fn to_json(&self) -> Result<String, RecorderError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RecorderError::new(RecorderErrorKind::Serialization(e.to_string())))
    }

    /// Parses a transcript from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the document is not a transcript.
    pub fn from_json(json: &str) -> Result<Self, RecorderError> {
        serde_json::from_str(json)
            .map_err(|e| RecorderError::new(RecorderErrorKind::Serialization(e.to_string())))
    }

    /// Writes the transcript as JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] on I/O or serialization failure.
    #[instrument(skip(self, path), fields(episode = %self.episode_id, path = %path.as_ref().display()))]
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), RecorderError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| RecorderError::new(RecorderErrorKind::Io(e.to_string())))?;
        }
        std::fs::write(path, self.to_json()?)
            .map_err(|e| RecorderError::new(RecorderErrorKind::Io(e.to_string())))?;
        info!("Transcript written");
        Ok(())
    }

    /// Reads a transcript written by [`Transcript::write_to`].
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] on I/O or parse failure.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RecorderError::new(RecorderErrorKind::Io(e.to_string())))?;
        Self::from_json(&content)
    }
}

/// Owns the transcript of one running episode.
#[derive(Debug)]
pub struct EpisodeRecorder {
    transcript: Transcript,
}

impl EpisodeRecorder {
    /// Starts an empty transcript.
    pub fn new(
        run_id: impl Into<String>,
        episode_id: impl Into<String>,
        game: impl Into<String>,
        players: Vec<PlayerRecord>,
    ) -> Self {
        Self {
            transcript: Transcript {
                run_id: run_id.into(),
                episode_id: episode_id.into(),
                game: game.into(),
                players,
                events: Vec::new(),
                result: None,
            },
        }
    }

    /// Appends an event, assigning its sequence number.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the episode is already finalized.
    #[instrument(skip(self, event), fields(turn = event.turn_index, outcome = %event.outcome_flag))]
    pub fn append(&mut self, mut event: TranscriptEvent) -> Result<usize, RecorderError> {
        if self.transcript.result.is_some() {
            error!("Append after finalize");
            return Err(RecorderError::new(RecorderErrorKind::InvariantViolation(
                "append after finalize".to_string(),
            )));
        }
        let sequence = self.transcript.events.len();
        event.sequence = sequence;
        self.transcript.events.push(event);
        debug!(sequence, "Event recorded");
        Ok(sequence)
    }

    /// Records the result. Repeating an identical result is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if a different result was already
    /// recorded.
    #[instrument(skip(self), fields(episode = %self.transcript.episode_id))]
    pub fn finalize(&mut self, result: EpisodeResult) -> Result<(), RecorderError> {
        match &self.transcript.result {
            Some(existing) if *existing == result => {
                debug!("Finalize repeated with identical result");
                Ok(())
            }
            Some(existing) => {
                error!(?existing, ?result, "Conflicting finalize");
                Err(RecorderError::new(RecorderErrorKind::InvariantViolation(
                    format!("episode already finalized as {}", existing.status),
                )))
            }
            None => {
                info!(status = %result.status, turns = result.turn_count, "Episode finalized");
                self.transcript.result = Some(result);
                Ok(())
            }
        }
    }

    /// Returns `true` once a result is recorded.
    pub fn is_finalized(&self) -> bool {
        self.transcript.result.is_some()
    }

    /// Returns the transcript so far.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Consumes the recorder.
    pub fn into_transcript(self) -> Transcript {
        self.transcript
    }
}

/// Recorder failure kinds.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum RecorderErrorKind {
    /// Contract misuse; always a bug in the caller.
    #[display("invariant violation: {_0}")]
    InvariantViolation(String),
    /// JSON encoding or decoding failed.
    #[display("serialization failed: {_0}")]
    Serialization(String),
    /// Filesystem access failed.
    #[display("I/O failed: {_0}")]
    Io(String),
}

/// Recorder error with location tracking.
#[derive(Debug, Clone, Display, Error)]
#[display("Recorder error: {} at {}:{}", kind, file, line)]
pub struct RecorderError {
    /// What went wrong.
    pub kind: RecorderErrorKind,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl RecorderError {
    /// Creates a new recorder error.
    #[track_caller]
    pub fn new(kind: RecorderErrorKind) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            line: loc.line(),
            file: loc.file(),
        }
    }

    /// Returns `true` for contract misuse.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self.kind, RecorderErrorKind::InvariantViolation(_))
    }
}
