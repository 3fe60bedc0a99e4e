//! The game master: drives one episode turn by turn.
//!
//! The episode is an explicit state machine over [`Phase`]. Every request a
//! player answers, every provider failure and every rejected response becomes
//! one [`TranscriptEvent`], and retries are transitions rather than hidden
//! loops, so a transcript shows exactly how the budget was spent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use derive_more::{Display, Error};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::backends::{BackendErrorKind, RawResponse};
use crate::callbacks::{CallbackList, EpisodeCallback};
use crate::config::{EpisodeConfig, RetryAccounting};
use crate::game::{Broadcast, GameDefinition, Violation, ViolationKind};
use crate::message::Message;
use crate::player::Player;
use crate::recorder::{
    EndReason, EpisodeRecorder, EpisodeResult, EpisodeStatus, OutcomeFlag, PlayerRecord,
    RecorderError, Transcript, TranscriptEvent,
};
use crate::registry::ResolvedModel;

/// Phases of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// Building the initial state and installing system prompts.
    Init,
    /// Waiting for the current player's response.
    AwaitingResponse,
    /// Checking the response with the game's parser.
    Validating,
    /// Applying a valid action to the game state.
    ApplyingState,
    /// Re-prompting the same player after a violation.
    Retrying,
    /// Stopping the episode on the engine's initiative.
    Aborting,
    /// Result recorded; nothing else happens.
    Terminal,
}

/// Engine-side state of a running episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeState<S> {
    /// Index of the current game-progress turn.
    pub turn_index: usize,
    /// Turn slots charged against the turn limit.
    pub turns_started: usize,
    /// The game's own state.
    pub game: S,
    /// Violations per seat.
    pub violations: Vec<u32>,
    /// Attempt number within the current turn, starting at 1.
    pub attempt: u32,
    /// Seat of the player whose turn it is.
    pub current_player: usize,
    /// Round counter, starting at 0.
    pub current_round: usize,
}

/// Requests cancellation of a running episode.
///
/// Cancellation takes effect at the next phase transition; the episode ends
/// as `ABORTED` with reason `cancelled`. A response that already arrived but
/// was not applied is recorded with the `cancelled` outcome.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Creates a handle that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Data carried between phases of one attempt.
#[derive(Debug)]
struct Attempt<A> {
    prompt: Message,
    provider_attempt: u32,
    response: Option<RawResponse>,
    action: Option<A>,
    violation: Option<Violation>,
    end: Option<EndReason>,
}

impl<A> Attempt<A> {
    fn new(prompt: Message) -> Self {
        Self {
            prompt,
            provider_attempt: 1,
            response: None,
            action: None,
            violation: None,
            end: None,
        }
    }
}

/// Drives one episode of game `G`.
#[derive(Debug)]
pub struct GameMaster<G: GameDefinition> {
    game: G,
    players: Vec<Player>,
    config: EpisodeConfig,
    run_id: String,
    episode_id: String,
    cancel: CancelHandle,
    callbacks: CallbackList,
}

impl<G: GameDefinition> GameMaster<G> {
    /// Seats one player per game role, in order.
    ///
    /// Players are named `"Player 1"`, `"Player 2"`, ... in seat order.
    ///
    /// # Errors
    ///
    /// Returns [`MasterError`] if the game defines no roles or the number of
    /// models does not match the number of roles.
    #[instrument(skip_all, fields(game = %game.name(), models = models.len()))]
    pub fn new(
        game: G,
        models: &[Arc<ResolvedModel>],
        config: EpisodeConfig,
    ) -> Result<Self, MasterError> {
        let roles = game.roles();
        if roles.is_empty() {
            return Err(MasterError::new(MasterErrorKind::Setup(format!(
                "{} defines no roles",
                game.name()
            ))));
        }
        if roles.len() != models.len() {
            return Err(MasterError::new(MasterErrorKind::Setup(format!(
                "{} needs {} players, got {}",
                game.name(),
                roles.len(),
                models.len()
            ))));
        }
        let players = roles
            .iter()
            .zip(models)
            .enumerate()
            .map(|(seat, (role, model))| {
                Player::new(format!("Player {}", seat + 1), role.name.clone(), model)
                    .with_policy(config.context_policy.clone())
            })
            .collect();
        Ok(Self {
            game,
            players,
            config,
            run_id: "local".to_string(),
            episode_id: "episode-0".to_string(),
            cancel: CancelHandle::new(),
            callbacks: CallbackList::new(),
        })
    }

    /// Sets the run and episode ids written to the transcript.
    pub fn with_ids(mut self, run_id: impl Into<String>, episode_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self.episode_id = episode_id.into();
        self
    }

    /// Uses `cancel` to stop the episode from outside.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Notifies `callbacks` at episode and round boundaries.
    pub fn with_callbacks(mut self, callbacks: CallbackList) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Returns a handle that cancels this episode.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Returns the seated players.
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Plays the episode to a terminal phase.
    ///
    /// Provider failures never surface here; they end the episode with an
    /// `ERROR` result recorded in the transcript. So do engine failures, such
    /// as an action that cannot be serialized: the episode is finalized as
    /// `ERROR` with reason `engine_failure`, and everything recorded before
    /// the failure stays in the transcript. Callbacks see the end of every
    /// episode.
    ///
    /// # Errors
    ///
    /// Returns [`MasterError`] only if the recorder refuses the final result.
    #[instrument(skip(self), fields(game = %self.game.name(), episode = %self.episode_id))]
    pub async fn run(mut self) -> Result<(EpisodeResult, Transcript), MasterError> {
        let records = self
            .players
            .iter()
            .map(|p| {
                PlayerRecord::new(
                    p.id(),
                    p.game_role(),
                    p.spec().name.as_str(),
                    p.spec().provider,
                )
                .with_limits(p.spec().context_window_tokens, p.spec().generation)
            })
            .collect();
        let mut recorder = EpisodeRecorder::new(
            self.run_id.clone(),
            self.episode_id.clone(),
            self.game.name(),
            records,
        );

        let mut state = EpisodeState {
            turn_index: 0,
            turns_started: 0,
            current_round: 0,
            game: self.game.initial_state(),
            violations: vec![0; self.players.len()],
            attempt: 1,
            current_player: 0,
        };

        let result = match self.play(&mut state, &mut recorder).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    error = %e,
                    events = recorder.transcript().events.len(),
                    "Engine failure, keeping the partial transcript"
                );
                EpisodeResult::ended(
                    EpisodeStatus::Error,
                    state.turns_started,
                    EndReason::EngineFailure,
                )
                .with_detail(e.kind.to_string())
            }
        };
        recorder.finalize(result.clone())?;
        self.callbacks.on_episode_end(recorder.transcript());
        info!(
            status = %result.status,
            turns = result.turn_count,
            events = recorder.transcript().events.len(),
            "Episode finished"
        );
        Ok((result, recorder.into_transcript()))
    }

    /// Runs the phase machine until the episode has a result.
    async fn play(
        &mut self,
        state: &mut EpisodeState<G::State>,
        recorder: &mut EpisodeRecorder,
    ) -> Result<EpisodeResult, MasterError> {
        let mut phase = Phase::Init;
        let mut attempt: Option<Attempt<G::Action>> = None;
        let mut result: Option<EpisodeResult> = None;

        while phase != Phase::Terminal {
            if phase != Phase::Aborting && self.cancel.is_cancelled() {
                info!(%phase, "Episode cancelled");
                if matches!(phase, Phase::Validating | Phase::ApplyingState) {
                    if let Some(current) = attempt.as_ref() {
                        self.record_unapplied(state, current, recorder)?;
                    }
                }
                return Ok(EpisodeResult::ended(
                    EpisodeStatus::Aborted,
                    state.turns_started,
                    EndReason::Cancelled,
                ));
            }
            debug!(%phase, turn = state.turn_index, attempt = state.attempt, "Phase");

            phase = match phase {
                Phase::Init => {
                    for (player, role) in self.players.iter_mut().zip(self.game.roles()) {
                        player.initialize(&role.system_prompt);
                    }
                    self.callbacks.on_episode_start(recorder.transcript());
                    match self.start_turn(state, recorder) {
                        Some(prompt) => {
                            attempt = Some(Attempt::new(prompt));
                            Phase::AwaitingResponse
                        }
                        None => {
                            result = Some(self.exhausted());
                            Phase::Terminal
                        }
                    }
                }

                Phase::AwaitingResponse => {
                    let Some(current) = attempt.as_mut() else {
                        return Err(MasterError::phase(phase));
                    };
                    self.await_response(state, current, recorder).await?
                }

                Phase::Validating => {
                    let Some(current) = attempt.as_mut() else {
                        return Err(MasterError::phase(phase));
                    };
                    self.validate(state, current, recorder)?
                }

                Phase::Retrying => {
                    let Some(current) = attempt.as_mut() else {
                        return Err(MasterError::phase(phase));
                    };
                    let charged = self.config.retry_accounting == RetryAccounting::ConsumesTurn;
                    if charged && state.turns_started >= self.config.max_turns {
                        result = Some(self.exhausted());
                        Phase::Terminal
                    } else {
                        if charged {
                            state.turns_started += 1;
                        }
                        let violation = current.violation.take();
                        let text = violation
                            .as_ref()
                            .map(|v| self.game.clarification(v))
                            .unwrap_or_default();
                        *current = Attempt::new(Message::user(text));
                        state.attempt += 1;
                        Phase::AwaitingResponse
                    }
                }

                Phase::ApplyingState => {
                    let Some(current) = attempt.take() else {
                        return Err(MasterError::phase(phase));
                    };
                    match self.apply(state, current, recorder)? {
                        Some(outcome) => {
                            result = Some(outcome);
                            Phase::Terminal
                        }
                        None => match self.start_turn(state, recorder) {
                            Some(prompt) => {
                                attempt = Some(Attempt::new(prompt));
                                Phase::AwaitingResponse
                            }
                            None => {
                                result = Some(self.exhausted());
                                Phase::Terminal
                            }
                        },
                    }
                }

                Phase::Aborting => {
                    let reason = attempt
                        .as_ref()
                        .and_then(|a| a.end)
                        .unwrap_or(EndReason::RetryLimitExceeded);
                    let status = match reason {
                        EndReason::ProviderRetryExhausted
                        | EndReason::FatalError
                        | EndReason::MalformedResponse
                        | EndReason::EngineFailure => EpisodeStatus::Error,
                        EndReason::Exhausted => EpisodeStatus::Loss,
                        EndReason::RetryLimitExceeded | EndReason::Cancelled => {
                            EpisodeStatus::Aborted
                        }
                    };
                    warn!(%reason, %status, "Episode stopped by the engine");
                    result = Some(EpisodeResult::ended(status, state.turns_started, reason));
                    Phase::Terminal
                }

                Phase::Terminal => Phase::Terminal,
            };
        }

        result.ok_or_else(|| MasterError::phase(Phase::Terminal))
    }

    /// Selects the next player and builds its prompt, or `None` if the turn
    /// limit is reached. Crosses a round boundary first when the game says
    /// the next player opens a new round.
    fn start_turn(
        &mut self,
        state: &mut EpisodeState<G::State>,
        recorder: &EpisodeRecorder,
    ) -> Option<Message> {
        if state.turns_started >= self.config.max_turns {
            return None;
        }
        let players = self.players.len();
        let seat = self.game.next_player(&state.game, state.turn_index, players);
        let seat = if seat < players {
            seat
        } else {
            warn!(seat, "Game selected a missing seat, using rotation");
            state.turn_index % players
        };

        if state.turn_index == 0 {
            self.begin_round(state, recorder);
        } else if self.game.starts_round(&state.game, seat) {
            let finished = self.game.on_round_end(&state.game, state.current_round);
            self.deliver(finished);
            self.callbacks
                .on_round_end(recorder.transcript(), state.current_round);
            state.current_round += 1;
            self.begin_round(state, recorder);
        }

        state.current_player = seat;
        state.turns_started += 1;
        state.attempt = 1;
        debug!(turn = state.turn_index, round = state.current_round, seat, "Turn started");
        Some(Message::user(self.game.prompt(&state.game, seat)))
    }

    fn begin_round(&mut self, state: &EpisodeState<G::State>, recorder: &EpisodeRecorder) {
        debug!(round = state.current_round, "Round started");
        let opening = self.game.on_round_start(&state.game, state.current_round);
        self.deliver(opening);
        self.callbacks
            .on_round_start(recorder.transcript(), state.current_round);
    }

    /// Appends each broadcast to its recipient's context.
    fn deliver(&mut self, broadcasts: Vec<Broadcast>) {
        for broadcast in broadcasts {
            match self.players.get_mut(broadcast.to) {
                Some(player) => player.observe(Message::user(broadcast.content)),
                None => warn!(to = broadcast.to, "Broadcast to missing seat dropped"),
            }
        }
    }

    fn exhausted(&self) -> EpisodeResult {
        info!(max_turns = self.config.max_turns, "Turn limit reached");
        EpisodeResult::ended(
            EpisodeStatus::Loss,
            self.config.max_turns,
            EndReason::Exhausted,
        )
    }

    fn event(&self, state: &EpisodeState<G::State>, flag: OutcomeFlag) -> TranscriptEvent {
        let player = &self.players[state.current_player];
        TranscriptEvent::new(
            state.turn_index,
            state.attempt,
            player.id(),
            player.last_request().to_vec(),
            flag,
        )
        .with_round(state.current_round)
    }

    /// Records a response that arrived but will never be applied.
    fn record_unapplied(
        &self,
        state: &EpisodeState<G::State>,
        current: &Attempt<G::Action>,
        recorder: &mut EpisodeRecorder,
    ) -> Result<(), MasterError> {
        let Some(response) = current.response.as_ref() else {
            return Ok(());
        };
        let event = self
            .event(state, OutcomeFlag::Cancelled)
            .with_raw_response(response.text.clone())
            .with_detail("cancelled before the response was applied".to_string())
            .with_token_usage(response.token_usage);
        recorder.append(event)?;
        Ok(())
    }

    async fn await_response(
        &mut self,
        state: &mut EpisodeState<G::State>,
        current: &mut Attempt<G::Action>,
        recorder: &mut EpisodeRecorder,
    ) -> Result<Phase, MasterError> {
        let seat = state.current_player;
        let outcome = self.players[seat].respond(current.prompt.clone()).await;
        let error = match outcome {
            Ok(response) => {
                current.response = Some(response);
                return Ok(Phase::Validating);
            }
            Err(e) => e,
        };

        let flag = OutcomeFlag::from_error(&error.kind);
        let detail = match &error.kind {
            BackendErrorKind::Transient(m)
            | BackendErrorKind::Fatal(m)
            | BackendErrorKind::MalformedResponse(m) => m.clone(),
        };
        let event = self
            .event(state, flag)
            .with_detail(detail)
            .with_error(error.kind.clone());
        recorder.append(event)?;

        let retry = &self.config.provider_retry;
        match error.kind {
            BackendErrorKind::Transient(_) if current.provider_attempt < retry.max_attempts => {
                let delay = retry.backoff(current.provider_attempt);
                warn!(
                    attempt = current.provider_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient provider failure, backing off"
                );
                tokio::time::sleep(delay).await;
                current.provider_attempt += 1;
                state.attempt += 1;
                Ok(Phase::AwaitingResponse)
            }
            BackendErrorKind::Transient(_) => {
                current.end = Some(EndReason::ProviderRetryExhausted);
                Ok(Phase::Aborting)
            }
            BackendErrorKind::Fatal(_) => {
                current.end = Some(EndReason::FatalError);
                Ok(Phase::Aborting)
            }
            BackendErrorKind::MalformedResponse(_) => {
                current.end = Some(EndReason::MalformedResponse);
                Ok(Phase::Aborting)
            }
        }
    }

    fn validate(
        &mut self,
        state: &mut EpisodeState<G::State>,
        current: &mut Attempt<G::Action>,
        recorder: &mut EpisodeRecorder,
    ) -> Result<Phase, MasterError> {
        let seat = state.current_player;
        let Some(response) = current.response.as_ref() else {
            return Err(MasterError::phase(Phase::Validating));
        };
        match self.game.parse(&response.text, &state.game, seat) {
            Ok(action) => {
                current.action = Some(action);
                Ok(Phase::ApplyingState)
            }
            Err(violation) => {
                let flag = match violation.kind {
                    ViolationKind::ParseFailure => OutcomeFlag::ParseFailure,
                    ViolationKind::RuleViolation => OutcomeFlag::RuleViolation,
                };
                let event = self
                    .event(state, flag)
                    .with_raw_response(response.text.clone())
                    .with_detail(violation.message.clone())
                    .with_token_usage(response.token_usage);
                recorder.append(event)?;

                state.violations[seat] += 1;
                let count = state.violations[seat];
                info!(seat, count, limit = self.config.violation_limit, %violation, "Invalid response");
                current.violation = Some(violation);
                if count > self.config.violation_limit {
                    current.end = Some(EndReason::RetryLimitExceeded);
                    Ok(Phase::Aborting)
                } else {
                    Ok(Phase::Retrying)
                }
            }
        }
    }

    /// Applies the action, records it and delivers broadcasts. Returns the
    /// result when the game signalled the end.
    fn apply(
        &mut self,
        state: &mut EpisodeState<G::State>,
        current: Attempt<G::Action>,
        recorder: &mut EpisodeRecorder,
    ) -> Result<Option<EpisodeResult>, MasterError> {
        let seat = state.current_player;
        let (Some(response), Some(action)) = (current.response, current.action) else {
            return Err(MasterError::phase(Phase::ApplyingState));
        };
        let parsed = to_value(&action)?;
        let transition = self.game.apply(action, &state.game, seat);
        let delta = state_delta(&to_value(&state.game)?, &to_value(&transition.state)?);

        let mut event = self
            .event(state, OutcomeFlag::Valid)
            .with_raw_response(response.text)
            .with_parsed_action(parsed)
            .with_resulting_state_delta(delta)
            .with_token_usage(response.token_usage);
        if let Some(reward) = transition.reward {
            event = event.with_reward(reward);
        }
        recorder.append(event)?;

        self.deliver(transition.broadcasts);
        state.game = transition.state;
        state.turn_index += 1;
        debug!(signal = %transition.signal, "State applied");

        if transition.signal.is_terminal() {
            Ok(Some(EpisodeResult::from_signal(
                transition.signal,
                state.turns_started,
            )))
        } else {
            Ok(None)
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, MasterError> {
    serde_json::to_value(value)
        .map_err(|e| MasterError::new(MasterErrorKind::Serialization(e.to_string())))
}

/// Top-level fields of `after` that differ from `before`.
///
/// Removed fields map to `null`. Non-object states are reported whole when
/// they changed.
pub fn state_delta(before: &serde_json::Value, after: &serde_json::Value) -> serde_json::Value {
    use serde_json::{Map, Value};

    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut delta = Map::new();
            for (key, value) in new {
                if old.get(key) != Some(value) {
                    delta.insert(key.clone(), value.clone());
                }
            }
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                delta.insert(key.clone(), Value::Null);
            }
            Value::Object(delta)
        }
        (old, new) if old == new => Value::Object(Map::new()),
        (_, new) => new.clone(),
    }
}

/// Game master failure kinds.
#[derive(Debug, Clone, Display)]
pub enum MasterErrorKind {
    /// Players and roles do not match.
    #[display("setup failed: {_0}")]
    Setup(String),
    /// The recorder rejected an operation.
    #[display("{_0}")]
    Recorder(RecorderError),
    /// Game state or action could not be serialized.
    #[display("serialization failed: {_0}")]
    Serialization(String),
    /// A phase was entered without the data it needs.
    #[display("invariant violation: {_0}")]
    InvariantViolation(String),
}

/// Game master error with location tracking.
#[derive(Debug, Clone, Display, Error)]
#[display("Game master error: {} at {}:{}", kind, file, line)]
pub struct MasterError {
    /// What went wrong.
    pub kind: MasterErrorKind,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl MasterError {
    /// Creates a new game master error.
    #[track_caller]
    pub fn new(kind: MasterErrorKind) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            line: loc.line(),
            file: loc.file(),
        }
    }

    #[track_caller]
    fn phase(phase: Phase) -> Self {
        Self::new(MasterErrorKind::InvariantViolation(format!(
            "entered {} without a pending attempt",
            phase
        )))
    }
}

impl From<RecorderError> for MasterError {
    #[track_caller]
    fn from(err: RecorderError) -> Self {
        Self::new(MasterErrorKind::Recorder(err))
    }
}
