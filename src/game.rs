//! The contract a dialogue game implements to be driven by the game master.

use std::fmt::Debug;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// A seat at the table, with the instructions installed for whoever takes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRole {
    /// Role name within the game (`"guesser"`, `"X"`).
    pub name: String,
    /// Pinned system prompt for the player in this seat.
    pub system_prompt: String,
}

impl GameRole {
    /// Creates a role.
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

/// Why a response was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ViolationKind {
    /// The response does not have the expected form.
    ParseFailure,
    /// The response is well-formed but breaks a game rule.
    RuleViolation,
}

/// A rejected response. Game-level feedback, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[display("{kind}: {message}")]
pub struct Violation {
    /// Parse failure or rule violation.
    pub kind: ViolationKind,
    /// Explanation shown to the player.
    pub message: String,
}

impl Violation {
    /// Creates a parse failure.
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::ParseFailure,
            message: message.into(),
        }
    }

    /// Creates a rule violation.
    pub fn rule(message: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::RuleViolation,
            message: message.into(),
        }
    }
}

/// What the game reports after applying an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContinuationSignal {
    /// Keep playing.
    Continue,
    /// The players achieved the game's goal.
    Win,
    /// The players failed the game's goal.
    Loss,
    /// Nobody won.
    Draw,
}

impl ContinuationSignal {
    /// Returns `true` for every signal except [`ContinuationSignal::Continue`].
    pub fn is_terminal(self) -> bool {
        self != Self::Continue
    }
}

/// A message the game wants appended to a player's context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    /// Seat index of the recipient.
    pub to: usize,
    /// Text appended as a user message.
    pub content: String,
}

impl Broadcast {
    /// Creates a broadcast to seat `to`.
    pub fn new(to: usize, content: impl Into<String>) -> Self {
        Self {
            to,
            content: content.into(),
        }
    }
}

/// Result of [`GameDefinition::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S> {
    /// State after the action.
    pub state: S,
    /// Whether the episode continues.
    pub signal: ContinuationSignal,
    /// Messages for other players.
    pub broadcasts: Vec<Broadcast>,
    /// Reward for the action, if the game scores individual steps.
    pub reward: Option<f64>,
}

impl<S> Transition<S> {
    /// Moves to `state` with `signal`.
    pub fn new(state: S, signal: ContinuationSignal) -> Self {
        Self {
            state,
            signal,
            broadcasts: Vec::new(),
            reward: None,
        }
    }

    /// Continues with `state`.
    pub fn proceed(state: S) -> Self {
        Self::new(state, ContinuationSignal::Continue)
    }

    /// Adds a broadcast.
    pub fn with_broadcast(mut self, broadcast: Broadcast) -> Self {
        self.broadcasts.push(broadcast);
        self
    }

    /// Sets the step reward.
    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward);
        self
    }
}

/// Rules of one dialogue game.
///
/// Players are addressed by seat index, in the order of [`GameDefinition::roles`].
/// All methods are pure with respect to the engine: the game master owns the
/// state and hands it in.
pub trait GameDefinition: Send + Sync {
    /// Game-specific state (board, slots, scores).
    type State: Clone + Debug + Serialize + Send + Sync;
    /// Structured interpretation of a response.
    type Action: Clone + Debug + Serialize + Send + Sync;

    /// Identifier used in transcripts and on the command line.
    fn name(&self) -> &str;

    /// Seats in play order.
    fn roles(&self) -> Vec<GameRole>;

    /// State before the first turn.
    fn initial_state(&self) -> Self::State;

    /// Seat that plays turn `turn_index`. Defaults to fixed rotation.
    fn next_player(&self, _state: &Self::State, turn_index: usize, players: usize) -> usize {
        turn_index % players.max(1)
    }

    /// Prompt sent to `player` at the start of its turn.
    fn prompt(&self, state: &Self::State, player: usize) -> String;

    /// Interprets a raw response.
    ///
    /// # Errors
    ///
    /// Returns a [`Violation`] when the response cannot be parsed or breaks
    /// a rule.
    fn parse(&self, raw: &str, state: &Self::State, player: usize) -> Result<Self::Action, Violation>;

    /// Applies a validated action.
    fn apply(&self, action: Self::Action, state: &Self::State, player: usize) -> Transition<Self::State>;

    /// Whether a new round begins before `next_player` takes its turn.
    ///
    /// Defaults to play coming back to the first seat.
    fn starts_round(&self, _state: &Self::State, next_player: usize) -> bool {
        next_player == 0
    }

    /// Messages delivered when round `round` begins, before its first prompt.
    fn on_round_start(&self, _state: &Self::State, _round: usize) -> Vec<Broadcast> {
        Vec::new()
    }

    /// Messages delivered when round `round` is complete.
    fn on_round_end(&self, _state: &Self::State, _round: usize) -> Vec<Broadcast> {
        Vec::new()
    }

    /// Re-prompt sent after a violation.
    fn clarification(&self, violation: &Violation) -> String {
        format!(
            "Your last answer was rejected ({}). Please answer again following the rules.",
            violation
        )
    }
}
