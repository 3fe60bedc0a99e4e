//! Single-player number guessing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::game::{ContinuationSignal, GameDefinition, GameRole, Transition, Violation};

/// A guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guess {
    /// Guessed number.
    pub value: u32,
}

/// Guesses so far and the hint for the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuessState {
    /// Guesses made, in order.
    pub guesses: Vec<u32>,
    /// Hint for the last guess.
    pub hint: Option<Hint>,
}

/// Feedback after a wrong guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum Hint {
    /// The secret is larger.
    #[strum(serialize = "too low")]
    TooLow,
    /// The secret is smaller.
    #[strum(serialize = "too high")]
    TooHigh,
}

/// The player must find a secret number in `1..=upper` within a number of
/// guesses, answering `GUESS: <n>`. Finding it is a win; running out of
/// guesses is a loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberGuess {
    secret: u32,
    upper: u32,
    max_guesses: usize,
}

impl NumberGuess {
    /// Creates a game. The secret is clamped into `1..=upper`.
    pub fn new(secret: u32, upper: u32, max_guesses: usize) -> Self {
        let upper = upper.max(1);
        Self {
            secret: secret.clamp(1, upper),
            upper,
            max_guesses: max_guesses.max(1),
        }
    }
}

impl Default for NumberGuess {
    fn default() -> Self {
        Self::new(42, 100, 7)
    }
}

impl GameDefinition for NumberGuess {
    type State = GuessState;
    type Action = Guess;

    fn name(&self) -> &str {
        "guess"
    }

    fn roles(&self) -> Vec<GameRole> {
        vec![GameRole::new(
            "guesser",
            format!(
                "I am thinking of a whole number between 1 and {}. You have {} guesses. \
Reply with exactly one line of the form 'GUESS: <number>'.",
                self.upper, self.max_guesses
            ),
        )]
    }

    fn initial_state(&self) -> Self::State {
        GuessState::default()
    }

    fn prompt(&self, state: &Self::State, _player: usize) -> String {
        let left = self.max_guesses.saturating_sub(state.guesses.len());
        match (state.guesses.last(), state.hint) {
            (Some(last), Some(hint)) => {
                format!("{last} is {hint}. You have {left} guesses left. Your guess?")
            }
            _ => "Your first guess?".to_string(),
        }
    }

    fn parse(&self, raw: &str, _state: &Self::State, _player: usize) -> Result<Self::Action, Violation> {
        let Some(rest) = raw.trim().strip_prefix("GUESS:") else {
            return Err(Violation::parse("answer must start with 'GUESS:'"));
        };
        let value: u32 = rest
            .trim()
            .parse()
            .map_err(|_| Violation::parse(format!("'{}' is not a whole number", rest.trim())))?;
        if !(1..=self.upper).contains(&value) {
            return Err(Violation::rule(format!(
                "{} is outside 1 to {}",
                value, self.upper
            )));
        }
        Ok(Guess { value })
    }

    fn apply(&self, action: Self::Action, state: &Self::State, _player: usize) -> Transition<Self::State> {
        let mut guesses = state.guesses.clone();
        guesses.push(action.value);
        let hint = match action.value.cmp(&self.secret) {
            std::cmp::Ordering::Less => Some(Hint::TooLow),
            std::cmp::Ordering::Greater => Some(Hint::TooHigh),
            std::cmp::Ordering::Equal => None,
        };
        let signal = match hint {
            None => ContinuationSignal::Win,
            Some(_) if guesses.len() >= self.max_guesses => ContinuationSignal::Loss,
            Some(_) => ContinuationSignal::Continue,
        };
        let reward = if signal == ContinuationSignal::Win { 1.0 } else { 0.0 };
        debug!(guess = action.value, %signal, "Guess applied");
        Transition::new(GuessState { guesses, hint }, signal).with_reward(reward)
    }
}
