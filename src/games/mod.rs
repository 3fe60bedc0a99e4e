//! Built-in games.

pub mod guess;
pub mod tictactoe;

/// Games shipped with the crate, selectable by name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum BuiltinGame {
    /// Two models play tic-tac-toe against each other.
    TicTacToe,
    /// One model searches for a secret number.
    Guess,
}

impl BuiltinGame {
    /// Number of players the game seats.
    pub fn players(self) -> usize {
        match self {
            BuiltinGame::TicTacToe => 2,
            BuiltinGame::Guess => 1,
        }
    }

    /// One-line description.
    pub fn description(self) -> &'static str {
        match self {
            BuiltinGame::TicTacToe => "two-player tic-tac-toe, answers 'MOVE: <square>'",
            BuiltinGame::Guess => "single-player number guessing, answers 'GUESS: <n>'",
        }
    }
}
