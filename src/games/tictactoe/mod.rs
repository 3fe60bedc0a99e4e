//! Tic-tac-toe.

mod rules;
mod types;

pub use rules::{Move, TicTacToe, TicTacToeState};
pub use types::{Board, Mark};
