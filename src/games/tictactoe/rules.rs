//! Tic-tac-toe as a two-player dialogue game.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::types::{Board, Mark};
use crate::game::{Broadcast, ContinuationSignal, GameDefinition, GameRole, Transition, Violation};

/// Placing `mark` on square `square` (1-9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    /// Mark placed.
    pub mark: Mark,
    /// Square number as shown on the board, 1-9.
    pub square: usize,
}

/// Board and move history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicTacToeState {
    /// Current board.
    pub board: Board,
    /// Squares played, in order.
    pub history: Vec<usize>,
    /// Winning mark once decided.
    pub winner: Option<Mark>,
}

/// Two models take turns placing marks by answering `MOVE: <square>`.
///
/// A completed line ends the episode as a win, a full board as a draw.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicTacToe;

const RULES: &str = "We are playing tic-tac-toe on a 3x3 board. Squares are numbered 1 to 9, \
left to right and top to bottom. On your turn reply with exactly one line of the form \
'MOVE: <square>' naming a free square. Do not add anything else.";

impl GameDefinition for TicTacToe {
    type State = TicTacToeState;
    type Action = Move;

    fn name(&self) -> &str {
        "tictactoe"
    }

    fn roles(&self) -> Vec<GameRole> {
        [Mark::X, Mark::O]
            .into_iter()
            .map(|mark| GameRole::new(mark.to_string(), format!("{RULES} You play {mark}.")))
            .collect()
    }

    fn initial_state(&self) -> Self::State {
        TicTacToeState::default()
    }

    fn prompt(&self, state: &Self::State, player: usize) -> String {
        format!(
            "Current board:\n{}\n\nYou are {}. Your move.",
            state.board.render(),
            Mark::for_seat(player)
        )
    }

    #[instrument(skip(self, state))]
    fn parse(&self, raw: &str, state: &Self::State, player: usize) -> Result<Self::Action, Violation> {
        let line = raw.trim();
        let Some(rest) = line.strip_prefix("MOVE:") else {
            return Err(Violation::parse("answer must start with 'MOVE:'"));
        };
        let square: usize = rest
            .trim()
            .parse()
            .map_err(|_| Violation::parse(format!("'{}' is not a square number", rest.trim())))?;
        if !(1..=9).contains(&square) {
            return Err(Violation::rule(format!("square {square} is not on the board")));
        }
        if !state.board.is_free(square - 1) {
            return Err(Violation::rule(format!("square {square} is already taken")));
        }
        Ok(Move {
            mark: Mark::for_seat(player),
            square,
        })
    }

    fn apply(&self, action: Self::Action, state: &Self::State, player: usize) -> Transition<Self::State> {
        let board = state.board.with_mark(action.square - 1, action.mark);
        let mut history = state.history.clone();
        history.push(action.square);
        let winner = board.winner();
        let signal = match winner {
            Some(_) => ContinuationSignal::Win,
            None if board.is_full() => ContinuationSignal::Draw,
            None => ContinuationSignal::Continue,
        };
        debug!(square = action.square, %signal, "Mark placed");

        let next = TicTacToeState {
            board,
            history,
            winner,
        };
        let note = format!("{} played square {}.", action.mark, action.square);
        let reward = if winner.is_some() { 1.0 } else { 0.0 };
        Transition::new(next, signal)
            .with_broadcast(Broadcast::new((player + 1) % 2, note))
            .with_reward(reward)
    }
}
