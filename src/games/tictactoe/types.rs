//! Board types for tic-tac-toe.

use serde::{Deserialize, Serialize};

/// Mark placed by a seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Mark {
    /// First seat, moves first.
    X,
    /// Second seat.
    O,
}

impl Mark {
    /// Mark of the player in `seat`.
    pub fn for_seat(seat: usize) -> Self {
        if seat % 2 == 0 { Mark::X } else { Mark::O }
    }
}

/// 3x3 board, squares in row-major order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    squares: [Option<Mark>; 9],
}

/// Rows, columns and diagonals.
const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

impl Board {
    /// Creates an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark at `index` (0-8), `None` if empty or out of bounds.
    pub fn get(&self, index: usize) -> Option<Mark> {
        self.squares.get(index).copied().flatten()
    }

    /// Returns `true` if `index` is on the board and empty.
    pub fn is_free(&self, index: usize) -> bool {
        index < 9 && self.squares[index].is_none()
    }

    /// Returns a copy with `mark` at `index`.
    pub fn with_mark(&self, index: usize, mark: Mark) -> Self {
        let mut next = self.clone();
        if let Some(square) = next.squares.get_mut(index) {
            *square = Some(mark);
        }
        next
    }

    /// Mark owning a complete line, if any.
    pub fn winner(&self) -> Option<Mark> {
        LINES.iter().find_map(|line| match line.map(|i| self.squares[i]) {
            [Some(a), Some(b), Some(c)] if a == b && b == c => Some(a),
            _ => None,
        })
    }

    /// Returns `true` when no square is free.
    pub fn is_full(&self) -> bool {
        self.squares.iter().all(Option::is_some)
    }

    /// Renders the board with free squares numbered 1-9.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for row in 0..3 {
            let cells: Vec<String> = (0..3)
                .map(|col| {
                    let index = row * 3 + col;
                    match self.squares[index] {
                        Some(mark) => mark.to_string(),
                        None => (index + 1).to_string(),
                    }
                })
                .collect();
            out.push_str(&cells.join("|"));
            if row < 2 {
                out.push_str("\n-+-+-\n");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_diagonal_winner() {
        let board = Board::new()
            .with_mark(0, Mark::O)
            .with_mark(4, Mark::O)
            .with_mark(8, Mark::O);
        assert_eq!(board.winner(), Some(Mark::O));
    }

    #[test]
    fn mixed_line_is_not_a_win() {
        let board = Board::new()
            .with_mark(0, Mark::X)
            .with_mark(1, Mark::O)
            .with_mark(2, Mark::X);
        assert_eq!(board.winner(), None);
        assert!(!board.is_free(1));
        assert!(!board.is_free(9));
    }

    #[test]
    fn renders_numbers_for_free_squares() {
        let board = Board::new().with_mark(4, Mark::X);
        assert_eq!(board.render(), "1|2|3\n-+-+-\n4|X|6\n-+-+-\n7|8|9");
    }
}
