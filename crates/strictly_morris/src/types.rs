//! Core domain types for three-piece morris.

use crate::Position;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Maximum number of pieces each side may have on the board.
pub const PIECES_PER_SIDE: usize = 3;

/// One of the two participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Side {
    /// First player (moves first).
    #[strum(serialize = "PLAYER 1")]
    One,
    /// Second player.
    #[strum(serialize = "PLAYER 2")]
    Two,
}

impl Side {
    /// Returns the opponent side.
    pub fn opponent(self) -> Self {
        match self {
            Side::One => Side::Two,
            Side::Two => Side::One,
        }
    }

    /// Array slot used for per-side storage.
    pub fn index(self) -> usize {
        match self {
            Side::One => 0,
            Side::Two => 1,
        }
    }

    /// Board glyph for this side.
    pub fn symbol(self) -> char {
        match self {
            Side::One => 'X',
            Side::Two => 'O',
        }
    }
}

/// Lifecycle phase of a game.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// Sides alternate dropping pieces until each has three.
    Placement,
    /// Sides slide pieces to adjacent empty cells.
    Movement,
    /// A side has three in a line; no further moves.
    Finished,
}

/// 3x3 occupancy grid derived from the pieces of both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Board {
    cells: [Option<Side>; 9],
}

impl Board {
    /// Creates a new empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the occupant of the given cell.
    pub fn get(&self, pos: Position) -> Option<Side> {
        self.cells[pos.to_index()]
    }

    /// Sets the occupant of the given cell.
    pub fn set(&mut self, pos: Position, occupant: Option<Side>) {
        self.cells[pos.to_index()] = occupant;
    }

    /// Checks if a cell is empty.
    pub fn is_empty(&self, pos: Position) -> bool {
        self.get(pos).is_none()
    }

    /// Number of cells held by `side`.
    pub fn count(&self, side: Side) -> usize {
        self.cells.iter().filter(|c| **c == Some(side)).count()
    }

    /// Formats the board as a human-readable string.
    pub fn display(&self) -> String {
        let mut result = String::new();
        for row in 0..3 {
            for col in 0..3 {
                let pos = row * 3 + col;
                let symbol = match self.cells[pos] {
                    Some(side) => side.symbol().to_string(),
                    None => (pos + 1).to_string(),
                };
                result.push_str(&symbol);
                if col < 2 {
                    result.push('|');
                }
            }
            if row < 2 {
                result.push_str("\n-+-+-\n");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opponent() {
        assert_eq!(Side::One.opponent(), Side::Two);
        assert_eq!(Side::Two.opponent(), Side::One);
    }

    #[test]
    fn test_side_display_matches_server_labels() {
        assert_eq!(Side::One.to_string(), "PLAYER 1");
        assert_eq!(Side::Two.to_string(), "PLAYER 2");
    }

    #[test]
    fn test_board_display() {
        let mut board = Board::new();
        board.set(Position::Center, Some(Side::One));
        board.set(Position::TopLeft, Some(Side::Two));
        assert_eq!(board.display(), "O|2|3\n-+-+-\n4|X|6\n-+-+-\n7|8|9");
        assert_eq!(board.count(Side::One), 1);
    }
}
