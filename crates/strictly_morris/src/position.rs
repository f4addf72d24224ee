//! Board positions for the 3x3 morris grid.

use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};
use tracing::instrument;

/// A cell on the 3x3 board.
///
/// Rows and columns are zero-based; row 0 is the top edge and column 0 the
/// left edge. [`Position::Center`] is `(1, 1)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumIter,
)]
pub enum Position {
    /// Top-left corner (0, 0).
    TopLeft,
    /// Top edge (0, 1).
    TopCenter,
    /// Top-right corner (0, 2).
    TopRight,
    /// Left edge (1, 0).
    MiddleLeft,
    /// Center (1, 1).
    Center,
    /// Right edge (1, 2).
    MiddleRight,
    /// Bottom-left corner (2, 0).
    BottomLeft,
    /// Bottom edge (2, 1).
    BottomCenter,
    /// Bottom-right corner (2, 2).
    BottomRight,
}

impl Position {
    /// All 9 positions in row-major order.
    pub const ALL: [Position; 9] = [
        Position::TopLeft,
        Position::TopCenter,
        Position::TopRight,
        Position::MiddleLeft,
        Position::Center,
        Position::MiddleRight,
        Position::BottomLeft,
        Position::BottomCenter,
        Position::BottomRight,
    ];

    /// Human-readable cell name.
    pub fn label(&self) -> &'static str {
        match self {
            Position::TopLeft => "Top-left",
            Position::TopCenter => "Top-center",
            Position::TopRight => "Top-right",
            Position::MiddleLeft => "Middle-left",
            Position::Center => "Center",
            Position::MiddleRight => "Middle-right",
            Position::BottomLeft => "Bottom-left",
            Position::BottomCenter => "Bottom-center",
            Position::BottomRight => "Bottom-right",
        }
    }

    /// Converts position to board index (0-8, row-major).
    pub fn to_index(self) -> usize {
        self.row() * 3 + self.col()
    }

    /// Cell at row-major `index`, if in range.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Zero-based row of this cell.
    pub fn row(self) -> usize {
        match self {
            Position::TopLeft | Position::TopCenter | Position::TopRight => 0,
            Position::MiddleLeft | Position::Center | Position::MiddleRight => 1,
            Position::BottomLeft | Position::BottomCenter | Position::BottomRight => 2,
        }
    }

    /// Zero-based column of this cell.
    pub fn col(self) -> usize {
        match self {
            Position::TopLeft | Position::MiddleLeft | Position::BottomLeft => 0,
            Position::TopCenter | Position::Center | Position::BottomCenter => 1,
            Position::TopRight | Position::MiddleRight | Position::BottomRight => 2,
        }
    }

    /// Looks up the cell at `(row, col)`.
    ///
    /// Returns `None` for coordinates outside the 3x3 grid.
    #[instrument]
    pub fn from_coords(row: i64, col: i64) -> Option<Self> {
        if !(0..3).contains(&row) || !(0..3).contains(&col) {
            return None;
        }
        Self::from_index((row * 3 + col) as usize)
    }

    /// Returns true for the center cell.
    pub fn is_center(self) -> bool {
        self == Position::Center
    }

    /// Returns true for the four corner cells.
    pub fn is_corner(self) -> bool {
        matches!(
            self,
            Position::TopLeft | Position::TopRight | Position::BottomLeft | Position::BottomRight
        )
    }

    /// Parse from label or `row,col` pair.
    #[instrument]
    pub fn parse(s: &str) -> Option<Position> {
        let trimmed = s.trim();
        if let Some((row, col)) = trimmed.split_once([',', ' ']) {
            let row = row.trim().parse::<i64>().ok()?;
            let col = col.trim().parse::<i64>().ok()?;
            return Self::from_coords(row, col);
        }

        let lower = trimmed.to_lowercase();
        Position::iter().find(|pos| pos.label().to_lowercase() == lower)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({},{})", self.label(), self.row(), self.col())
    }
}
