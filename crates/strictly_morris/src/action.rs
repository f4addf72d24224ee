//! First-class action types for three-piece morris.
//!
//! Moves are domain events, not side effects. They carry the mover's intent
//! and are validated against a game before anything changes.

use crate::{Phase, Position, Side};
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::instrument;

/// What a move does on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Drop a new piece on an empty cell (placement phase).
    Place {
        /// Target cell.
        to: Position,
    },
    /// Slide an owned piece to an adjacent empty cell (movement phase).
    Slide {
        /// Cell the piece leaves.
        from: Position,
        /// Cell the piece enters.
        to: Position,
    },
}

/// A move: one side performing one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Move {
    /// The side making the move.
    pub side: Side,
    /// What the move does.
    pub action: Action,
}

impl Move {
    /// Creates a placement.
    #[instrument]
    pub fn place(side: Side, to: Position) -> Self {
        Self {
            side,
            action: Action::Place { to },
        }
    }

    /// Creates a slide.
    #[instrument]
    pub fn slide(side: Side, from: Position, to: Position) -> Self {
        Self {
            side,
            action: Action::Slide { from, to },
        }
    }

    /// Builds a move from raw grid coordinates.
    ///
    /// `from` is `None` for placements. Coordinates outside the grid are
    /// rejected with [`RejectionKind::InvalidPosition`].
    #[instrument]
    pub fn from_coords(
        side: Side,
        from: Option<(i64, i64)>,
        to: (i64, i64),
    ) -> Result<Self, MoveError> {
        let target = Position::from_coords(to.0, to.1)
            .ok_or(MoveError::InvalidPosition(to.0, to.1))?;
        match from {
            None => Ok(Self::place(side, target)),
            Some((row, col)) => {
                let source =
                    Position::from_coords(row, col).ok_or(MoveError::InvalidPosition(row, col))?;
                Ok(Self::slide(side, source, target))
            }
        }
    }

    /// Cell the move ends on.
    pub fn target(&self) -> Position {
        match self.action {
            Action::Place { to } | Action::Slide { to, .. } => to,
        }
    }

    /// Cell the move starts from, for slides.
    pub fn source(&self) -> Option<Position> {
        match self.action {
            Action::Place { .. } => None,
            Action::Slide { from, .. } => Some(from),
        }
    }
}

impl std::fmt::Display for Move {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.action {
            Action::Place { to } => write!(f, "{} places at {}", self.side, to.label()),
            Action::Slide { from, to } => {
                write!(f, "{} slides {} -> {}", self.side, from.label(), to.label())
            }
        }
    }
}

/// Category of a rejected move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RejectionKind {
    /// The source cell holds the opponent's piece.
    WrongOwner,
    /// The target cell is taken.
    Occupied,
    /// The target is not one step from the source.
    NotAdjacent,
    /// A coordinate is off the board, or the source cell is empty.
    InvalidPosition,
    /// It is the other side's turn.
    WrongTurn,
    /// The action does not fit the current phase.
    WrongPhase,
    /// The side already has all its pieces on the board.
    PieceLimit,
    /// The game is over.
    GameOver,
    /// A postcondition failed.
    Internal,
}

/// Why a move was refused.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum MoveError {
    /// Tried to move the opponent's piece.
    #[display("Piece at {} belongs to the opponent", _0)]
    WrongOwner(Position),

    /// The target cell is taken.
    #[display("Position {} is already occupied", _0)]
    Occupied(Position),

    /// The target is not adjacent to the source.
    #[display("Can only move to adjacent positions ({} -> {})", _0, _1)]
    NotAdjacent(Position, Position),

    /// Coordinates off the board.
    #[display("Invalid board position ({}, {})", _0, _1)]
    InvalidPosition(i64, i64),

    /// The source cell is empty.
    #[display("No piece at selected position {}", _0)]
    EmptySource(Position),

    /// It's not this side's turn.
    #[display("It's not {}'s turn", _0)]
    WrongTurn(Side),

    /// The action does not fit the phase.
    #[display("Move not allowed during {} phase", _0)]
    WrongPhase(Phase),

    /// All pieces are already placed.
    #[display("{} already has all pieces on the board", _0)]
    PieceLimit(Side),

    /// A winner has already been decided.
    #[display("Game is already over")]
    GameOver,

    /// The board broke an invariant after the move was applied.
    #[display("Invariant violation: {}", _0)]
    InvariantViolation(String),
}

impl std::error::Error for MoveError {}

impl MoveError {
    /// Category of this rejection.
    pub fn kind(&self) -> RejectionKind {
        match self {
            MoveError::WrongOwner(_) => RejectionKind::WrongOwner,
            MoveError::Occupied(_) => RejectionKind::Occupied,
            MoveError::NotAdjacent(..) => RejectionKind::NotAdjacent,
            MoveError::InvalidPosition(..) | MoveError::EmptySource(_) => {
                RejectionKind::InvalidPosition
            }
            MoveError::WrongTurn(_) => RejectionKind::WrongTurn,
            MoveError::WrongPhase(_) => RejectionKind::WrongPhase,
            MoveError::PieceLimit(_) => RejectionKind::PieceLimit,
            MoveError::GameOver => RejectionKind::GameOver,
            MoveError::InvariantViolation(_) => RejectionKind::Internal,
        }
    }
}
