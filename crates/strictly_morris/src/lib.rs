//! Three-piece morris rules.
//!
//! A two-player game on a 3x3 grid. Each side drops three pieces, then
//! slides them along the board's adjacency graph. Three of a side's pieces
//! in a row, column or diagonal wins.
//!
//! # Architecture
//!
//! - [`Position`] and [`topology`] describe the grid and which cells connect
//! - [`Move`] is a first-class action, validated by [`contracts`]
//! - [`Game`] applies moves and tracks the phase
//! - [`invariants`] state what must hold after every transition
//!
//! # Example
//!
//! ```
//! use strictly_morris::{Game, Move, MoveOutcome, Position, Side};
//!
//! let mut game = Game::new();
//! let outcome = game.apply(Move::place(Side::One, Position::Center)).unwrap();
//! assert!(matches!(outcome, MoveOutcome::Continue { next: Side::Two, .. }));
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod action;
pub mod contracts;
mod game;
pub mod invariants;
mod position;
pub mod rules;
pub mod topology;
mod types;

pub use action::{Action, Move, MoveError, RejectionKind};
pub use game::{Game, MoveOutcome};
pub use invariants::{InvariantSet, InvariantViolation, MorrisInvariants};
pub use position::Position;
pub use topology::{BoardLayout, adjacent};
pub use types::{Board, PIECES_PER_SIDE, Phase, Side};
