//! Piece limit invariant: no side ever holds more than three pieces.

use super::Invariant;
use crate::{Game, PIECES_PER_SIDE, Phase, Side};

/// Invariant: each side has at most three pieces, and exactly three while moving.
pub struct PieceLimitInvariant;

impl Invariant<Game> for PieceLimitInvariant {
    fn holds(game: &Game) -> bool {
        [Side::One, Side::Two].into_iter().all(|side| {
            let count = game.pieces(side).len();
            match game.phase() {
                Phase::Movement => count == PIECES_PER_SIDE,
                Phase::Placement | Phase::Finished => count <= PIECES_PER_SIDE,
            }
        })
    }

    fn description() -> &'static str {
        "Each side holds at most three pieces (exactly three while moving)"
    }
}
