//! Phase consistency invariant: the phase agrees with pieces and winner.

use super::Invariant;
use crate::{Game, PIECES_PER_SIDE, Phase};

/// Invariant: `Finished` exactly when a winner exists; otherwise `Movement`
/// exactly when both sides have all their pieces down.
pub struct PhaseConsistentInvariant;

impl Invariant<Game> for PhaseConsistentInvariant {
    fn holds(game: &Game) -> bool {
        let full = game.pieces.iter().all(|p| p.len() == PIECES_PER_SIDE);
        match (game.phase(), game.winner()) {
            (Phase::Finished, Some(_)) => true,
            (Phase::Finished, None) | (_, Some(_)) => false,
            (Phase::Movement, None) => full,
            (Phase::Placement, None) => !full,
        }
    }

    fn description() -> &'static str {
        "Phase matches winner and piece counts"
    }
}
