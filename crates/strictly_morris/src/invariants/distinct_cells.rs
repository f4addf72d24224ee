//! Distinct cells invariant: a cell holds at most one piece.

use super::Invariant;
use crate::Game;

/// Invariant: no two pieces share a cell, across or within sides.
pub struct DistinctCellsInvariant;

impl Invariant<Game> for DistinctCellsInvariant {
    fn holds(game: &Game) -> bool {
        let mut seen = [false; 9];
        game.pieces.iter().flatten().all(|pos| {
            let slot = &mut seen[pos.to_index()];
            !std::mem::replace(slot, true)
        })
    }

    fn description() -> &'static str {
        "No two pieces occupy the same cell"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Position;

    #[test]
    fn test_overlap_across_sides_fails() {
        let mut game = Game::new();
        game.pieces[0].push(Position::Center);
        game.pieces[1].push(Position::Center);
        assert!(!DistinctCellsInvariant::holds(&game));
    }

    #[test]
    fn test_disjoint_holds() {
        let mut game = Game::new();
        game.pieces[0].push(Position::Center);
        game.pieces[1].push(Position::TopLeft);
        assert!(DistinctCellsInvariant::holds(&game));
    }
}
