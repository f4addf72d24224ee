//! Contract-based validation for three-piece morris.
//!
//! Every move passes the precondition chain before it touches the board,
//! and the resulting board is checked against the invariants afterwards.

use crate::game::{Game, check_invariants};
use crate::topology::adjacent;
use crate::{Action, Move, MoveError, PIECES_PER_SIDE, Phase};
use tracing::{instrument, warn};

// ─────────────────────────────────────────────────────────────
//  Contract Trait
// ─────────────────────────────────────────────────────────────

/// Checks guarding a state transition on both sides.
pub trait Contract<S, A> {
    /// Rejects `action` if it may not be applied to `state`.
    fn pre(state: &S, action: &A) -> Result<(), MoveError>;

    /// Compares the states either side of an applied action.
    fn post(before: &S, after: &S) -> Result<(), MoveError>;
}

// ─────────────────────────────────────────────────────────────
//  Move Preconditions
// ─────────────────────────────────────────────────────────────

/// Precondition: The game has not finished.
pub struct GameNotOver;

impl GameNotOver {
    /// Rejects any move once a winner exists.
    #[instrument(skip(_mov, game))]
    pub fn check(_mov: &Move, game: &Game) -> Result<(), MoveError> {
        if game.is_over() {
            Err(MoveError::GameOver)
        } else {
            Ok(())
        }
    }
}

/// Precondition: It must be the mover's turn.
pub struct PlayersTurn;

impl PlayersTurn {
    /// Rejects moves by the side not on turn.
    #[instrument(skip(game))]
    pub fn check(mov: &Move, game: &Game) -> Result<(), MoveError> {
        if mov.side != game.turn() {
            Err(MoveError::WrongTurn(mov.side))
        } else {
            Ok(())
        }
    }
}

/// Precondition: The action matches the phase, and a placement has a piece to spend.
pub struct PhaseAllows;

impl PhaseAllows {
    /// Placements only while placing, slides only while moving.
    #[instrument(skip(game))]
    pub fn check(mov: &Move, game: &Game) -> Result<(), MoveError> {
        match (mov.action, game.phase()) {
            (Action::Place { .. }, Phase::Placement) => {
                if game.pieces(mov.side).len() >= PIECES_PER_SIDE {
                    Err(MoveError::PieceLimit(mov.side))
                } else {
                    Ok(())
                }
            }
            (Action::Slide { .. }, Phase::Movement) => Ok(()),
            (_, phase) => Err(MoveError::WrongPhase(phase)),
        }
    }
}

/// Precondition: A slide starts on one of the mover's pieces.
pub struct OwnsSource;

impl OwnsSource {
    /// Checks the source cell of a slide.
    #[instrument(skip(game))]
    pub fn check(mov: &Move, game: &Game) -> Result<(), MoveError> {
        let Some(from) = mov.source() else {
            return Ok(());
        };
        match game.board().get(from) {
            None => Err(MoveError::EmptySource(from)),
            Some(owner) if owner != mov.side => Err(MoveError::WrongOwner(from)),
            Some(_) => Ok(()),
        }
    }
}

/// Precondition: The target cell must be empty.
pub struct TargetIsEmpty;

impl TargetIsEmpty {
    /// Rejects moves onto any occupied cell.
    #[instrument(skip(game))]
    pub fn check(mov: &Move, game: &Game) -> Result<(), MoveError> {
        let to = mov.target();
        if game.board().is_empty(to) {
            Ok(())
        } else {
            Err(MoveError::Occupied(to))
        }
    }
}

/// Precondition: A slide covers exactly one step of the topology.
pub struct TargetAdjacent;

impl TargetAdjacent {
    /// Rejects slides between non-adjacent cells.
    #[instrument(skip(game))]
    pub fn check(mov: &Move, game: &Game) -> Result<(), MoveError> {
        match mov.action {
            Action::Slide { from, to } if !adjacent(from, to) => {
                Err(MoveError::NotAdjacent(from, to))
            }
            _ => Ok(()),
        }
    }
}

/// Composite precondition: all checks in rejection-priority order.
pub struct LegalMove;

impl LegalMove {
    /// Runs every precondition, stopping at the first failure.
    #[instrument(skip(game))]
    pub fn check(mov: &Move, game: &Game) -> Result<(), MoveError> {
        GameNotOver::check(mov, game)?;
        PlayersTurn::check(mov, game)?;
        PhaseAllows::check(mov, game)?;
        OwnsSource::check(mov, game)?;
        TargetIsEmpty::check(mov, game)?;
        TargetAdjacent::check(mov, game)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Move Contract
// ─────────────────────────────────────────────────────────────

/// Guards a single [`Move`].
///
/// Legality is [`LegalMove`]. After applying:
/// - All [`crate::MorrisInvariants`] hold
/// - Exactly one move was added to the count
pub struct MoveContract;

impl Contract<Game, Move> for MoveContract {
    fn pre(game: &Game, action: &Move) -> Result<(), MoveError> {
        LegalMove::check(action, game)
    }

    fn post(before: &Game, after: &Game) -> Result<(), MoveError> {
        if after.moves_played() != before.moves_played() + 1 {
            warn!(
                before = before.moves_played(),
                after = after.moves_played(),
                "Move count did not advance by one"
            );
            return Err(MoveError::InvariantViolation(
                "Postcondition failed: move count must advance by one".to_string(),
            ));
        }
        check_invariants(after).map_err(|e| match e {
            MoveError::InvariantViolation(msg) => {
                MoveError::InvariantViolation(format!("Postcondition failed: {}", msg))
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Position, Side};

    fn movement_game() -> Game {
        Game::from_parts(
            vec![Position::TopLeft, Position::MiddleRight, Position::BottomCenter],
            vec![Position::TopCenter, Position::Center, Position::BottomLeft],
            Side::One,
            None,
            6,
        )
        .expect("valid")
    }

    #[test]
    fn test_precondition_empty_cell() {
        let game = Game::new();
        assert!(MoveContract::pre(&game, &Move::place(Side::One, Position::Center)).is_ok());
    }

    #[test]
    fn test_precondition_wrong_turn() {
        let game = Game::new();
        assert!(matches!(
            MoveContract::pre(&game, &Move::place(Side::Two, Position::Center)),
            Err(MoveError::WrongTurn(Side::Two))
        ));
    }

    #[test]
    fn test_precondition_wrong_owner() {
        let game = movement_game();
        assert!(matches!(
            MoveContract::pre(
                &game,
                &Move::slide(Side::One, Position::TopCenter, Position::TopRight)
            ),
            Err(MoveError::WrongOwner(Position::TopCenter))
        ));
    }

    #[test]
    fn test_precondition_empty_source() {
        let game = movement_game();
        assert!(matches!(
            MoveContract::pre(
                &game,
                &Move::slide(Side::One, Position::TopRight, Position::MiddleRight)
            ),
            Err(MoveError::EmptySource(Position::TopRight))
        ));
    }

    #[test]
    fn test_precondition_not_adjacent() {
        let game = movement_game();
        assert!(matches!(
            MoveContract::pre(
                &game,
                &Move::slide(Side::One, Position::TopLeft, Position::BottomRight)
            ),
            Err(MoveError::NotAdjacent(..))
        ));
    }

    #[test]
    fn test_precondition_place_during_movement() {
        let game = movement_game();
        assert!(matches!(
            MoveContract::pre(&game, &Move::place(Side::One, Position::TopRight)),
            Err(MoveError::WrongPhase(Phase::Movement))
        ));
    }

    #[test]
    fn test_precondition_game_over_checked_first() {
        let won = Game::replay(&[
            Move::place(Side::One, Position::TopLeft),
            Move::place(Side::Two, Position::Center),
            Move::place(Side::One, Position::TopCenter),
            Move::place(Side::Two, Position::BottomLeft),
            Move::place(Side::One, Position::TopRight),
        ])
        .expect("valid placements");
        assert!(won.is_over());

        for mov in [
            Move::place(Side::Two, Position::BottomRight),
            Move::place(Side::One, Position::BottomRight),
        ] {
            assert!(matches!(
                MoveContract::pre(&won, &mov),
                Err(MoveError::GameOver)
            ));
        }
    }

    #[test]
    fn test_postcondition_detects_corruption() {
        let before = Game::new();
        let mut after = before.clone();
        after.pieces[0].push(Position::Center);
        after.pieces[1].push(Position::Center);
        after.moves_played = 1;
        assert!(MoveContract::post(&before, &after).is_err());
    }
}
