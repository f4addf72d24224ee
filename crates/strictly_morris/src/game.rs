//! Rule engine for three-piece morris.
//!
//! A [`Game`] moves through three phases:
//!
//! 1. **Placement**: sides alternate dropping pieces until each has three.
//! 2. **Movement**: sides alternate sliding a piece to an adjacent empty cell.
//! 3. **Finished**: the side that just moved has three in a line.
//!
//! Every move is checked against [`MoveContract`] before anything changes,
//! so a rejected move leaves the game untouched.

use crate::contracts::{Contract, MoveContract};
use crate::invariants::{InvariantSet, MorrisInvariants};
use crate::rules::has_line;
use crate::topology::adjacent;
use crate::{Action, Board, Move, MoveError, PIECES_PER_SIDE, Phase, Position, Side};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// What happened after an accepted move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveOutcome {
    /// The game continues in `phase` with `next` to move.
    Continue {
        /// Phase after the move.
        phase: Phase,
        /// Side whose turn it is now.
        next: Side,
    },
    /// The mover completed a line.
    Won(Side),
}

/// Full state of one game.
///
/// Pieces are kept per side in the order they were placed; a slide updates
/// the moved piece in place so the order survives the movement phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub(crate) pieces: [Vec<Position>; 2],
    pub(crate) turn: Side,
    pub(crate) phase: Phase,
    pub(crate) winner: Option<Side>,
    pub(crate) moves_played: u32,
}

impl Game {
    /// Creates a new game in the placement phase with [`Side::One`] to move.
    #[instrument]
    pub fn new() -> Self {
        Self {
            pieces: [Vec::new(), Vec::new()],
            turn: Side::One,
            phase: Phase::Placement,
            winner: None,
            moves_played: 0,
        }
    }

    /// Rebuilds a game from externally supplied state.
    ///
    /// The phase is derived: a winner means finished, two full sides mean
    /// movement, anything else is placement.
    ///
    /// # Errors
    ///
    /// Returns [`MoveError::InvariantViolation`] if the pieces overlap or a
    /// side has too many.
    #[instrument(skip(one, two))]
    pub fn from_parts(
        one: Vec<Position>,
        two: Vec<Position>,
        turn: Side,
        winner: Option<Side>,
        moves_played: u32,
    ) -> Result<Self, MoveError> {
        let phase = if winner.is_some() {
            Phase::Finished
        } else if one.len() == PIECES_PER_SIDE && two.len() == PIECES_PER_SIDE {
            Phase::Movement
        } else {
            Phase::Placement
        };

        let game = Self {
            pieces: [one, two],
            turn,
            phase,
            winner,
            moves_played,
        };
        check_invariants(&game)?;
        Ok(game)
    }

    /// Applies a move, returning what happened.
    ///
    /// # Errors
    ///
    /// Returns the first failed precondition; the game is left unchanged.
    #[instrument(skip(self), fields(mv = %mv, phase = %self.phase))]
    pub fn apply(&mut self, mv: Move) -> Result<MoveOutcome, MoveError> {
        MoveContract::pre(self, &mv)?;

        let before = self.clone();
        let mut next = self.clone();
        let side = mv.side;
        let slot = side.index();

        match mv.action {
            Action::Place { to } => next.pieces[slot].push(to),
            Action::Slide { from, to } => {
                if let Some(piece) = next.pieces[slot].iter_mut().find(|p| **p == from) {
                    *piece = to;
                }
            }
        }
        next.moves_played += 1;
        next.turn = side.opponent();

        let outcome = if has_line(&next.pieces[slot]) {
            next.phase = Phase::Finished;
            next.winner = Some(side);
            info!(winner = %side, moves = next.moves_played, "Line completed");
            MoveOutcome::Won(side)
        } else {
            if next.phase == Phase::Placement
                && next.pieces.iter().all(|p| p.len() == PIECES_PER_SIDE)
            {
                next.phase = Phase::Movement;
                info!("All pieces placed, entering movement phase");
            }
            MoveOutcome::Continue {
                phase: next.phase,
                next: next.turn,
            }
        };

        MoveContract::post(&before, &next)?;

        debug!(?outcome, "Move accepted");
        *self = next;
        Ok(outcome)
    }

    /// Checks a move without applying it.
    pub fn validate(&self, mv: &Move) -> Result<(), MoveError> {
        MoveContract::pre(self, mv)
    }

    /// Replays moves from a fresh game.
    ///
    /// Stops at the first winning move; later moves are rejected with
    /// [`MoveError::GameOver`].
    #[instrument(skip(moves), fields(count = moves.len()))]
    pub fn replay(moves: &[Move]) -> Result<Self, MoveError> {
        let mut game = Self::new();
        for mv in moves {
            game.apply(*mv)?;
        }
        Ok(game)
    }

    /// Every move the side to play could make right now.
    #[instrument(skip(self))]
    pub fn legal_moves(&self) -> Vec<Move> {
        let side = self.turn;
        let board = self.board();
        match self.phase {
            Phase::Finished => Vec::new(),
            Phase::Placement => Position::ALL
                .into_iter()
                .filter(|p| board.is_empty(*p))
                .map(|p| Move::place(side, p))
                .collect(),
            Phase::Movement => self
                .pieces(side)
                .iter()
                .flat_map(|from| {
                    Position::ALL
                        .into_iter()
                        .filter(move |to| board.is_empty(*to) && adjacent(*from, *to))
                        .map(move |to| Move::slide(side, *from, to))
                })
                .collect(),
        }
    }

    /// Occupancy grid.
    pub fn board(&self) -> Board {
        let mut board = Board::new();
        for side in [Side::One, Side::Two] {
            for pos in self.pieces(side) {
                board.set(*pos, Some(side));
            }
        }
        board
    }

    /// Pieces of `side` in placement order.
    pub fn pieces(&self, side: Side) -> &[Position] {
        &self.pieces[side.index()]
    }

    /// Side to move.
    pub fn turn(&self) -> Side {
        self.turn
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The winner, once finished.
    pub fn winner(&self) -> Option<Side> {
        self.winner
    }

    /// Number of accepted moves.
    pub fn moves_played(&self) -> u32 {
        self.moves_played
    }

    /// True once a side has won.
    pub fn is_over(&self) -> bool {
        self.phase == Phase::Finished
    }
}

impl Default for Game {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn check_invariants(game: &Game) -> Result<(), MoveError> {
    MorrisInvariants::check_all(game).map_err(|violations| {
        let descriptions = violations
            .iter()
            .map(|v| v.description.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        MoveError::InvariantViolation(descriptions)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RejectionKind;

    fn placed(moves: &[(Side, Position)]) -> Game {
        let moves: Vec<Move> = moves.iter().map(|(s, p)| Move::place(*s, *p)).collect();
        Game::replay(&moves).expect("valid placements")
    }

    #[test]
    fn test_new_game() {
        let game = Game::new();
        assert_eq!(game.phase(), Phase::Placement);
        assert_eq!(game.turn(), Side::One);
        assert_eq!(game.winner(), None);
    }

    #[test]
    fn test_placement_alternates_turn() {
        let mut game = Game::new();
        let outcome = game
            .apply(Move::place(Side::One, Position::Center))
            .expect("legal");
        assert_eq!(
            outcome,
            MoveOutcome::Continue {
                phase: Phase::Placement,
                next: Side::Two
            }
        );
        assert_eq!(game.turn(), Side::Two);
    }

    #[test]
    fn test_rejection_leaves_game_unchanged() {
        let mut game = placed(&[(Side::One, Position::Center)]);
        let before = game.clone();
        let err = game
            .apply(Move::place(Side::Two, Position::Center))
            .unwrap_err();
        assert_eq!(err.kind(), RejectionKind::Occupied);
        assert_eq!(game, before);
    }

    #[test]
    fn test_movement_starts_when_both_sides_full() {
        let game = placed(&[
            (Side::One, Position::TopLeft),
            (Side::Two, Position::TopCenter),
            (Side::One, Position::MiddleRight),
            (Side::Two, Position::Center),
            (Side::One, Position::BottomCenter),
        ]);
        assert_eq!(game.phase(), Phase::Placement);

        let mut game = game;
        game.apply(Move::place(Side::Two, Position::BottomLeft))
            .expect("legal");
        assert_eq!(game.phase(), Phase::Movement);
        assert_eq!(game.turn(), Side::One);
    }

    #[test]
    fn test_slide_updates_piece_in_place() {
        let mut game = placed(&[
            (Side::One, Position::TopLeft),
            (Side::Two, Position::TopCenter),
            (Side::One, Position::MiddleRight),
            (Side::Two, Position::Center),
            (Side::One, Position::BottomCenter),
            (Side::Two, Position::BottomLeft),
        ]);
        game.apply(Move::slide(Side::One, Position::MiddleRight, Position::TopRight))
            .expect("legal");
        assert_eq!(
            game.pieces(Side::One),
            &[Position::TopLeft, Position::TopRight, Position::BottomCenter]
        );
        assert_eq!(game.moves_played(), 7);
    }

    #[test]
    fn test_legal_moves_respect_topology() {
        let game = placed(&[
            (Side::One, Position::TopLeft),
            (Side::Two, Position::TopCenter),
            (Side::One, Position::MiddleRight),
            (Side::Two, Position::Center),
            (Side::One, Position::BottomCenter),
            (Side::Two, Position::BottomLeft),
        ]);
        let moves = game.legal_moves();
        assert!(moves.contains(&Move::slide(
            Side::One,
            Position::MiddleRight,
            Position::BottomRight
        )));
        assert!(moves.contains(&Move::slide(Side::One, Position::TopLeft, Position::MiddleLeft)));
        assert!(!moves.iter().any(|m| m.target() == Position::Center));
        assert!(
            moves
                .iter()
                .all(|m| game.validate(m).is_ok())
        );
    }

    #[test]
    fn test_from_parts_derives_phase() {
        let game = Game::from_parts(
            vec![Position::TopLeft, Position::MiddleRight, Position::BottomCenter],
            vec![Position::TopCenter, Position::Center, Position::BottomLeft],
            Side::One,
            None,
            6,
        )
        .expect("valid");
        assert_eq!(game.phase(), Phase::Movement);
    }

    #[test]
    fn test_from_parts_rejects_overlap() {
        let result = Game::from_parts(
            vec![Position::Center],
            vec![Position::Center],
            Side::One,
            None,
            2,
        );
        assert!(matches!(result, Err(MoveError::InvariantViolation(_))));
    }
}
