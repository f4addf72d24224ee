//! Conversion between server snapshots and local game sessions.

use crate::wire::{MoveRequest, PlayerMove, STATUS_FINISHED, ServerSnapshot};
use derive_getters::Getters;
use strictly_morris::{Game, Move, Phase, Position, Side};
use tracing::{debug, instrument, warn};

/// Snapshot that cannot be turned into a game session.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum SnapshotError {
    /// The snapshot has no game id.
    #[display("Snapshot is missing its game id")]
    MissingGameId,

    /// A piece sits outside the grid.
    #[display("Piece at ({}, {}) is off the board", _0, _1)]
    InvalidCell(i64, i64),

    /// The winner label is not recognised.
    #[display("Unknown winner label: {}", _0)]
    UnknownWinner(String),

    /// Pieces, turn and winner do not describe a legal game.
    #[display("Inconsistent snapshot: {}", _0)]
    Inconsistent(String),
}

impl std::error::Error for SnapshotError {}

/// A match that must not be played.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum MatchConflict {
    /// Both seats hold the same player.
    #[display("Self-match detected for player {}", _0)]
    SelfMatch(String),

    /// The local player holds neither seat.
    #[display("Player {} is not a participant in this game", _0)]
    NotAParticipant(String),

    /// One or both seats are empty.
    #[display("Match is missing a participant")]
    MissingPlayers,
}

impl std::error::Error for MatchConflict {}

/// Local view of one networked game.
///
/// Built only from server snapshots; the server is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct GameSession {
    id: String,
    player1_id: Option<String>,
    player2_id: Option<String>,
    status: String,
    game_started: bool,
    player1_assigned: bool,
    player2_assigned: bool,
    last_activity: Option<i64>,
    game: Game,
}

fn winner_label(side: Side) -> String {
    side.to_string()
}

fn parse_winner(label: &str) -> Result<Side, SnapshotError> {
    match label.trim().to_ascii_uppercase().as_str() {
        "PLAYER 1" | "PLAYER1" => Ok(Side::One),
        "PLAYER 2" | "PLAYER2" => Ok(Side::Two),
        _ => Err(SnapshotError::UnknownWinner(label.to_string())),
    }
}

fn to_positions(moves: &[PlayerMove]) -> Result<Vec<Position>, SnapshotError> {
    moves
        .iter()
        .map(|m| {
            Position::from_coords(m.board_y, m.board_x)
                .ok_or(SnapshotError::InvalidCell(m.board_x, m.board_y))
        })
        .collect()
}

fn to_wire(pieces: &[Position], player1: bool) -> Vec<PlayerMove> {
    pieces
        .iter()
        .map(|p| PlayerMove {
            board_x: p.col() as i64,
            board_y: p.row() as i64,
            player1,
        })
        .collect()
}

impl GameSession {
    /// Builds a session from an authoritative snapshot.
    ///
    /// # Errors
    ///
    /// Fails when the snapshot lacks a game id, places a piece off the grid,
    /// names an unknown winner, or describes an impossible position.
    #[instrument(skip(snapshot), fields(game_id = ?snapshot.game_id, total_moves = snapshot.total_moves))]
    pub fn from_snapshot(snapshot: &ServerSnapshot) -> Result<Self, SnapshotError> {
        let id = snapshot
            .game_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(SnapshotError::MissingGameId)?
            .to_string();

        let one = to_positions(&snapshot.player1_moves)?;
        let two = to_positions(&snapshot.player2_moves)?;
        let winner = snapshot.winner.as_deref().map(parse_winner).transpose()?;
        let turn = if snapshot.player1_turn {
            Side::One
        } else {
            Side::Two
        };

        let game = Game::from_parts(one, two, turn, winner, snapshot.total_moves)
            .map_err(|e| SnapshotError::Inconsistent(e.to_string()))?;

        if (game.phase() == Phase::Placement) != snapshot.placement_phase && winner.is_none() {
            warn!(
                server_placement = snapshot.placement_phase,
                local_phase = %game.phase(),
                "Server placement flag disagrees with piece counts"
            );
        }

        debug!(phase = %game.phase(), turn = %game.turn(), "Snapshot converted");
        Ok(Self {
            id,
            player1_id: snapshot.player1_id.clone(),
            player2_id: snapshot.player2_id.clone(),
            status: snapshot.game_status.clone(),
            game_started: snapshot.game_started,
            player1_assigned: snapshot.player1_assigned,
            player2_assigned: snapshot.player2_assigned,
            last_activity: snapshot.last_activity,
            game,
        })
    }

    /// Renders this session back into wire form.
    #[instrument(skip(self), fields(game_id = %self.id))]
    pub fn to_snapshot(&self) -> ServerSnapshot {
        let placement_phase = match self.game.phase() {
            Phase::Placement => true,
            Phase::Movement => false,
            Phase::Finished => [Side::One, Side::Two]
                .iter()
                .any(|s| self.game.pieces(*s).len() < strictly_morris::PIECES_PER_SIDE),
        };
        ServerSnapshot {
            game_id: Some(self.id.clone()),
            player1_id: self.player1_id.clone(),
            player2_id: self.player2_id.clone(),
            game_status: self.status.clone(),
            player1_turn: self.game.turn() == Side::One,
            placement_phase,
            winner: self.game.winner().map(winner_label),
            game_started: self.game_started,
            player1_assigned: self.player1_assigned,
            player2_assigned: self.player2_assigned,
            total_moves: self.game.moves_played(),
            last_activity: self.last_activity,
            player1_moves: to_wire(self.game.pieces(Side::One), true),
            player2_moves: to_wire(self.game.pieces(Side::Two), false),
        }
    }

    /// Server's move counter.
    pub fn total_moves(&self) -> u32 {
        self.game.moves_played()
    }

    /// True while the server reports the game as active.
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case(crate::wire::STATUS_ACTIVE)
    }

    /// True once the game has a winner or the server marks it finished.
    pub fn is_finished(&self) -> bool {
        self.game.is_over() || self.status.eq_ignore_ascii_case(STATUS_FINISHED)
    }

    /// True when both seats are filled.
    pub fn both_assigned(&self) -> bool {
        self.player1_assigned && self.player2_assigned
    }

    /// Seat held by `player_id`, if any.
    pub fn side_of(&self, player_id: &str) -> Option<Side> {
        if self.player1_id.as_deref() == Some(player_id) {
            Some(Side::One)
        } else if self.player2_id.as_deref() == Some(player_id) {
            Some(Side::Two)
        } else {
            None
        }
    }

    /// Checks that the match pairs two distinct players, one of them local.
    ///
    /// # Errors
    ///
    /// Returns a [`MatchConflict`] describing why the match cannot proceed.
    #[instrument(skip(self), fields(game_id = %self.id))]
    pub fn check_participants(&self, local_player_id: &str) -> Result<Side, MatchConflict> {
        let (Some(p1), Some(p2)) = (self.player1_id.as_deref(), self.player2_id.as_deref())
        else {
            return Err(MatchConflict::MissingPlayers);
        };
        if p1 == p2 {
            return Err(MatchConflict::SelfMatch(p1.to_string()));
        }
        self.side_of(local_player_id)
            .ok_or_else(|| MatchConflict::NotAParticipant(local_player_id.to_string()))
    }

    /// Wire body for submitting `mv` as `player_id`.
    pub fn move_request(player_id: &str, mv: &Move) -> MoveRequest {
        let to = mv.target();
        let from = mv.source();
        MoveRequest {
            player_id: player_id.to_string(),
            board_x: to.col() as i64,
            board_y: to.row() as i64,
            from_x: from.map(|p| p.col() as i64),
            from_y: from.map(|p| p.row() as i64),
        }
    }
}
