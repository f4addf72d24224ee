//! JSON shapes exchanged with the game server.
//!
//! Field names follow the server's camelCase convention. Every field the
//! server may omit has a serde default, so partial payloads deserialize and
//! are validated later by [`crate::GameSession::from_snapshot`].

use serde::{Deserialize, Serialize};

/// Server status string meaning the game is underway.
pub const STATUS_ACTIVE: &str = "ACTIVE";

/// Server status string for a game still waiting on its second player.
pub const STATUS_WAITING: &str = "WAITING_FOR_PLAYERS";

/// Server status string for a completed game.
pub const STATUS_FINISHED: &str = "FINISHED";

fn default_status() -> String {
    STATUS_WAITING.to_string()
}

fn default_true() -> bool {
    true
}

/// One piece as reported by the server.
///
/// `board_x` is the column and `board_y` the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerMove {
    /// Column (0-2).
    pub board_x: i64,
    /// Row (0-2).
    pub board_y: i64,
    /// True for pieces owned by player 1.
    #[serde(default)]
    pub player1: bool,
}

/// Authoritative game snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    /// Game identifier.
    #[serde(default)]
    pub game_id: Option<String>,
    /// Player 1 identifier, once assigned.
    #[serde(default)]
    pub player1_id: Option<String>,
    /// Player 2 identifier, once assigned.
    #[serde(default)]
    pub player2_id: Option<String>,
    /// Lifecycle status (`WAITING_FOR_PLAYERS`, `ACTIVE`, `FINISHED`).
    #[serde(default = "default_status")]
    pub game_status: String,
    /// True when player 1 is to move.
    #[serde(default = "default_true")]
    pub player1_turn: bool,
    /// True while pieces are still being placed.
    #[serde(default = "default_true")]
    pub placement_phase: bool,
    /// `"PLAYER 1"` or `"PLAYER 2"` once decided.
    #[serde(default)]
    pub winner: Option<String>,
    /// Whether play has begun.
    #[serde(default)]
    pub game_started: bool,
    /// Whether the player 1 seat is filled.
    #[serde(default)]
    pub player1_assigned: bool,
    /// Whether the player 2 seat is filled.
    #[serde(default)]
    pub player2_assigned: bool,
    /// Monotonic count of accepted moves.
    #[serde(default)]
    pub total_moves: u32,
    /// Last activity timestamp (epoch millis).
    #[serde(default)]
    pub last_activity: Option<i64>,
    /// Player 1 pieces in placement order.
    #[serde(default)]
    pub player1_moves: Vec<PlayerMove>,
    /// Player 2 pieces in placement order.
    #[serde(default)]
    pub player2_moves: Vec<PlayerMove>,
}

impl Default for ServerSnapshot {
    fn default() -> Self {
        Self {
            game_id: None,
            player1_id: None,
            player2_id: None,
            game_status: default_status(),
            player1_turn: true,
            placement_phase: true,
            winner: None,
            game_started: false,
            player1_assigned: false,
            player2_assigned: false,
            total_moves: 0,
            last_activity: None,
            player1_moves: Vec::new(),
            player2_moves: Vec::new(),
        }
    }
}

impl ServerSnapshot {
    /// True once the server reports a winner or a finished status.
    pub fn is_finished(&self) -> bool {
        self.winner.is_some() || self.game_status.eq_ignore_ascii_case(STATUS_FINISHED)
    }

    /// True while the server reports the game as active.
    pub fn is_active(&self) -> bool {
        self.game_status.eq_ignore_ascii_case(STATUS_ACTIVE)
    }

    /// True when both seats are filled.
    pub fn both_assigned(&self) -> bool {
        self.player1_assigned && self.player2_assigned
    }
}

/// Matchmaking status vocabulary shared by find-match and status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchStatus {
    /// An opponent was found.
    MatchFound,
    /// Queued, no opponent yet.
    Waiting,
    /// The server does not know the player; treated as waiting.
    NotFound,
    /// The player was already queued (HTTP 409 on find).
    AlreadyInQueue,
    /// The server reported an error.
    Error,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

/// Response to find-match and status-check requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingResponse {
    /// Outcome of the request.
    pub status: MatchStatus,
    /// Human-readable detail.
    #[serde(default)]
    pub message: Option<String>,
    /// Game id when matched.
    #[serde(default)]
    pub game_id: Option<String>,
    /// The caller's player id as the server knows it.
    #[serde(default)]
    pub player_id: Option<String>,
    /// 1 or 2 when matched.
    #[serde(default)]
    pub player_number: Option<u8>,
    /// Embedded snapshot of the new game, if the server sent one.
    #[serde(default)]
    pub game_state: Option<ServerSnapshot>,
}

impl MatchmakingResponse {
    /// A bare response carrying only a status.
    pub fn with_status(status: MatchStatus) -> Self {
        Self {
            status,
            message: None,
            game_id: None,
            player_id: None,
            player_number: None,
            game_state: None,
        }
    }
}

/// Envelope around game snapshots (`game` or `gameState`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEnvelope {
    /// `"success"` on success.
    #[serde(default)]
    pub status: String,
    /// Error detail when not successful.
    #[serde(default)]
    pub message: Option<String>,
    /// Snapshot, preferred key.
    #[serde(default)]
    pub game: Option<ServerSnapshot>,
    /// Snapshot, alternate key.
    #[serde(default)]
    pub game_state: Option<ServerSnapshot>,
}

/// Response to the queue-size query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    /// `"success"` on success.
    #[serde(default)]
    pub status: String,
    /// Number of players waiting.
    #[serde(default)]
    pub queue_size: u32,
}

/// Generic acknowledgement used by cancel and leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    /// `"success"` or `"info"` when accepted.
    #[serde(default)]
    pub status: String,
    /// Detail text.
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a move submission.
///
/// `from_x`/`from_y` are present only for slides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    /// Submitting player.
    pub player_id: String,
    /// Target column.
    pub board_x: i64,
    /// Target row.
    pub board_y: i64,
    /// Source column.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_x: Option<i64>,
    /// Source row.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_y: Option<i64>,
}

/// Body of a find-match request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindMatchRequest {
    /// Player joining the queue.
    pub player_id: String,
}
