//! Transport abstraction over the game server's endpoints.
//!
//! Components receive a transport explicitly instead of reaching for a
//! process-wide client, which lets tests script every response.

use crate::wire::{MatchmakingResponse, MoveRequest, ServerSnapshot};
use async_trait::async_trait;

/// Failure talking to the game server.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum TransportError {
    /// No response (connection refused, DNS, timeout).
    #[display("Network connection failed: {}", _0)]
    Network(String),

    /// Non-success HTTP status.
    #[display("HTTP {}: {}", status, message)]
    Http {
        /// Status code.
        status: u16,
        /// Short description.
        message: String,
    },

    /// Malformed or incomplete payload.
    #[display("Protocol error: {}", _0)]
    Protocol(String),

    /// The server answered but refused the request.
    #[display("Rejected by server: {}", _0)]
    Rejected(String),
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Protocol errors and client-side HTTP errors are final; they would
    /// fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            TransportError::Protocol(_) | TransportError::Rejected(_) => false,
        }
    }

    /// Human-readable text for an HTTP status.
    pub fn describe_status(status: u16) -> &'static str {
        match status {
            400 => "Invalid request",
            401 => "Authentication required",
            403 => "Access denied",
            404 => "Not found",
            409 => "Conflict - already in game or queue",
            500 => "Server error",
            503 => "Service unavailable",
            _ => "Network error",
        }
    }
}

impl std::fmt::Debug for dyn GameTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn GameTransport")
    }
}

/// The operations the client needs from the game server.
#[async_trait]
pub trait GameTransport: Send + Sync {
    /// Joins the matchmaking queue.
    async fn find_match(
        &self,
        player_id: &str,
        device_id: &str,
    ) -> Result<MatchmakingResponse, TransportError>;

    /// Leaves the matchmaking queue. Already-removed counts as success.
    async fn cancel_match(&self, player_id: &str) -> Result<(), TransportError>;

    /// Polls matchmaking status for a queued player.
    async fn match_status(&self, player_id: &str) -> Result<MatchmakingResponse, TransportError>;

    /// Number of players currently queued.
    async fn queue_size(&self) -> Result<u32, TransportError>;

    /// Fetches the authoritative snapshot of a game.
    async fn game_state(
        &self,
        game_id: &str,
        player_id: &str,
    ) -> Result<ServerSnapshot, TransportError>;

    /// Submits a placement or slide; returns the resulting snapshot.
    async fn make_move(
        &self,
        game_id: &str,
        request: &MoveRequest,
    ) -> Result<ServerSnapshot, TransportError>;

    /// Leaves a game.
    async fn leave_game(&self, game_id: &str, player_id: &str) -> Result<(), TransportError>;
}
