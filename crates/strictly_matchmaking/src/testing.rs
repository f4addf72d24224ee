//! In-memory scripted transport for unit and integration testing.
//!
//! Each endpoint has a queue of canned responses. Responses are consumed in
//! order; the last one repeats once the queue is down to a single entry.
//! Endpoints with nothing scripted fall back to a neutral default.

use crate::transport::{GameTransport, TransportError};
use crate::wire::{MatchStatus, MatchmakingResponse, MoveRequest, ServerSnapshot};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Endpoints of [`GameTransport`], used to count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `find_match`
    FindMatch,
    /// `cancel_match`
    Cancel,
    /// `match_status`
    Status,
    /// `queue_size`
    QueueSize,
    /// `game_state`
    GameState,
    /// `make_move`
    Move,
    /// `leave_game`
    Leave,
}

type Reply<T> = Result<T, TransportError>;

#[derive(Debug, Default)]
struct Script {
    find: VecDeque<Reply<MatchmakingResponse>>,
    cancel: VecDeque<Reply<()>>,
    status: VecDeque<Reply<MatchmakingResponse>>,
    queue_size: VecDeque<Reply<u32>>,
    game_state: VecDeque<Reply<ServerSnapshot>>,
    moves: VecDeque<Reply<ServerSnapshot>>,
    leave: VecDeque<Reply<()>>,
}

fn next<T: Clone>(queue: &mut VecDeque<Reply<T>>, fallback: impl FnOnce() -> Reply<T>) -> Reply<T> {
    match queue.len() {
        0 => fallback(),
        1 => queue[0].clone(),
        _ => queue.pop_front().unwrap_or_else(fallback),
    }
}

/// A [`GameTransport`] that replays scripted responses.
///
/// # Example
///
/// ```ignore
/// let transport = Arc::new(ScriptedTransport::new());
/// transport.push_find(Ok(MatchmakingResponse::with_status(MatchStatus::Waiting)));
/// let queue = QueueSession::new(transport.clone(), rpc, persistence, timings, events);
/// ```
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    calls: Mutex<HashMap<Endpoint, usize>>,
    moves_sent: Mutex<Vec<MoveRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl ScriptedTransport {
    /// Creates a transport with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response by `latency` (honours paused tokio time).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a find-match response.
    pub fn push_find(&self, reply: Reply<MatchmakingResponse>) {
        self.script().find.push_back(reply);
    }

    /// Queues a cancel response.
    pub fn push_cancel(&self, reply: Reply<()>) {
        self.script().cancel.push_back(reply);
    }

    /// Queues a status-check response.
    pub fn push_status(&self, reply: Reply<MatchmakingResponse>) {
        self.script().status.push_back(reply);
    }

    /// Queues a queue-size response.
    pub fn push_queue_size(&self, reply: Reply<u32>) {
        self.script().queue_size.push_back(reply);
    }

    /// Queues a game-state response.
    pub fn push_game_state(&self, reply: Reply<ServerSnapshot>) {
        self.script().game_state.push_back(reply);
    }

    /// Queues a move response.
    pub fn push_move(&self, reply: Reply<ServerSnapshot>) {
        self.script().moves.push_back(reply);
    }

    /// Queues a leave-game response.
    pub fn push_leave(&self, reply: Reply<()>) {
        self.script().leave.push_back(reply);
    }

    /// Drops all queued game-state responses.
    pub fn clear_game_state(&self) {
        self.script().game_state.clear();
    }

    /// How many times `endpoint` was called.
    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Move bodies received, in order.
    pub fn moves_sent(&self) -> Vec<MoveRequest> {
        self.moves_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn record(&self, endpoint: Endpoint) {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint)
            .or_insert(0) += 1;
        debug!(?endpoint, "Scripted call");

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn unscripted<T>(what: &str) -> Reply<T> {
    Err(TransportError::Network(format!("no scripted {} response", what)))
}

#[async_trait]
impl GameTransport for ScriptedTransport {
    async fn find_match(
        &self,
        _player_id: &str,
        _device_id: &str,
    ) -> Result<MatchmakingResponse, TransportError> {
        self.record(Endpoint::FindMatch).await;
        next(&mut self.script().find, || unscripted("find"))
    }

    async fn cancel_match(&self, _player_id: &str) -> Result<(), TransportError> {
        self.record(Endpoint::Cancel).await;
        next(&mut self.script().cancel, || Ok(()))
    }

    async fn match_status(&self, _player_id: &str) -> Result<MatchmakingResponse, TransportError> {
        self.record(Endpoint::Status).await;
        next(&mut self.script().status, || {
            Ok(MatchmakingResponse::with_status(MatchStatus::Waiting))
        })
    }

    async fn queue_size(&self) -> Result<u32, TransportError> {
        self.record(Endpoint::QueueSize).await;
        next(&mut self.script().queue_size, || Ok(0))
    }

    async fn game_state(
        &self,
        _game_id: &str,
        _player_id: &str,
    ) -> Result<ServerSnapshot, TransportError> {
        self.record(Endpoint::GameState).await;
        next(&mut self.script().game_state, || unscripted("game state"))
    }

    async fn make_move(
        &self,
        _game_id: &str,
        request: &MoveRequest,
    ) -> Result<ServerSnapshot, TransportError> {
        self.record(Endpoint::Move).await;
        self.moves_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        next(&mut self.script().moves, || unscripted("move"))
    }

    async fn leave_game(&self, _game_id: &str, _player_id: &str) -> Result<(), TransportError> {
        self.record(Endpoint::Leave).await;
        next(&mut self.script().leave, || Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_response_repeats() {
        let transport = ScriptedTransport::new();
        transport.push_queue_size(Ok(4));
        transport.push_queue_size(Ok(2));

        assert_eq!(transport.queue_size().await, Ok(4));
        assert_eq!(transport.queue_size().await, Ok(2));
        assert_eq!(transport.queue_size().await, Ok(2));
        assert_eq!(transport.calls(Endpoint::QueueSize), 3);
    }

    #[tokio::test]
    async fn test_unscripted_defaults() {
        let transport = ScriptedTransport::new();
        assert_eq!(transport.cancel_match("p").await, Ok(()));
        assert_eq!(
            transport.match_status("p").await.unwrap().status,
            MatchStatus::Waiting
        );
        assert!(transport.find_match("p", "d").await.is_err());
    }
}
