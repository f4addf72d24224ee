//! Polling reconciliation against the authoritative game snapshot.
//!
//! Each tick fetches the snapshot, compares the tracked fields with the last
//! values seen and emits at most one [`PollEvent`] describing the change.
//! `totalMoves` is treated as a monotonic sequence: a snapshot that goes
//! backwards is stale and ignored.

use crate::convert::GameSession;
use crate::rpc::{AttemptError, ResilientRpcClient, RetryPolicy, RpcError};
use crate::timers::TimerSet;
use crate::transport::GameTransport;
use crate::wire::ServerSnapshot;
use derive_new::new;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strictly_morris::Side;
use strum::Display;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Timer settings for the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct PollerTimings {
    /// Delay between ticks with no failures.
    pub interval: Duration,
    /// Consecutive failures that stop polling.
    pub max_failures: u32,
}

impl Default for PollerTimings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            max_failures: 3,
        }
    }
}

/// What changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Delta {
    /// A winner appeared.
    GameEnded,
    /// The game became active with both seats filled.
    OpponentJoined,
    /// The move count grew and it is now the local side's turn.
    OpponentMoved,
    /// Something else changed.
    Updated,
    /// Nothing tracked changed.
    Unchanged,
    /// The snapshot is older than one already seen.
    Stale,
}

/// Notifications from a [`SessionPoller`].
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// The game has a winner; polling stopped.
    GameEnded(GameSession),
    /// The second player arrived.
    OpponentJoined(GameSession),
    /// The opponent moved.
    OpponentMoved(GameSession),
    /// Any other change.
    Updated(GameSession),
    /// One poll failed; polling continues with a longer delay.
    TransientError {
        /// Failure description.
        message: String,
        /// Failures in a row so far.
        consecutive_failures: u32,
    },
    /// Polling stopped after repeated or unrecoverable failures.
    Fatal(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Tracked {
    status: Option<String>,
    player1_turn: Option<bool>,
    winner: Option<String>,
    total_moves: Option<u32>,
}

impl Tracked {
    fn of(snapshot: &ServerSnapshot) -> Self {
        Self {
            status: Some(snapshot.game_status.clone()),
            player1_turn: Some(snapshot.player1_turn),
            winner: snapshot.winner.clone(),
            total_moves: Some(snapshot.total_moves),
        }
    }
}

/// Classifies `next` against the last tracked values, highest priority first.
fn classify(last: &Tracked, next: &ServerSnapshot, local_side: Side) -> Delta {
    if last.total_moves.is_some_and(|seen| next.total_moves < seen) {
        return Delta::Stale;
    }
    if last.winner.is_none() && next.winner.is_some() {
        return Delta::GameEnded;
    }
    if next.is_active()
        && next.both_assigned()
        && last.status.as_deref() != Some(next.game_status.as_str())
    {
        return Delta::OpponentJoined;
    }
    if last.total_moves.is_some_and(|seen| next.total_moves > seen) {
        let local_turn = next.player1_turn == (local_side == Side::One);
        return if local_turn {
            Delta::OpponentMoved
        } else {
            Delta::Updated
        };
    }
    let changed = last.status.as_deref() != Some(next.game_status.as_str())
        || last.player1_turn != Some(next.player1_turn)
        || last.winner != next.winner
        || last.total_moves != Some(next.total_moves);
    if changed {
        Delta::Updated
    } else {
        Delta::Unchanged
    }
}

#[derive(Debug)]
struct PollerInner {
    polling: bool,
    suspended: bool,
    failures: u32,
    last: Tracked,
    generation: u64,
    timers: TimerSet,
}

/// Polls one game for changes.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct SessionPoller {
    inner: Arc<Mutex<PollerInner>>,
    transport: Arc<dyn GameTransport>,
    rpc: ResilientRpcClient,
    game_id: String,
    player_id: String,
    local_side: Side,
    timings: PollerTimings,
    events: mpsc::UnboundedSender<PollEvent>,
}

impl SessionPoller {
    /// Creates a stopped poller for `game_id` as seen by `player_id`.
    pub fn new(
        transport: Arc<dyn GameTransport>,
        rpc: ResilientRpcClient,
        game_id: impl Into<String>,
        player_id: impl Into<String>,
        local_side: Side,
        timings: PollerTimings,
        events: mpsc::UnboundedSender<PollEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PollerInner {
                polling: false,
                suspended: false,
                failures: 0,
                last: Tracked::default(),
                generation: 0,
                timers: TimerSet::new(),
            })),
            transport,
            rpc,
            game_id: game_id.into(),
            player_id: player_id.into(),
            local_side,
            timings,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PollerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PollEvent) {
        if self.events.send(event).is_err() {
            debug!("Poll event receiver dropped");
        }
    }

    fn operation_id(&self) -> String {
        format!("poll:{}", self.game_id)
    }

    /// Game being polled.
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// True while ticks are scheduled.
    pub fn is_polling(&self) -> bool {
        self.lock().polling
    }

    /// Consecutive failed ticks.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().failures
    }

    /// Last move count seen.
    pub fn last_move_count(&self) -> Option<u32> {
        self.lock().last.total_moves
    }

    /// Starts polling immediately. No-op if already polling.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.polling {
            return;
        }
        inner.polling = true;
        inner.failures = 0;
        info!("Polling started");
        if !inner.suspended {
            self.schedule(&mut inner, Duration::ZERO);
        }
    }

    /// Stops polling and drops any in-flight tick.
    #[instrument(skip(self), fields(game_id = %self.game_id))]
    pub fn stop(&self) {
        let mut inner = self.lock();
        self.halt(&mut inner);
        info!("Polling stopped");
    }

    fn halt(&self, inner: &mut PollerInner) {
        inner.polling = false;
        inner.generation += 1;
        inner.timers.cancel_all();
        self.rpc.cancel(&self.operation_id());
    }

    /// Forgets everything seen so far.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.last = Tracked::default();
        inner.failures = 0;
    }

    /// Records the tracked fields of `snapshot` without emitting anything.
    pub fn prime(&self, snapshot: &ServerSnapshot) {
        self.lock().last = Tracked::of(snapshot);
    }

    /// Sets the last known move count after a local move was accepted, so
    /// its echo is not reported as an opponent move.
    #[instrument(skip(self))]
    pub fn seed_move_count(&self, total_moves: u32) {
        let mut inner = self.lock();
        if inner.last.total_moves.is_none_or(|seen| total_moves >= seen) {
            inner.last.total_moves = Some(total_moves);
        }
    }

    /// Pauses ticks without leaving the polling state.
    pub fn suspend(&self) {
        let mut inner = self.lock();
        if inner.suspended {
            return;
        }
        inner.suspended = true;
        inner.generation += 1;
        inner.timers.cancel_all();
        self.rpc.cancel(&self.operation_id());
        debug!(game_id = %self.game_id, "Polling suspended");
    }

    /// Resumes ticks with an immediate poll if polling was active.
    pub fn resume(&self) {
        let mut inner = self.lock();
        if !inner.suspended {
            return;
        }
        inner.suspended = false;
        if inner.polling {
            self.schedule(&mut inner, Duration::ZERO);
        }
        debug!(game_id = %self.game_id, "Polling resumed");
    }

    fn schedule(&self, inner: &mut PollerInner, delay: Duration) {
        let generation = inner.generation;
        let poller = self.clone();
        inner.timers.after(delay, move || async move {
            poller.tick(generation).await;
        });
    }

    /// Classifies `snapshot`, updates the tracked fields and emits the event.
    ///
    /// Used both by ticks and by callers applying a server response of their own.
    ///
    /// # Errors
    ///
    /// Returns the conversion error if `snapshot` does not describe a legal game.
    #[instrument(skip(self, snapshot), fields(game_id = %self.game_id, total_moves = snapshot.total_moves))]
    pub fn reconcile(
        &self,
        snapshot: &ServerSnapshot,
    ) -> Result<Delta, crate::convert::SnapshotError> {
        let session = GameSession::from_snapshot(snapshot)?;
        let mut inner = self.lock();
        let delta = classify(&inner.last, snapshot, self.local_side);
        debug!(%delta, "Snapshot classified");

        if delta == Delta::Stale {
            return Ok(delta);
        }
        inner.last = Tracked::of(snapshot);

        match delta {
            Delta::GameEnded => {
                info!(winner = ?snapshot.winner, "Game ended");
                self.halt(&mut inner);
                self.emit(PollEvent::GameEnded(session));
            }
            Delta::OpponentJoined => {
                info!("Opponent joined");
                self.emit(PollEvent::OpponentJoined(session));
            }
            Delta::OpponentMoved => self.emit(PollEvent::OpponentMoved(session)),
            Delta::Updated => self.emit(PollEvent::Updated(session)),
            Delta::Unchanged | Delta::Stale => {}
        }
        Ok(delta)
    }

    async fn tick(&self, generation: u64) {
        {
            let inner = self.lock();
            if !inner.polling || inner.suspended || inner.generation != generation {
                return;
            }
        }

        let transport = Arc::clone(&self.transport);
        let (g, p) = (self.game_id.clone(), self.player_id.clone());
        let policy = RetryPolicy::quick()
            .with_max_attempts(1)
            .with_use_breaker(true);
        let result = self
            .rpc
            .execute(&self.operation_id(), policy, move |_ctx| {
                let transport = Arc::clone(&transport);
                let (g, p) = (g.clone(), p.clone());
                async move { transport.game_state(&g, &p).await.map_err(AttemptError::from) }
            })
            .await;

        if self.lock().generation != generation {
            debug!("Stale poll result ignored");
            return;
        }

        let outcome = match result {
            Ok(snapshot) => self
                .reconcile(&snapshot)
                .map_err(|e| format!("Invalid game state: {}", e)),
            Err(RpcError::ServiceUnavailable) => {
                self.fail_fatal(generation, RpcError::ServiceUnavailable.to_string());
                return;
            }
            Err(e) => Err(e.to_string()),
        };

        let mut inner = self.lock();
        if inner.generation != generation || !inner.polling {
            return;
        }
        match outcome {
            Ok(_) => {
                inner.failures = 0;
                self.schedule(&mut inner, self.timings.interval);
            }
            Err(message) => {
                inner.failures += 1;
                let failures = inner.failures;
                if failures >= self.timings.max_failures {
                    drop(inner);
                    self.fail_fatal(generation, message);
                    return;
                }
                warn!(failures, max = self.timings.max_failures, %message, "Poll failed");
                self.emit(PollEvent::TransientError {
                    message,
                    consecutive_failures: failures,
                });
                let delay = self.timings.interval.saturating_mul(failures);
                self.schedule(&mut inner, delay);
            }
        }
    }

    fn fail_fatal(&self, generation: u64, message: String) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        error!(game_id = %self.game_id, %message, failures = inner.failures, "Polling stopped");
        self.halt(&mut inner);
        self.emit(PollEvent::Fatal(format!(
            "Stopped polling due to repeated failures. Check your connection. ({})",
            message
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{STATUS_ACTIVE, STATUS_WAITING};

    fn snapshot(status: &str, p1_turn: bool, moves: u32) -> ServerSnapshot {
        ServerSnapshot {
            game_id: Some("g1".into()),
            player1_id: Some("alice".into()),
            player2_id: Some("bob".into()),
            game_status: status.into(),
            player1_turn: p1_turn,
            player1_assigned: true,
            player2_assigned: true,
            total_moves: moves,
            ..ServerSnapshot::default()
        }
    }

    fn tracked(s: &ServerSnapshot) -> Tracked {
        Tracked::of(s)
    }

    #[test]
    fn test_winner_takes_priority() {
        let last = tracked(&snapshot(STATUS_ACTIVE, true, 4));
        let mut next = snapshot(STATUS_ACTIVE, false, 5);
        next.winner = Some("PLAYER 1".into());
        assert_eq!(classify(&last, &next, Side::Two), Delta::GameEnded);
    }

    #[test]
    fn test_activation_reports_join() {
        let last = tracked(&snapshot(STATUS_WAITING, true, 0));
        let next = snapshot(STATUS_ACTIVE, true, 0);
        assert_eq!(classify(&last, &next, Side::One), Delta::OpponentJoined);
    }

    #[test]
    fn test_move_count_uses_turn_parity() {
        let last = tracked(&snapshot(STATUS_ACTIVE, false, 1));
        let mine = snapshot(STATUS_ACTIVE, true, 2);
        assert_eq!(classify(&last, &mine, Side::One), Delta::OpponentMoved);
        assert_eq!(classify(&last, &mine, Side::Two), Delta::Updated);
    }

    #[test]
    fn test_stale_and_unchanged() {
        let last = tracked(&snapshot(STATUS_ACTIVE, true, 3));
        assert_eq!(
            classify(&last, &snapshot(STATUS_ACTIVE, true, 3), Side::One),
            Delta::Unchanged
        );
        assert_eq!(
            classify(&last, &snapshot(STATUS_ACTIVE, false, 2), Side::One),
            Delta::Stale
        );
    }

    #[test]
    fn test_turn_flip_without_moves_is_update() {
        let last = tracked(&snapshot(STATUS_ACTIVE, true, 3));
        assert_eq!(
            classify(&last, &snapshot(STATUS_ACTIVE, false, 3), Side::One),
            Delta::Updated
        );
    }
}
