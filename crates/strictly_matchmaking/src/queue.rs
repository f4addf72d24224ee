//! Matchmaking queue admission state machine.
//!
//! ```text
//! Idle --join--> Joining --waiting--> InQueue --status: match--> MatchFound --ack--> InGame
//!                   |  \--match_found---------------------------^
//!                   \--failure--> Idle
//! InQueue / Joining / MatchFound --leave--> LeavingQueue --cancel (any result)--> Idle
//! ```
//!
//! Every spawned task carries the generation it was started under. Leaving,
//! cleanup and suspension bump or cancel it, so a response that arrives late
//! is dropped instead of mutating state.

use crate::convert::{GameSession, MatchConflict};
use crate::persistence::{EndReason, LoadOutcome, QueuePersistence, QueueProgress};
use crate::rpc::{AttemptError, ResilientRpcClient, RetryPolicy, RpcError};
use crate::timers::TimerSet;
use crate::transport::GameTransport;
use crate::wire::{MatchStatus, MatchmakingResponse, ServerSnapshot};
use derive_getters::Getters;
use derive_new::new;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strictly_morris::Side;
use strum::{Display, EnumString};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Status-check failures in a row after which the queue reports itself disconnected.
pub const DISCONNECT_THRESHOLD: u32 = 3;

/// Longest accepted player or device id.
pub const MAX_IDENTITY_LEN: usize = 64;

/// Admission states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    /// Not queued.
    Idle,
    /// Find-match request in flight.
    Joining,
    /// Waiting for an opponent.
    InQueue,
    /// Paired; waiting for the consumer to take the game.
    MatchFound,
    /// Cancel request in flight.
    LeavingQueue,
    /// The consumer took the game.
    InGame,
}

/// Timer settings for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct QueueTimings {
    /// Delay between status checks with no failures.
    pub status_check_interval: Duration,
    /// Upper bound on the status-check delay.
    pub status_check_max_interval: Duration,
    /// Period of the elapsed-time tick.
    pub ui_tick: Duration,
    /// Dwell in queue after which the session times out.
    pub queue_timeout: Duration,
}

impl Default for QueueTimings {
    fn default() -> Self {
        Self {
            status_check_interval: Duration::from_millis(3000),
            status_check_max_interval: Duration::from_millis(15_000),
            ui_tick: Duration::from_millis(1000),
            queue_timeout: Duration::from_secs(300),
        }
    }
}

impl QueueTimings {
    /// Delay before the next status check: `min(base * (1 + failures), max)`.
    pub fn status_check_delay(&self, consecutive_failures: u32) -> Duration {
        self.status_check_interval
            .saturating_mul(1 + consecutive_failures)
            .min(self.status_check_max_interval)
    }
}

/// Estimated wait in seconds for a queue of `queue_size` players.
///
/// Assumes pairs leave every minute and caps the estimate at five minutes.
pub fn estimate_wait_secs(queue_size: u32) -> u64 {
    if queue_size <= 1 {
        return 30;
    }
    let position = u64::from((queue_size / 2).max(1));
    (position * 60).min(300)
}

/// Snapshot of queue progress attached to every state change.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct QueueInfo {
    state: QueueState,
    time_in_queue: Duration,
    estimated_wait_secs: Option<u64>,
    queue_size: Option<u32>,
    status: String,
    is_connected: bool,
}

/// A match handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct MatchDetails {
    session: GameSession,
    local_side: Side,
    player_id: String,
}

impl MatchDetails {
    /// True if the local player holds the first seat.
    pub fn is_player1(&self) -> bool {
        self.local_side == Side::One
    }
}

/// Notifications from a [`QueueSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// State changed, or the elapsed-time tick fired.
    StateChanged(QueueInfo),
    /// Paired with an opponent.
    MatchFound(MatchDetails),
    /// Something went wrong; the queue is back in Idle unless noted.
    Error(String),
    /// The queue timeout expired; a leave follows.
    Timeout,
    /// Queue size and wait estimate were refreshed.
    PositionUpdated {
        /// Players in queue.
        position: u32,
        /// Estimated wait.
        eta_secs: u64,
    },
}

/// Synchronous refusals. None of them change state.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum QueueError {
    /// `join` or resume while not Idle.
    #[display("Already in matchmaking process ({})", _0)]
    NotIdle(QueueState),

    /// Malformed player or device id.
    #[display("Invalid {}: {}", field, reason)]
    InvalidIdentity {
        /// Which id.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The operation would discard an active game.
    #[display("A game is in progress")]
    GameInProgress,

    /// No match is waiting for acknowledgement.
    #[display("No match awaiting acknowledgement (state {})", _0)]
    NoPendingMatch(QueueState),
}

impl std::error::Error for QueueError {}

/// Checks that an id is trimmed, non-empty, at most 64 chars, ASCII
/// alphanumerics plus `-` and `_`.
///
/// # Errors
///
/// Returns [`QueueError::InvalidIdentity`] describing the first defect.
pub fn validate_identity(field: &'static str, id: &str) -> Result<(), QueueError> {
    let invalid = |reason: &str| QueueError::InvalidIdentity {
        field,
        reason: reason.to_string(),
    };
    if id.is_empty() {
        return Err(invalid("empty"));
    }
    if id.trim() != id {
        return Err(invalid("surrounding whitespace"));
    }
    if id.len() > MAX_IDENTITY_LEN {
        return Err(invalid("longer than 64 characters"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("unsupported characters"));
    }
    Ok(())
}

/// Failure resolving a match payload into a playable session.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
enum MatchFailure {
    #[display("{}", _0)]
    Protocol(String),
    #[display("{}", _0)]
    Conflict(MatchConflict),
}

#[derive(Debug)]
struct QueueInner {
    state: QueueState,
    player_id: Option<String>,
    device_id: Option<String>,
    started_at_ms: i64,
    accumulated_ms: i64,
    attempts: u32,
    status_failures: u32,
    queue_size: Option<u32>,
    eta_secs: Option<u64>,
    last_status: String,
    generation: u64,
    timers: TimerSet,
    suspended: bool,
    pending_match: Option<MatchDetails>,
}

impl Default for QueueInner {
    fn default() -> Self {
        Self {
            state: QueueState::Idle,
            player_id: None,
            device_id: None,
            started_at_ms: 0,
            accumulated_ms: 0,
            attempts: 0,
            status_failures: 0,
            queue_size: None,
            eta_secs: None,
            last_status: String::new(),
            generation: 0,
            timers: TimerSet::new(),
            suspended: false,
            pending_match: None,
        }
    }
}

fn status_text(state: QueueState, last_status: &str, is_connected: bool) -> String {
    match state {
        QueueState::Idle => "Ready to find match".to_string(),
        QueueState::Joining => "Joining matchmaking queue...".to_string(),
        QueueState::InQueue if !is_connected => "Connection issues - retrying...".to_string(),
        QueueState::InQueue if last_status.is_empty() => "Searching for opponent...".to_string(),
        QueueState::InQueue => last_status.to_string(),
        QueueState::MatchFound => "Match found! Loading game...".to_string(),
        QueueState::InGame => "In game".to_string(),
        QueueState::LeavingQueue => "Leaving queue...".to_string(),
    }
}

fn operation_ids(player_id: &str) -> [String; 5] {
    [
        format!("find_match:{}", player_id),
        format!("queue_size:{}", player_id),
        format!("match_status:{}", player_id),
        format!("match_state:{}", player_id),
        format!("cancel_match:{}", player_id),
    ]
}

/// One player's matchmaking session.
///
/// Cheap to clone; clones share state. All methods must be called from
/// within a tokio runtime.
#[derive(Debug, Clone)]
pub struct QueueSession {
    inner: Arc<Mutex<QueueInner>>,
    transport: Arc<dyn GameTransport>,
    rpc: ResilientRpcClient,
    persistence: QueuePersistence,
    timings: QueueTimings,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl QueueSession {
    /// Creates an idle session.
    pub fn new(
        transport: Arc<dyn GameTransport>,
        rpc: ResilientRpcClient,
        persistence: QueuePersistence,
        timings: QueueTimings,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            transport,
            rpc,
            persistence,
            timings,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> QueueState {
        self.lock().state
    }

    /// Player id of the current or last session.
    pub fn player_id(&self) -> Option<String> {
        self.lock().player_id.clone()
    }

    /// Progress snapshot as it would be reported now.
    pub fn info(&self) -> QueueInfo {
        self.build_info(&self.lock())
    }

    /// Time since the player entered the queue.
    pub fn time_in_queue(&self) -> Duration {
        let inner = self.lock();
        self.elapsed(&inner)
    }

    /// The persistence this session writes through.
    pub fn persistence(&self) -> &QueuePersistence {
        &self.persistence
    }

    fn elapsed(&self, inner: &QueueInner) -> Duration {
        if inner.started_at_ms <= 0 {
            return Duration::ZERO;
        }
        let ms = (self.persistence.now_ms() - inner.started_at_ms).max(0);
        Duration::from_millis(ms as u64)
    }

    fn build_info(&self, inner: &QueueInner) -> QueueInfo {
        let is_connected = inner.status_failures < DISCONNECT_THRESHOLD;
        QueueInfo {
            state: inner.state,
            time_in_queue: self.elapsed(inner),
            estimated_wait_secs: inner.eta_secs,
            queue_size: inner.queue_size,
            status: status_text(inner.state, &inner.last_status, is_connected),
            is_connected,
        }
    }

    fn emit(&self, event: QueueEvent) {
        if self.events.send(event).is_err() {
            debug!("Queue event receiver dropped");
        }
    }

    fn is_current(inner: &QueueInner, generation: u64, state: QueueState) -> bool {
        inner.generation == generation && inner.state == state
    }

    /// Moves to `state`, emits the change and refreshes the snapshot while InQueue.
    fn transition(&self, inner: &mut QueueInner, state: QueueState) {
        let from = inner.state;
        inner.state = state;
        info!(from = %from, to = %state, "Queue state changed");
        self.emit(QueueEvent::StateChanged(self.build_info(inner)));
        if state == QueueState::InQueue {
            self.persist(inner);
        }
    }

    fn persist(&self, inner: &QueueInner) {
        let (Some(player_id), Some(device_id)) = (&inner.player_id, &inner.device_id) else {
            return;
        };
        let progress = QueueProgress::new(
            inner.state,
            player_id.clone(),
            device_id.clone(),
            inner.started_at_ms,
            inner.accumulated_ms + self.elapsed(inner).as_millis() as i64,
            inner.attempts,
            inner.queue_size,
        );
        if let Err(e) = self.persistence.save(&progress) {
            warn!(error = %e, "Failed to save queue snapshot");
        }
    }

    fn clear_persistence(&self) {
        if let Err(e) = self.persistence.clear() {
            warn!(error = %e, "Failed to clear queue snapshot");
        }
    }

    fn record(&self, inner: &QueueInner, match_found: bool, reason: EndReason) {
        let wait = self.elapsed(inner).as_millis() as i64;
        if let Err(e) = self
            .persistence
            .record_outcome(wait, inner.attempts, match_found, reason)
        {
            warn!(error = %e, "Failed to record queue statistics");
        }
    }

    /// Cancels timers and in-flight RPCs and invalidates outstanding tasks.
    fn stop_all(&self, inner: &mut QueueInner) {
        inner.generation += 1;
        inner.timers.cancel_all();
        if let Some(player_id) = &inner.player_id {
            for op in operation_ids(player_id) {
                self.rpc.cancel(&op);
            }
        }
    }

    /// Starts a find-match request.
    ///
    /// The outcome arrives as [`QueueEvent`]s.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotIdle`] unless Idle
    /// - [`QueueError::InvalidIdentity`] for a malformed id
    ///
    /// Neither changes any state.
    #[instrument(skip(self), fields(player_id = %player_id))]
    pub fn join(&self, player_id: &str, device_id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.state != QueueState::Idle {
            warn!(state = %inner.state, "Join rejected");
            return Err(QueueError::NotIdle(inner.state));
        }
        validate_identity("player id", player_id)?;
        validate_identity("device id", device_id)?;

        inner.player_id = Some(player_id.to_string());
        inner.device_id = Some(device_id.to_string());
        inner.started_at_ms = self.persistence.now_ms();
        inner.accumulated_ms = 0;
        inner.attempts += 1;
        inner.status_failures = 0;
        inner.queue_size = None;
        inner.eta_secs = None;
        inner.last_status.clear();
        inner.pending_match = None;
        inner.generation += 1;
        let generation = inner.generation;
        self.transition(&mut inner, QueueState::Joining);

        let session = self.clone();
        let player = player_id.to_string();
        let device = device_id.to_string();
        let task = tokio::spawn(async move {
            let transport = Arc::clone(&session.transport);
            let (p, d) = (player.clone(), device.clone());
            let result = session
                .rpc
                .execute(
                    &format!("find_match:{}", player),
                    RetryPolicy::default(),
                    move |_ctx| {
                        let transport = Arc::clone(&transport);
                        let (p, d) = (p.clone(), d.clone());
                        async move {
                            transport
                                .find_match(&p, &d)
                                .await
                                .map_err(AttemptError::from)
                        }
                    },
                )
                .await;
            session.on_join_result(generation, result).await;
        });
        inner.timers.track(task.abort_handle());
        Ok(())
    }

    async fn on_join_result(&self, generation: u64, result: Result<MatchmakingResponse, RpcError>) {
        if !Self::is_current(&self.lock(), generation, QueueState::Joining) {
            debug!("Stale join response ignored");
            return;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.fail_join(generation, format!("Failed to join matchmaking: {}", e));
                return;
            }
        };

        match response.status {
            MatchStatus::MatchFound => {
                info!("Immediate match found");
                self.resolve_match(generation, QueueState::Joining, response)
                    .await;
            }
            MatchStatus::Waiting | MatchStatus::AlreadyInQueue => {
                let mut inner = self.lock();
                if !Self::is_current(&inner, generation, QueueState::Joining) {
                    return;
                }
                if response.status == MatchStatus::AlreadyInQueue {
                    inner.last_status = "In matchmaking queue...".to_string();
                }
                self.enter_queue(&mut inner);
            }
            other => {
                let message = response
                    .message
                    .unwrap_or_else(|| format!("Unexpected matchmaking status: {}", other));
                self.fail_join(generation, format!("Failed to join matchmaking: {}", message));
            }
        }
    }

    fn fail_join(&self, generation: u64, message: String) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        error!(%message, "Join failed");
        self.stop_all(&mut inner);
        self.record(&inner, false, EndReason::JoinFailed);
        self.transition(&mut inner, QueueState::Idle);
        self.clear_persistence();
        self.emit(QueueEvent::Error(message));
    }

    /// Enters InQueue and arms the status-check loop, the tick and the timeout.
    /// A suspended session only records the entry; [`resume`](Self::resume)
    /// arms monitoring.
    fn enter_queue(&self, inner: &mut QueueInner) {
        inner.status_failures = 0;
        self.transition(inner, QueueState::InQueue);
        if inner.suspended {
            debug!("Entered queue while suspended; monitoring deferred");
            return;
        }
        self.start_monitoring(inner);
    }

    fn start_monitoring(&self, inner: &mut QueueInner) {
        inner.timers.cancel_all();
        let generation = inner.generation;

        let session = self.clone();
        inner.timers.after(Duration::ZERO, move || async move {
            session.status_check(generation).await;
        });

        let session = self.clone();
        let tick = self.timings.ui_tick;
        let ticker = tokio::spawn(async move {
            loop {
                {
                    let inner = session.lock();
                    if !Self::is_current(&inner, generation, QueueState::InQueue) {
                        break;
                    }
                    session.emit(QueueEvent::StateChanged(session.build_info(&inner)));
                }
                tokio::time::sleep(tick).await;
            }
        });
        inner.timers.track(ticker.abort_handle());

        let remaining = self.timings.queue_timeout.saturating_sub(self.elapsed(inner));
        let session = self.clone();
        inner.timers.after(remaining, move || async move {
            session.on_timeout(generation);
        });
        debug!(timeout_in_ms = remaining.as_millis() as u64, "Queue monitoring started");
    }

    fn schedule_status_check(&self, timers: &mut TimerSet, delay: Duration, generation: u64) {
        let session = self.clone();
        timers.after(delay, move || async move {
            session.status_check(generation).await;
        });
    }

    #[instrument(skip(self))]
    async fn status_check(&self, generation: u64) {
        let player_id = {
            let inner = self.lock();
            if !Self::is_current(&inner, generation, QueueState::InQueue) {
                return;
            }
            match inner.player_id.clone() {
                Some(id) => id,
                None => return,
            }
        };

        let transport = Arc::clone(&self.transport);
        let size = self
            .rpc
            .execute(
                &format!("queue_size:{}", player_id),
                RetryPolicy::quick(),
                move |_ctx| {
                    let transport = Arc::clone(&transport);
                    async move { transport.queue_size().await.map_err(AttemptError::from) }
                },
            )
            .await;

        {
            let mut inner = self.lock();
            if !Self::is_current(&inner, generation, QueueState::InQueue) {
                return;
            }
            match size {
                Ok(size) => {
                    let eta = estimate_wait_secs(size);
                    inner.queue_size = Some(size);
                    inner.eta_secs = Some(eta);
                    inner.status_failures = 0;
                    debug!(size, eta, "Queue size updated");
                    self.emit(QueueEvent::PositionUpdated {
                        position: size,
                        eta_secs: eta,
                    });
                    if let Err(e) = self.persistence.update_position(size) {
                        warn!(error = %e, "Failed to record queue position");
                    }
                }
                Err(e) => {
                    inner.status_failures += 1;
                    warn!(failures = inner.status_failures, error = %e, "Queue size check failed");
                }
            }
        }

        let transport = Arc::clone(&self.transport);
        let p = player_id.clone();
        let status = self
            .rpc
            .execute(
                &format!("match_status:{}", player_id),
                RetryPolicy::quick(),
                move |_ctx| {
                    let transport = Arc::clone(&transport);
                    let p = p.clone();
                    async move { transport.match_status(&p).await.map_err(AttemptError::from) }
                },
            )
            .await;

        if let Ok(response) = &status
            && response.status == MatchStatus::MatchFound
        {
            info!("Match found during status check");
            self.resolve_match(generation, QueueState::InQueue, response.clone())
                .await;
            return;
        }

        let mut inner = self.lock();
        if !Self::is_current(&inner, generation, QueueState::InQueue) {
            return;
        }
        match status {
            Ok(response) => match response.status {
                MatchStatus::Waiting => {
                    inner.last_status = "Searching for opponent...".to_string();
                    inner.status_failures = 0;
                }
                MatchStatus::AlreadyInQueue => {
                    inner.last_status = "In matchmaking queue...".to_string();
                    inner.status_failures = 0;
                }
                other => {
                    inner.status_failures += 1;
                    warn!(status = %other, failures = inner.status_failures, "Unexpected status check answer");
                }
            },
            Err(e) => {
                inner.status_failures += 1;
                warn!(failures = inner.status_failures, error = %e, "Match status check failed");
            }
        }
        if inner.status_failures == DISCONNECT_THRESHOLD {
            error!("Queue status checks failing; reporting disconnected");
        }

        self.persist(&inner);

        let delay = self.timings.status_check_delay(inner.status_failures);
        self.schedule_status_check(&mut inner.timers, delay, generation);
        debug!(delay_ms = delay.as_millis() as u64, "Next status check scheduled");
    }

    /// Turns a match-found payload into [`MatchDetails`], fetching the game
    /// when the embedded snapshot is missing or finished.
    async fn resolve_match(
        &self,
        generation: u64,
        expected: QueueState,
        response: MatchmakingResponse,
    ) {
        let local_player = self.lock().player_id.clone();
        let Some(local_player) = local_player else {
            return;
        };

        let resolved = self.build_match(&local_player, response).await;

        let mut inner = self.lock();
        if !Self::is_current(&inner, generation, expected) {
            debug!("Stale match resolution ignored");
            return;
        }

        match resolved {
            Ok(details) => {
                self.stop_all(&mut inner);
                self.record(&inner, true, EndReason::MatchFound);
                inner.pending_match = Some(details.clone());
                self.transition(&mut inner, QueueState::MatchFound);
                self.clear_persistence();
                info!(
                    game_id = %details.session.id(),
                    side = %details.local_side,
                    "Match ready"
                );
                self.emit(QueueEvent::MatchFound(details));
            }
            Err(failure) => {
                let reason = match failure {
                    MatchFailure::Conflict(_) => EndReason::Conflict,
                    MatchFailure::Protocol(_) => EndReason::JoinFailed,
                };
                error!(%failure, "Match refused");
                self.stop_all(&mut inner);
                self.record(&inner, false, reason);
                self.transition(&mut inner, QueueState::Idle);
                self.clear_persistence();
                self.emit(QueueEvent::Error(failure.to_string()));
            }
        }
    }

    async fn build_match(
        &self,
        local_player: &str,
        response: MatchmakingResponse,
    ) -> Result<MatchDetails, MatchFailure> {
        let (Some(game_id), Some(player_id), Some(_number)) = (
            response.game_id.clone(),
            response.player_id.clone(),
            response.player_number,
        ) else {
            return Err(MatchFailure::Protocol("Incomplete match data".to_string()));
        };
        if player_id != local_player {
            warn!(assigned = %player_id, "Server assigned a different player id");
        }

        let snapshot = match response.game_state.filter(|s| !s.is_finished()) {
            Some(snapshot) => snapshot,
            None => self.fetch_match_state(&game_id, &player_id).await?,
        };

        let mut snapshot: ServerSnapshot = snapshot;
        if snapshot.game_id.is_none() {
            snapshot.game_id = Some(game_id);
        }
        let session = GameSession::from_snapshot(&snapshot)
            .map_err(|e| MatchFailure::Protocol(e.to_string()))?;
        let local_side = session
            .check_participants(&player_id)
            .map_err(MatchFailure::Conflict)?;

        Ok(MatchDetails {
            session,
            local_side,
            player_id,
        })
    }

    async fn fetch_match_state(
        &self,
        game_id: &str,
        player_id: &str,
    ) -> Result<ServerSnapshot, MatchFailure> {
        debug!(game_id, "Fetching game state for match");
        let transport = Arc::clone(&self.transport);
        let (g, p) = (game_id.to_string(), player_id.to_string());
        let snapshot = self
            .rpc
            .execute(
                &format!("match_state:{}", player_id),
                RetryPolicy::quick(),
                move |_ctx| {
                    let transport = Arc::clone(&transport);
                    let (g, p) = (g.clone(), p.clone());
                    async move { transport.game_state(&g, &p).await.map_err(AttemptError::from) }
                },
            )
            .await
            .map_err(|e| MatchFailure::Protocol(format!("Failed to load matched game: {}", e)))?;

        if snapshot.is_finished() {
            return Err(MatchFailure::Protocol("Game not available".to_string()));
        }
        Ok(snapshot)
    }

    fn on_timeout(&self, generation: u64) {
        {
            let inner = self.lock();
            if !Self::is_current(&inner, generation, QueueState::InQueue) {
                return;
            }
            warn!("Queue timeout reached");
            self.record(&inner, false, EndReason::Timeout);
        }
        self.emit(QueueEvent::Timeout);
        // The leave cancels this timer's own task, so it runs on a fresh one.
        let session = self.clone();
        tokio::spawn(async move { session.leave_inner(false).await });
    }

    /// Takes the pending match: MatchFound → InGame.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NoPendingMatch`] unless in MatchFound.
    #[instrument(skip(self))]
    pub fn acknowledge_match(&self) -> Result<MatchDetails, QueueError> {
        let mut inner = self.lock();
        if inner.state != QueueState::MatchFound {
            return Err(QueueError::NoPendingMatch(inner.state));
        }
        let Some(details) = inner.pending_match.take() else {
            return Err(QueueError::NoPendingMatch(inner.state));
        };
        self.transition(&mut inner, QueueState::InGame);
        Ok(details)
    }

    /// Ends the active game: InGame → Idle.
    #[instrument(skip(self))]
    pub fn end_game(&self) {
        let mut inner = self.lock();
        if inner.state == QueueState::InGame {
            inner.started_at_ms = 0;
            self.transition(&mut inner, QueueState::Idle);
        }
    }

    /// Leaves the queue. Idle is a no-op.
    ///
    /// Cancels all timers first; the cancel RPC's result does not matter,
    /// the session always ends Idle with persistence cleared.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::GameInProgress`] while InGame.
    #[instrument(skip(self))]
    pub async fn leave_queue(&self) -> Result<(), QueueError> {
        match self.state() {
            QueueState::Idle | QueueState::LeavingQueue => {
                debug!("Nothing to leave");
                Ok(())
            }
            QueueState::InGame => Err(QueueError::GameInProgress),
            _ => {
                self.leave_inner(true).await;
                Ok(())
            }
        }
    }

    async fn leave_inner(&self, record: bool) {
        let player_id = {
            let mut inner = self.lock();
            if matches!(
                inner.state,
                QueueState::Idle | QueueState::LeavingQueue | QueueState::InGame
            ) {
                return;
            }
            self.stop_all(&mut inner);
            if record {
                self.record(&inner, false, EndReason::Left);
            }
            inner.pending_match = None;
            self.transition(&mut inner, QueueState::LeavingQueue);
            inner.player_id.clone()
        };
        let generation = self.lock().generation;

        if let Some(player_id) = player_id {
            let transport = Arc::clone(&self.transport);
            let p = player_id.clone();
            let result = self
                .rpc
                .execute(
                    &format!("cancel_match:{}", player_id),
                    RetryPolicy::quick(),
                    move |_ctx| {
                        let transport = Arc::clone(&transport);
                        let p = p.clone();
                        async move { transport.cancel_match(&p).await.map_err(AttemptError::from) }
                    },
                )
                .await;
            match result {
                Ok(()) => info!("Left queue"),
                Err(e) => warn!(error = %e, "Cancel request failed; leaving anyway"),
            }
        }

        let mut inner = self.lock();
        if inner.generation == generation && inner.state == QueueState::LeavingQueue {
            inner.started_at_ms = 0;
            self.transition(&mut inner, QueueState::Idle);
            self.clear_persistence();
        }
    }

    /// Tears the session down synchronously and returns the resulting state.
    ///
    /// Every pending timer and RPC is cancelled. An InGame session is kept;
    /// any other state becomes Idle with persistence cleared.
    #[instrument(skip(self))]
    pub fn cleanup(&self) -> QueueState {
        let mut inner = self.lock();
        self.stop_all(&mut inner);
        inner.suspended = false;
        match inner.state {
            QueueState::InGame => {
                info!("Cleanup kept the active game");
            }
            QueueState::Idle => {}
            state => {
                if matches!(state, QueueState::Joining | QueueState::InQueue) {
                    self.record(&inner, false, EndReason::Cleanup);
                }
                inner.pending_match = None;
                inner.started_at_ms = 0;
                self.clear_persistence();
                self.transition(&mut inner, QueueState::Idle);
            }
        }
        inner.state
    }

    /// Pauses status checks, the tick and the timeout while InQueue. The
    /// snapshot is refreshed so a process that never comes back can be
    /// resumed from storage. Other states keep their in-flight work; a join
    /// that lands in the queue while suspended waits for `resume` to start
    /// monitoring.
    #[instrument(skip(self))]
    pub fn suspend(&self) {
        let mut inner = self.lock();
        if inner.suspended {
            return;
        }
        inner.suspended = true;
        if inner.state == QueueState::InQueue {
            self.stop_all(&mut inner);
            self.persist(&inner);
        }
        debug!(state = %inner.state, "Queue suspended");
    }

    /// Restarts monitoring after [`suspend`](Self::suspend).
    ///
    /// The timeout keeps counting from the original start; if it already
    /// passed, the timeout fires immediately.
    #[instrument(skip(self))]
    pub fn resume(&self) {
        let mut inner = self.lock();
        if !inner.suspended {
            return;
        }
        inner.suspended = false;
        if inner.state == QueueState::InQueue {
            self.emit(QueueEvent::StateChanged(self.build_info(&inner)));
            self.start_monitoring(&mut inner);
        }
        debug!(state = %inner.state, "Queue resumed");
    }

    /// Restores a persisted InQueue session, keeping its original start time.
    ///
    /// Returns `Ok(false)` when nothing restorable is stored; an invalid
    /// snapshot is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotIdle`] unless Idle.
    #[instrument(skip(self))]
    pub fn resume_from_persistence(&self) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        if inner.state != QueueState::Idle {
            return Err(QueueError::NotIdle(inner.state));
        }

        let snapshot = match self.persistence.load() {
            Ok(LoadOutcome::Valid(snapshot)) => snapshot,
            Ok(LoadOutcome::Invalid(reason)) => {
                info!(%reason, "Stored queue session not resumable");
                self.clear_persistence();
                return Ok(false);
            }
            Ok(LoadOutcome::Absent) => return Ok(false),
            Err(e) => {
                warn!(error = %e, "Failed to read queue snapshot");
                return Ok(false);
            }
        };
        if validate_identity("player id", snapshot.player_id()).is_err()
            || validate_identity("device id", snapshot.device_id()).is_err()
        {
            warn!("Stored identity malformed; discarding snapshot");
            self.clear_persistence();
            return Ok(false);
        }

        inner.player_id = Some(snapshot.player_id().clone());
        inner.device_id = Some(snapshot.device_id().clone());
        inner.started_at_ms = *snapshot.queue_started_at();
        inner.accumulated_ms = 0;
        inner.attempts = *snapshot.attempt_count();
        inner.queue_size = *snapshot.last_known_queue_position();
        inner.eta_secs = inner.queue_size.map(estimate_wait_secs);
        inner.last_status.clear();
        inner.pending_match = None;
        inner.suspended = false;
        inner.generation += 1;
        info!(
            player_id = %snapshot.player_id(),
            restarted = snapshot.session_id() != self.persistence.session_id(),
            "Resuming queue from snapshot"
        );
        self.enter_queue(&mut inner);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_wait() {
        assert_eq!(estimate_wait_secs(0), 30);
        assert_eq!(estimate_wait_secs(1), 30);
        assert_eq!(estimate_wait_secs(2), 60);
        assert_eq!(estimate_wait_secs(3), 60);
        assert_eq!(estimate_wait_secs(8), 240);
        assert_eq!(estimate_wait_secs(40), 300);
    }

    #[test]
    fn test_status_check_delay_grows_and_caps() {
        let timings = QueueTimings::default();
        assert_eq!(timings.status_check_delay(0), Duration::from_secs(3));
        assert_eq!(timings.status_check_delay(1), Duration::from_secs(6));
        assert_eq!(timings.status_check_delay(4), Duration::from_secs(15));
        assert_eq!(timings.status_check_delay(9), Duration::from_secs(15));
    }

    #[test]
    fn test_status_texts() {
        assert_eq!(status_text(QueueState::Idle, "", true), "Ready to find match");
        assert_eq!(
            status_text(QueueState::InQueue, "", true),
            "Searching for opponent..."
        );
        assert_eq!(
            status_text(QueueState::InQueue, "In matchmaking queue...", true),
            "In matchmaking queue..."
        );
        assert_eq!(
            status_text(QueueState::InQueue, "anything", false),
            "Connection issues - retrying..."
        );
        assert_eq!(status_text(QueueState::LeavingQueue, "", true), "Leaving queue...");
    }

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity("player id", "player_01-abc").is_ok());
        assert!(validate_identity("player id", "").is_err());
        assert!(validate_identity("player id", " padded").is_err());
        assert!(validate_identity("player id", "has space").is_err());
        assert!(validate_identity("player id", &"a".repeat(65)).is_err());
        assert!(validate_identity("player id", &"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_state_names_round_trip() {
        assert_eq!(QueueState::InQueue.to_string(), "IN_QUEUE");
        assert_eq!("LEAVING_QUEUE".parse::<QueueState>(), Ok(QueueState::LeavingQueue));
    }
}
