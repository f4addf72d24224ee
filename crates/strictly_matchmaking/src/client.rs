//! Orchestration of queue, poller and rules for one local player.
//!
//! [`GameClient`] takes a match from the [`QueueSession`], starts a
//! [`SessionPoller`] for it and routes local moves through the rule engine
//! before they reach the server. Server responses to local moves go through
//! the same reconciliation path as polled snapshots.

use crate::convert::{GameSession, SnapshotError};
use crate::poller::{Delta, PollEvent, PollerTimings, SessionPoller};
use crate::queue::{MatchDetails, QueueError, QueueSession};
use crate::rpc::{AttemptError, ResilientRpcClient, RetryPolicy, RpcError};
use crate::transport::GameTransport;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strictly_morris::{Move, MoveError, Position, Side};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Failure of a [`GameClient`] operation.
#[derive(Debug, Clone, PartialEq, derive_more::Display)]
pub enum ClientError {
    /// Refused by the queue.
    #[display("{}", _0)]
    Queue(QueueError),

    /// No game has been acknowledged.
    #[display("No active game")]
    NoActiveGame,

    /// The opponent has not joined yet.
    #[display("Game is not ready yet. Please wait.")]
    NotReady,

    /// The rule engine refused the move; nothing was sent.
    #[display("{}", _0)]
    Rule(MoveError),

    /// The request failed.
    #[display("{}", _0)]
    Rpc(RpcError),

    /// The server answered with an unusable snapshot.
    #[display("Invalid game state: {}", _0)]
    Snapshot(SnapshotError),
}

impl std::error::Error for ClientError {}

impl From<QueueError> for ClientError {
    fn from(err: QueueError) -> Self {
        ClientError::Queue(err)
    }
}

impl From<MoveError> for ClientError {
    fn from(err: MoveError) -> Self {
        ClientError::Rule(err)
    }
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        ClientError::Rpc(err)
    }
}

impl From<SnapshotError> for ClientError {
    fn from(err: SnapshotError) -> Self {
        ClientError::Snapshot(err)
    }
}

#[derive(Debug)]
struct ActiveGame {
    session: GameSession,
    player_id: String,
    local_side: Side,
    poller: SessionPoller,
}

/// Result of a local move accepted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveReceipt {
    /// Session after the server applied the move.
    pub session: GameSession,
    /// How the response compared with what the poller had seen.
    pub delta: Delta,
}

/// Plays networked games for one local player.
///
/// Cheap to clone; clones share the active game.
#[derive(Debug, Clone)]
pub struct GameClient {
    transport: Arc<dyn GameTransport>,
    rpc: ResilientRpcClient,
    queue: QueueSession,
    poller_timings: PollerTimings,
    poll_events: mpsc::UnboundedSender<PollEvent>,
    active: Arc<Mutex<Option<ActiveGame>>>,
}

impl GameClient {
    /// Creates a client with no active game.
    ///
    /// `rpc` should be the same client the queue uses; moves and leave requests
    /// go through it. Each game's poller gets a client of its own so queue
    /// failures never trip the breaker guarding its ticks.
    pub fn new(
        transport: Arc<dyn GameTransport>,
        rpc: ResilientRpcClient,
        queue: QueueSession,
        poller_timings: PollerTimings,
        poll_events: mpsc::UnboundedSender<PollEvent>,
    ) -> Self {
        Self {
            transport,
            rpc,
            queue,
            poller_timings,
            poll_events,
            active: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveGame>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The matchmaking session.
    pub fn queue(&self) -> &QueueSession {
        &self.queue
    }

    /// The active game's session, if any.
    pub fn session(&self) -> Option<GameSession> {
        self.lock().as_ref().map(|a| a.session.clone())
    }

    /// Side the local player holds in the active game.
    pub fn local_side(&self) -> Option<Side> {
        self.lock().as_ref().map(|a| a.local_side)
    }

    /// True while the active game's poller is running.
    pub fn is_polling(&self) -> bool {
        self.lock().as_ref().is_some_and(|a| a.poller.is_polling())
    }

    /// True if the local player is to move in an active game.
    pub fn is_my_turn(&self) -> bool {
        self.lock().as_ref().is_some_and(|a| {
            a.session.is_active()
                && !a.session.is_finished()
                && a.session.game().turn() == a.local_side
        })
    }

    /// Takes the pending match and starts polling it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Queue`] unless the queue holds a match.
    #[instrument(skip(self))]
    pub fn acknowledge_match(&self) -> Result<MatchDetails, ClientError> {
        let details = self.queue.acknowledge_match()?;
        let session = details.session().clone();
        let game_id = session.id().clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let poller = SessionPoller::new(
            Arc::clone(&self.transport),
            ResilientRpcClient::new(),
            game_id.clone(),
            details.player_id().clone(),
            *details.local_side(),
            self.poller_timings,
            tx,
        );
        poller.prime(&session.to_snapshot());

        let previous = self.lock().replace(ActiveGame {
            session,
            player_id: details.player_id().clone(),
            local_side: *details.local_side(),
            poller: poller.clone(),
        });
        if let Some(previous) = previous {
            warn!(game_id = %previous.session.id(), "Replacing an unfinished game");
            previous.poller.stop();
        }

        self.spawn_forwarder(game_id.clone(), rx);
        poller.start();
        info!(%game_id, side = %details.local_side(), "Game acknowledged");
        Ok(details)
    }

    fn spawn_forwarder(&self, game_id: String, mut rx: mpsc::UnboundedReceiver<PollEvent>) {
        let active = Arc::clone(&self.active);
        let out = self.poll_events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let session = match &event {
                    PollEvent::GameEnded(s)
                    | PollEvent::OpponentJoined(s)
                    | PollEvent::OpponentMoved(s)
                    | PollEvent::Updated(s) => Some(s.clone()),
                    PollEvent::TransientError { .. } | PollEvent::Fatal(_) => None,
                };
                if let Some(session) = session {
                    let mut guard = active.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(game) = guard.as_mut().filter(|g| g.session.id() == &game_id) {
                        game.session = session;
                    }
                }
                if out.send(event).is_err() {
                    debug!("Poll event receiver dropped");
                }
            }
            debug!(%game_id, "Poll forwarding finished");
        });
    }

    /// Places a piece for the local side.
    ///
    /// # Errors
    ///
    /// See [`ClientError`]. Rule violations are reported without a request.
    pub async fn place(&self, to: Position) -> Result<MoveReceipt, ClientError> {
        self.submit(|side| Move::place(side, to)).await
    }

    /// Slides a local piece to an adjacent cell.
    ///
    /// # Errors
    ///
    /// See [`ClientError`]. Rule violations are reported without a request.
    pub async fn slide(&self, from: Position, to: Position) -> Result<MoveReceipt, ClientError> {
        self.submit(|side| Move::slide(side, from, to)).await
    }

    #[instrument(skip(self, build))]
    async fn submit(&self, build: impl FnOnce(Side) -> Move) -> Result<MoveReceipt, ClientError> {
        let (mv, game_id, player_id, poller) = {
            let guard = self.lock();
            let game = guard.as_ref().ok_or(ClientError::NoActiveGame)?;
            if !game.session.is_active() && !game.session.is_finished() {
                return Err(ClientError::NotReady);
            }
            let mv = build(game.local_side);
            if let Err(rejection) = game.session.game().validate(&mv) {
                warn!(%mv, kind = %rejection.kind(), %rejection, "Move rejected locally");
                return Err(rejection.into());
            }
            (
                mv,
                game.session.id().clone(),
                game.player_id.clone(),
                game.poller.clone(),
            )
        };

        let request = GameSession::move_request(&player_id, &mv);
        let transport = Arc::clone(&self.transport);
        let target = game_id.clone();
        let policy = RetryPolicy::quick()
            .with_max_attempts(1)
            .with_use_breaker(true);
        let snapshot = self
            .rpc
            .execute(&format!("move:{}", game_id), policy, move |_ctx| {
                let transport = Arc::clone(&transport);
                let (target, request) = (target.clone(), request.clone());
                async move {
                    transport
                        .make_move(&target, &request)
                        .await
                        .map_err(AttemptError::from)
                }
            })
            .await
            .inspect_err(|e| warn!(%mv, error = %e, "Move failed"))?;

        let session = GameSession::from_snapshot(&snapshot)?;
        poller.seed_move_count(snapshot.total_moves);
        let delta = poller.reconcile(&snapshot)?;

        if delta != Delta::Stale {
            let mut guard = self.lock();
            if let Some(game) = guard.as_mut().filter(|g| g.session.id() == &game_id) {
                game.session = session.clone();
            }
        }
        info!(%mv, total_moves = snapshot.total_moves, %delta, "Move accepted");
        Ok(MoveReceipt { session, delta })
    }

    /// Leaves the active game and returns the queue to Idle.
    ///
    /// Local state is cleared even if the leave request fails.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoActiveGame`] without a game, or the request
    /// failure after cleanup.
    #[instrument(skip(self))]
    pub async fn leave_game(&self) -> Result<(), ClientError> {
        let game = self.take_active().ok_or(ClientError::NoActiveGame)?;
        let game_id = game.session.id().clone();
        if game.session.is_finished() {
            debug!(%game_id, "Game already finished; skipping leave request");
            return Ok(());
        }

        let transport = Arc::clone(&self.transport);
        let (g, p) = (game_id.clone(), game.player_id.clone());
        let result = self
            .rpc
            .execute(
                &format!("leave:{}", game_id),
                RetryPolicy::quick(),
                move |_ctx| {
                    let transport = Arc::clone(&transport);
                    let (g, p) = (g.clone(), p.clone());
                    async move { transport.leave_game(&g, &p).await.map_err(AttemptError::from) }
                },
            )
            .await;

        match result {
            Ok(()) => {
                info!(%game_id, "Left game");
                Ok(())
            }
            Err(e) => {
                warn!(%game_id, error = %e, "Leave request failed");
                Err(e.into())
            }
        }
    }

    /// Drops a finished game locally without contacting the server.
    #[instrument(skip(self))]
    pub fn finish_game(&self) -> Option<GameSession> {
        self.take_active().map(|g| g.session)
    }

    fn take_active(&self) -> Option<ActiveGame> {
        let game = self.lock().take()?;
        game.poller.stop();
        self.queue.end_game();
        Some(game)
    }

    /// Pauses the queue and the active poller.
    pub fn suspend(&self) {
        self.queue.suspend();
        if let Some(game) = self.lock().as_ref() {
            game.poller.suspend();
        }
    }

    /// Resumes whatever [`suspend`](Self::suspend) paused.
    pub fn resume(&self) {
        self.queue.resume();
        if let Some(game) = self.lock().as_ref() {
            game.poller.resume();
        }
    }

    /// Cancels everything and drops the active game. Returns the queue state
    /// after cleanup.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> crate::queue::QueueState {
        if let Some(game) = self.take_active() {
            debug!(game_id = %game.session.id(), "Dropping active game");
        }
        let state = self.queue.cleanup();
        self.rpc.cancel_all();
        state
    }
}
