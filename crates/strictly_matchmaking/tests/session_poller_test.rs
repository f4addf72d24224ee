//! Tests for polling reconciliation.

use std::sync::Arc;
use std::time::Duration;

use strictly_matchmaking::testing::{Endpoint, ScriptedTransport};
use strictly_matchmaking::{
    Delta, MatchStatus, MatchmakingResponse, MemoryStore, PersistencePolicy, PlayerMove,
    PollEvent, PollerTimings, QueuePersistence, QueueSession, QueueState, QueueTimings,
    BreakerState, ResilientRpcClient, STATUS_ACTIVE, STATUS_FINISHED, STATUS_WAITING, ServerSnapshot,
    SessionPoller, TokioClock, TransportError,
};
use strictly_morris::{Game, Move, Phase, Position, Side};
use tokio::sync::mpsc;

fn snapshot_of(game: &Game, status: &str) -> ServerSnapshot {
    let wire = |side: Side| -> Vec<PlayerMove> {
        game.pieces(side)
            .iter()
            .map(|p| PlayerMove {
                board_x: p.col() as i64,
                board_y: p.row() as i64,
                player1: side == Side::One,
            })
            .collect()
    };
    ServerSnapshot {
        game_id: Some("g1".into()),
        player1_id: Some("alice".into()),
        player2_id: Some("bob".into()),
        game_status: status.to_string(),
        player1_turn: game.turn() == Side::One,
        placement_phase: game.phase() == Phase::Placement,
        winner: game.winner().map(|s| s.to_string()),
        game_started: true,
        player1_assigned: true,
        player2_assigned: true,
        total_moves: game.moves_played(),
        player1_moves: wire(Side::One),
        player2_moves: wire(Side::Two),
        ..ServerSnapshot::default()
    }
}

fn after(moves: &[(Side, Position)]) -> Game {
    let moves: Vec<Move> = moves.iter().map(|(s, p)| Move::place(*s, *p)).collect();
    Game::replay(&moves).expect("valid placements")
}

struct Harness {
    transport: Arc<ScriptedTransport>,
    rpc: ResilientRpcClient,
    poller: SessionPoller,
    events: mpsc::UnboundedReceiver<PollEvent>,
}

fn harness(local_side: Side) -> Harness {
    let transport = Arc::new(ScriptedTransport::new());
    let rpc = ResilientRpcClient::new();
    let (tx, events) = mpsc::unbounded_channel();
    let player = match local_side {
        Side::One => "alice",
        Side::Two => "bob",
    };
    let poller = SessionPoller::new(
        transport.clone(),
        rpc.clone(),
        "g1",
        player,
        local_side,
        PollerTimings::default(),
        tx,
    );
    Harness {
        transport,
        rpc,
        poller,
        events,
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<PollEvent>) -> Vec<PollEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_stop_polling_but_not_queue() {
    let mut h = harness(Side::One);

    let persistence = QueuePersistence::new(
        Arc::new(MemoryStore::new()),
        Arc::new(TokioClock::starting_at(1_700_000_000_000)),
        PersistencePolicy::default(),
    );
    let (queue_tx, _queue_events) = mpsc::unbounded_channel();
    let queue = QueueSession::new(
        h.transport.clone(),
        ResilientRpcClient::new(),
        persistence,
        QueueTimings::default(),
        queue_tx,
    );
    h.transport
        .push_find(Ok(MatchmakingResponse::with_status(MatchStatus::Waiting)));
    queue.join("carol", "phone-3").unwrap();

    // Game-state requests are unscripted and fail with a network error.
    h.poller.start();
    tokio::time::sleep(Duration::from_secs(7)).await;

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 3, "{:?}", events);
    assert!(matches!(
        events[0],
        PollEvent::TransientError {
            consecutive_failures: 1,
            ..
        }
    ));
    assert!(matches!(
        events[1],
        PollEvent::TransientError {
            consecutive_failures: 2,
            ..
        }
    ));
    match &events[2] {
        PollEvent::Fatal(message) => {
            assert!(message.starts_with("Stopped polling due to repeated failures"))
        }
        other => panic!("expected fatal, got {:?}", other),
    }
    assert!(!h.poller.is_polling());
    assert_eq!(h.transport.calls(Endpoint::GameState), 3);

    assert_eq!(queue.state(), QueueState::InQueue);
    assert!(*queue.info().is_connected());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.transport.calls(Endpoint::GameState), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failing_queue_does_not_trip_poller_breaker() {
    let mut h = harness(Side::One);

    let persistence = QueuePersistence::new(
        Arc::new(MemoryStore::new()),
        Arc::new(TokioClock::starting_at(1_700_000_000_000)),
        PersistencePolicy::default(),
    );
    let queue_rpc = ResilientRpcClient::new();
    let (queue_tx, _queue_events) = mpsc::unbounded_channel();
    let queue = QueueSession::new(
        h.transport.clone(),
        queue_rpc.clone(),
        persistence,
        QueueTimings::default(),
        queue_tx,
    );
    h.transport
        .push_find(Ok(MatchmakingResponse::with_status(MatchStatus::Waiting)));
    h.transport
        .push_queue_size(Err(TransportError::Network("unreachable".into())));
    h.transport
        .push_status(Err(TransportError::Network("unreachable".into())));
    queue.join("carol", "phone-3").unwrap();

    h.poller.start();
    tokio::time::sleep(Duration::from_secs(12)).await;

    // Queue failures open the queue's breaker only.
    assert_eq!(queue_rpc.breaker_state(), BreakerState::Open);
    assert_eq!(queue.state(), QueueState::InQueue);
    assert!(!*queue.info().is_connected());

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 3, "{:?}", events);
    assert!(matches!(
        events[1],
        PollEvent::TransientError {
            consecutive_failures: 2,
            ..
        }
    ));
    match &events[2] {
        PollEvent::Fatal(message) => {
            assert!(message.starts_with("Stopped polling due to repeated failures"));
            assert!(!message.contains("circuit breaker"), "{}", message);
        }
        other => panic!("expected fatal, got {:?}", other),
    }
    assert_eq!(h.transport.calls(Endpoint::GameState), 3);
    assert_eq!(h.rpc.breaker_failures(), 3);
    assert_eq!(h.rpc.breaker_state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_opponent_move_is_reported_once() {
    let mut h = harness(Side::One);
    let one_move = after(&[(Side::One, Position::Center)]);
    let two_moves = after(&[(Side::One, Position::Center), (Side::Two, Position::TopLeft)]);

    h.poller.prime(&snapshot_of(&one_move, STATUS_ACTIVE));
    h.transport
        .push_game_state(Ok(snapshot_of(&two_moves, STATUS_ACTIVE)));

    h.poller.start();
    tokio::time::sleep(Duration::from_millis(4500)).await;

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 1, "{:?}", events);
    match &events[0] {
        PollEvent::OpponentMoved(session) => {
            assert_eq!(session.total_moves(), 2);
            assert_eq!(session.game().turn(), Side::One);
        }
        other => panic!("expected opponent move, got {:?}", other),
    }
    assert_eq!(h.poller.last_move_count(), Some(2));
    assert!(h.transport.calls(Endpoint::GameState) >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_stale_snapshot_is_ignored() {
    let mut h = harness(Side::Two);
    let one_move = after(&[(Side::One, Position::Center)]);
    let two_moves = after(&[(Side::One, Position::Center), (Side::Two, Position::TopLeft)]);

    h.poller.prime(&snapshot_of(&two_moves, STATUS_ACTIVE));
    h.transport
        .push_game_state(Ok(snapshot_of(&one_move, STATUS_ACTIVE)));

    h.poller.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(drain(&mut h.events).is_empty());
    assert_eq!(h.poller.last_move_count(), Some(2));
    assert_eq!(h.poller.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_winner_stops_polling() {
    let mut h = harness(Side::Two);
    let won = after(&[
        (Side::One, Position::TopLeft),
        (Side::Two, Position::Center),
        (Side::One, Position::TopCenter),
        (Side::Two, Position::BottomLeft),
        (Side::One, Position::TopRight),
    ]);
    let before = after(&[
        (Side::One, Position::TopLeft),
        (Side::Two, Position::Center),
        (Side::One, Position::TopCenter),
        (Side::Two, Position::BottomLeft),
    ]);

    h.poller.prime(&snapshot_of(&before, STATUS_ACTIVE));
    h.transport
        .push_game_state(Ok(snapshot_of(&won, STATUS_FINISHED)));

    h.poller.start();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 1);
    match &events[0] {
        PollEvent::GameEnded(session) => {
            assert_eq!(session.game().winner(), Some(Side::One));
            assert!(session.is_finished());
        }
        other => panic!("expected game end, got {:?}", other),
    }
    assert!(!h.poller.is_polling());
    assert_eq!(h.transport.calls(Endpoint::GameState), 1);
}

#[tokio::test(start_paused = true)]
async fn test_opponent_join_is_reported() {
    let mut h = harness(Side::One);
    let mut waiting = snapshot_of(&Game::new(), STATUS_WAITING);
    waiting.player2_id = None;
    waiting.player2_assigned = false;

    h.poller.prime(&waiting);
    h.transport
        .push_game_state(Ok(snapshot_of(&Game::new(), STATUS_ACTIVE)));

    h.poller.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = drain(&mut h.events);
    assert!(matches!(events.as_slice(), [PollEvent::OpponentJoined(_)]));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers() {
    let mut h = harness(Side::One);
    let game = after(&[(Side::One, Position::Center)]);
    h.poller.prime(&snapshot_of(&game, STATUS_ACTIVE));
    h.transport
        .push_game_state(Err(TransportError::Network("reset".into())));
    h.transport
        .push_game_state(Ok(snapshot_of(&game, STATUS_ACTIVE)));

    h.poller.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.poller.consecutive_failures(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.poller.consecutive_failures(), 0);
    assert!(h.poller.is_polling());

    let events = drain(&mut h.events);
    assert!(matches!(
        events.as_slice(),
        [PollEvent::TransientError {
            consecutive_failures: 1,
            ..
        }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_seeded_local_move_is_not_an_opponent_move() {
    let mut h = harness(Side::One);
    let empty = Game::new();
    let mine = after(&[(Side::One, Position::Center)]);

    h.poller.prime(&snapshot_of(&empty, STATUS_ACTIVE));
    h.poller.seed_move_count(1);
    let delta = h.poller.reconcile(&snapshot_of(&mine, STATUS_ACTIVE)).unwrap();
    assert_eq!(delta, Delta::Updated);
    assert!(matches!(
        drain(&mut h.events).as_slice(),
        [PollEvent::Updated(_)]
    ));

    // A late poll of the pre-move state is stale.
    let delta = h.poller.reconcile(&snapshot_of(&empty, STATUS_ACTIVE)).unwrap();
    assert_eq!(delta, Delta::Stale);

    // Seeding never moves backwards.
    h.poller.seed_move_count(0);
    assert_eq!(h.poller.last_move_count(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_suspend_pauses_ticks() {
    let h = harness(Side::One);
    let game = after(&[(Side::One, Position::Center)]);
    h.poller.prime(&snapshot_of(&game, STATUS_ACTIVE));
    h.transport
        .push_game_state(Ok(snapshot_of(&game, STATUS_ACTIVE)));

    h.poller.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.poller.suspend();
    let calls = h.transport.calls(Endpoint::GameState);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.transport.calls(Endpoint::GameState), calls);
    assert!(h.poller.is_polling());

    h.poller.resume();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.calls(Endpoint::GameState), calls + 1);
}
