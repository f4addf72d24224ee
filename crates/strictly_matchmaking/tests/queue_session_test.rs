//! Tests for the matchmaking queue state machine.

use std::sync::Arc;
use std::time::Duration;

use strictly_matchmaking::testing::{Endpoint, ScriptedTransport};
use strictly_matchmaking::{
    EndReason, ManualClock, MatchStatus, MatchmakingResponse, MemoryStore, PersistencePolicy,
    QueueError, QueueEvent, QueuePersistence, QueueProgress, QueueSession, QueueState,
    QueueTimings, ResilientRpcClient, STATUS_ACTIVE, STATUS_FINISHED, ServerSnapshot, TokioClock,
    TransportError,
};
use strictly_morris::Side;
use tokio::sync::mpsc;

const T0: i64 = 1_700_000_000_000;

struct Harness {
    transport: Arc<ScriptedTransport>,
    queue: QueueSession,
    events: mpsc::UnboundedReceiver<QueueEvent>,
}

fn harness(store: Arc<MemoryStore>, now_ms: i64, timings: QueueTimings) -> Harness {
    let transport = Arc::new(ScriptedTransport::new());
    let persistence = QueuePersistence::new(
        store,
        Arc::new(TokioClock::starting_at(now_ms)),
        PersistencePolicy::default(),
    );
    let (tx, events) = mpsc::unbounded_channel();
    let queue = QueueSession::new(
        transport.clone(),
        ResilientRpcClient::new(),
        persistence,
        timings,
        tx,
    );
    Harness {
        transport,
        queue,
        events,
    }
}

fn default_harness() -> Harness {
    harness(Arc::new(MemoryStore::new()), T0, QueueTimings::default())
}

fn active_snapshot(game_id: &str, player1: &str, player2: &str) -> ServerSnapshot {
    ServerSnapshot {
        game_id: Some(game_id.to_string()),
        player1_id: Some(player1.to_string()),
        player2_id: Some(player2.to_string()),
        game_status: STATUS_ACTIVE.to_string(),
        game_started: true,
        player1_assigned: true,
        player2_assigned: true,
        ..ServerSnapshot::default()
    }
}

fn match_found(
    game_id: &str,
    player_id: &str,
    number: u8,
    state: Option<ServerSnapshot>,
) -> MatchmakingResponse {
    MatchmakingResponse {
        game_id: Some(game_id.to_string()),
        player_id: Some(player_id.to_string()),
        player_number: Some(number),
        game_state: state,
        ..MatchmakingResponse::with_status(MatchStatus::MatchFound)
    }
}

fn waiting() -> MatchmakingResponse {
    MatchmakingResponse::with_status(MatchStatus::Waiting)
}

fn drain(events: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn errors(events: &[QueueEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Error(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_waiting_then_match_found_clears_persistence() {
    let mut h = default_harness();
    h.transport.push_find(Ok(waiting()));
    h.transport.push_queue_size(Ok(3));
    for _ in 0..3 {
        h.transport.push_status(Ok(waiting()));
    }
    h.transport.push_status(Ok(match_found(
        "g1",
        "alice",
        1,
        Some(active_snapshot("g1", "alice", "bob")),
    )));

    h.queue.join("alice", "phone-1").unwrap();
    assert_eq!(h.queue.state(), QueueState::Joining);

    // Checks at 0s, 3s and 6s all answer waiting; the 6s one is past the dwell.
    tokio::time::sleep(Duration::from_millis(7000)).await;
    assert_eq!(h.queue.state(), QueueState::InQueue);
    assert!(h.queue.persistence().has_snapshot().unwrap());
    let stored = h.queue.persistence().load().unwrap();
    assert_eq!(
        stored.snapshot().unwrap().last_known_queue_position(),
        &Some(3)
    );

    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(h.queue.state(), QueueState::MatchFound);
    assert!(!h.queue.persistence().has_snapshot().unwrap());

    let events = drain(&mut h.events);
    let details = events
        .iter()
        .find_map(|e| match e {
            QueueEvent::MatchFound(details) => Some(details.clone()),
            _ => None,
        })
        .expect("match found event");
    assert_eq!(details.session().id(), "g1");
    assert_eq!(*details.local_side(), Side::One);
    assert!(details.is_player1());
    assert!(events.iter().any(|e| matches!(
        e,
        QueueEvent::PositionUpdated {
            position: 3,
            eta_secs: 60
        }
    )));

    let stats = h.queue.persistence().statistics().unwrap().unwrap();
    assert!(*stats.match_found());
    assert_eq!(*stats.end_reason(), EndReason::MatchFound);

    let acknowledged = h.queue.acknowledge_match().unwrap();
    assert_eq!(acknowledged, details);
    assert_eq!(h.queue.state(), QueueState::InGame);
}

#[tokio::test(start_paused = true)]
async fn test_join_guards_leave_state_untouched() {
    let mut h = default_harness();
    assert!(matches!(
        h.queue.join(" alice", "phone-1"),
        Err(QueueError::InvalidIdentity { .. })
    ));
    assert!(matches!(
        h.queue.join("alice", ""),
        Err(QueueError::InvalidIdentity { .. })
    ));
    assert_eq!(h.queue.state(), QueueState::Idle);
    assert!(drain(&mut h.events).is_empty());

    h.transport.push_find(Ok(waiting()));
    h.queue.join("alice", "phone-1").unwrap();
    assert_eq!(
        h.queue.join("alice", "phone-1"),
        Err(QueueError::NotIdle(QueueState::Joining))
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.queue.join("alice", "phone-1"),
        Err(QueueError::NotIdle(QueueState::InQueue))
    );
    assert_eq!(h.transport.calls(Endpoint::FindMatch), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_failure_returns_to_idle() {
    let mut h = default_harness();
    h.transport.push_find(Ok(MatchmakingResponse {
        message: Some("Server full".to_string()),
        ..MatchmakingResponse::with_status(MatchStatus::Error)
    }));

    h.queue.join("alice", "phone-1").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.queue.state(), QueueState::Idle);
    let events = drain(&mut h.events);
    assert_eq!(
        errors(&events),
        vec!["Failed to join matchmaking: Server full".to_string()]
    );
    let stats = h.queue.persistence().statistics().unwrap().unwrap();
    assert_eq!(*stats.end_reason(), EndReason::JoinFailed);
}

#[tokio::test(start_paused = true)]
async fn test_join_retries_network_errors() {
    let h = default_harness();
    h.transport
        .push_find(Err(TransportError::Network("connection reset".into())));
    h.transport.push_find(Ok(waiting()));

    h.queue.join("alice", "phone-1").unwrap();
    // First attempt fails, the retry follows after 1s.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(h.transport.calls(Endpoint::FindMatch), 2);
    assert_eq!(h.queue.state(), QueueState::InQueue);
}

#[tokio::test(start_paused = true)]
async fn test_leave_succeeds_when_cancel_fails() {
    let mut h = default_harness();
    h.transport.push_find(Ok(waiting()));
    h.transport
        .push_cancel(Err(TransportError::Network("offline".into())));

    h.queue.join("alice", "phone-1").unwrap();
    tokio::time::sleep(Duration::from_millis(6500)).await;
    assert!(h.queue.persistence().has_snapshot().unwrap());

    h.queue.leave_queue().await.unwrap();

    assert_eq!(h.queue.state(), QueueState::Idle);
    assert!(!h.queue.persistence().has_snapshot().unwrap());
    assert_eq!(h.transport.calls(Endpoint::Cancel), 2);
    let stats = h.queue.persistence().statistics().unwrap().unwrap();
    assert_eq!(*stats.end_reason(), EndReason::Left);

    // No status checks after leaving.
    let checks = h.transport.calls(Endpoint::Status);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.calls(Endpoint::Status), checks);
    assert!(errors(&drain(&mut h.events)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_leave_when_idle_is_noop() {
    let h = default_harness();
    h.queue.leave_queue().await.unwrap();
    assert_eq!(h.queue.state(), QueueState::Idle);
    assert_eq!(h.transport.calls(Endpoint::Cancel), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_leaves() {
    let timings = QueueTimings::new(
        Duration::from_secs(3),
        Duration::from_secs(15),
        Duration::from_secs(1),
        Duration::from_secs(20),
    );
    let mut h = harness(Arc::new(MemoryStore::new()), T0, timings);
    h.transport.push_find(Ok(waiting()));

    h.queue.join("alice", "phone-1").unwrap();
    tokio::time::sleep(Duration::from_secs(21)).await;

    assert_eq!(h.queue.state(), QueueState::Idle);
    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(e, QueueEvent::Timeout)));
    assert_eq!(h.transport.calls(Endpoint::Cancel), 1);
    assert!(!h.queue.persistence().has_snapshot().unwrap());
    let stats = h.queue.persistence().statistics().unwrap().unwrap();
    assert_eq!(*stats.end_reason(), EndReason::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_self_match_is_refused() {
    let mut h = default_harness();
    h.transport.push_find(Ok(match_found(
        "g1",
        "alice",
        1,
        Some(active_snapshot("g1", "alice", "alice")),
    )));

    h.queue.join("alice", "phone-1").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.queue.state(), QueueState::Idle);
    assert_eq!(errors(&drain(&mut h.events)).len(), 1);
    let stats = h.queue.persistence().statistics().unwrap().unwrap();
    assert_eq!(*stats.end_reason(), EndReason::Conflict);
    assert!(!*stats.match_found());
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_match_data_is_refused() {
    let mut h = default_harness();
    h.transport.push_find(Ok(MatchmakingResponse {
        game_id: Some("g1".into()),
        ..MatchmakingResponse::with_status(MatchStatus::MatchFound)
    }));

    h.queue.join("alice", "phone-1").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.queue.state(), QueueState::Idle);
    assert_eq!(
        errors(&drain(&mut h.events)),
        vec!["Incomplete match data".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_match_without_snapshot_fetches_state() {
    let h = default_harness();
    h.transport.push_find(Ok(match_found("g7", "bob", 2, None)));
    h.transport
        .push_game_state(Ok(active_snapshot("g7", "alice", "bob")));

    h.queue.join("bob", "tablet-2").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.queue.state(), QueueState::MatchFound);
    assert_eq!(h.transport.calls(Endpoint::GameState), 1);
    let details = h.queue.acknowledge_match().unwrap();
    assert_eq!(*details.local_side(), Side::Two);
}

#[tokio::test(start_paused = true)]
async fn test_finished_fallback_game_is_refused() {
    let mut h = default_harness();
    h.transport.push_find(Ok(match_found("g7", "bob", 2, None)));
    h.transport.push_game_state(Ok(ServerSnapshot {
        game_status: STATUS_FINISHED.to_string(),
        ..active_snapshot("g7", "alice", "bob")
    }));

    h.queue.join("bob", "tablet-2").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.queue.state(), QueueState::Idle);
    assert_eq!(
        errors(&drain(&mut h.events)),
        vec!["Game not available".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_status_failures_report_disconnected() {
    let h = default_harness();
    h.transport.push_find(Ok(waiting()));
    h.transport
        .push_status(Err(TransportError::Network("timeout".into())));
    h.transport
        .push_queue_size(Err(TransportError::Network("timeout".into())));

    h.queue.join("alice", "phone-1").unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let info = h.queue.info();
    assert_eq!(*info.state(), QueueState::InQueue);
    assert!(!*info.is_connected());
    assert_eq!(info.status(), "Connection issues - retrying...");
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_persistence() {
    let store = Arc::new(MemoryStore::new());
    let earlier_clock = Arc::new(ManualClock::new(T0 + 30_000));
    let earlier = QueuePersistence::new(
        store.clone(),
        earlier_clock,
        PersistencePolicy::default(),
    );
    earlier
        .save(&QueueProgress::new(
            QueueState::InQueue,
            "alice".into(),
            "phone-1".into(),
            T0,
            30_000,
            2,
            Some(4),
        ))
        .unwrap();

    let h = harness(store, T0 + 60_000, QueueTimings::default());
    h.transport.push_status(Ok(waiting()));
    assert!(h.queue.persistence().was_restored_after_restart().unwrap());

    assert!(h.queue.resume_from_persistence().unwrap());
    assert_eq!(h.queue.state(), QueueState::InQueue);
    assert_eq!(h.queue.player_id().as_deref(), Some("alice"));
    assert!(h.queue.time_in_queue() >= Duration::from_secs(60));
    assert_eq!(h.transport.calls(Endpoint::FindMatch), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.transport.calls(Endpoint::Status) >= 1);
    assert_eq!(
        h.queue.resume_from_persistence(),
        Err(QueueError::NotIdle(QueueState::InQueue))
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_snapshot_is_not_resumed() {
    let store = Arc::new(MemoryStore::new());
    let earlier = QueuePersistence::new(
        store.clone(),
        Arc::new(ManualClock::new(T0 + 30_000)),
        PersistencePolicy::default(),
    );
    earlier
        .save(&QueueProgress::new(
            QueueState::InQueue,
            "alice".into(),
            "phone-1".into(),
            T0,
            30_000,
            1,
            None,
        ))
        .unwrap();

    // Saved 601 seconds ago.
    let h = harness(store, T0 + 30_000 + 601_000, QueueTimings::default());
    assert!(!h.queue.resume_from_persistence().unwrap());
    assert_eq!(h.queue.state(), QueueState::Idle);
    assert!(!h.queue.persistence().has_snapshot().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_returns_to_idle() {
    let h = default_harness();
    h.transport.push_find(Ok(waiting()));
    h.queue.join("alice", "phone-1").unwrap();
    tokio::time::sleep(Duration::from_millis(6500)).await;

    assert_eq!(h.queue.cleanup(), QueueState::Idle);
    assert!(!h.queue.persistence().has_snapshot().unwrap());
    let stats = h.queue.persistence().statistics().unwrap().unwrap();
    assert_eq!(*stats.end_reason(), EndReason::Cleanup);

    let checks = h.transport.calls(Endpoint::Status);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.calls(Endpoint::Status), checks);
}

#[tokio::test(start_paused = true)]
async fn test_suspend_pauses_status_checks() {
    let h = default_harness();
    h.transport.push_find(Ok(waiting()));
    h.queue.join("alice", "phone-1").unwrap();
    tokio::time::sleep(Duration::from_secs(7)).await;

    h.queue.suspend();
    let checks = h.transport.calls(Endpoint::Status);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.calls(Endpoint::Status), checks);
    assert_eq!(h.queue.state(), QueueState::InQueue);
    assert!(h.queue.persistence().has_snapshot().unwrap());

    h.queue.resume();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.calls(Endpoint::Status), checks + 1);
}

#[tokio::test(start_paused = true)]
async fn test_suspend_while_joining_defers_monitoring() {
    let mut h = default_harness();
    h.transport.set_latency(Duration::from_secs(1));
    h.transport.push_find(Ok(waiting()));
    h.queue.join("alice", "phone-1").unwrap();
    h.queue.suspend();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.queue.state(), QueueState::InQueue);
    assert_eq!(h.transport.calls(Endpoint::QueueSize), 0);
    assert_eq!(h.transport.calls(Endpoint::Status), 0);

    // Joining and InQueue only; no elapsed-time ticks while suspended.
    let states: Vec<QueueState> = drain(&mut h.events)
        .iter()
        .filter_map(|e| match e {
            QueueEvent::StateChanged(info) => Some(*info.state()),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![QueueState::Joining, QueueState::InQueue]);

    h.queue.resume();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.calls(Endpoint::QueueSize), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.transport.calls(Endpoint::Status), 1);
}
