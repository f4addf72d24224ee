//! Networked matchmaking and play for three-piece morris.
//!
//! Two clients are paired by a server-side queue and then kept in sync by
//! polling the server's authoritative game snapshot. The server is the only
//! source of truth; local state is rebuilt from what it returns.
//!
//! # Architecture
//!
//! - [`GameTransport`] is the seam to the server; [`HttpTransport`] speaks
//!   its REST API and [`testing::ScriptedTransport`] replays canned replies
//! - [`ResilientRpcClient`] wraps every call with retry, backoff and a
//!   shared [`CircuitBreaker`]
//! - [`QueueSession`] drives the Idle → Joining → InQueue → MatchFound →
//!   InGame state machine
//! - [`SessionPoller`] reconciles the game with the server snapshot
//! - [`QueuePersistence`] saves queue progress so it survives a restart, on
//!   top of a [`KeyValueStore`]
//! - [`GameClient`] ties them together with the rule engine
//!
//! Components are cheap-to-clone handles that report through unbounded
//! `tokio::sync::mpsc` channels.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod client;
mod config;
mod convert;
mod http;
mod persistence;
mod poller;
mod queue;
mod rpc;
mod store;
pub mod testing;
mod timers;
mod transport;
mod wire;

pub use client::{ClientError, GameClient, MoveReceipt};
pub use config::{ClientConfig, ConfigError};
pub use convert::{GameSession, MatchConflict, SnapshotError};
pub use http::HttpTransport;
pub use persistence::{
    Clock, EndReason, LoadOutcome, ManualClock, PersistencePolicy, QUEUE_SCOPE, QueuePersistence,
    QueueProgress, QueueSnapshot, QueueStatistics, SCHEMA_VERSION, STATS_HISTORY_LIMIT,
    STATS_SCOPE, SaveOutcome, SystemClock, TokioClock,
};
pub use poller::{Delta, PollEvent, PollerTimings, SessionPoller};
pub use queue::{
    DISCONNECT_THRESHOLD, MAX_IDENTITY_LEN, MatchDetails, QueueError, QueueEvent, QueueInfo,
    QueueSession, QueueState, QueueTimings, estimate_wait_secs, validate_identity,
};
pub use rpc::{
    AttemptError, BREAKER_RESET_TIMEOUT, BREAKER_THRESHOLD, BreakerState, CircuitBreaker,
    ResilientRpcClient, RetryContext, RetryPolicy, RpcError,
};
pub use store::{KeyValueStore, KvEntry, MemoryStore, NewKvEntry, SqliteStore, StoreError};
pub use timers::{TimerHandle, TimerSet};
pub use transport::{GameTransport, TransportError};
pub use wire::{
    MatchStatus, MatchmakingResponse, MoveRequest, PlayerMove, ServerSnapshot, STATUS_ACTIVE,
    STATUS_FINISHED, STATUS_WAITING,
};
