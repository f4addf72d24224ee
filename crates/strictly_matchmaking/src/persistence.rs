//! Restart-safe snapshot of an in-flight queue session, plus outcome statistics.
//!
//! The snapshot lives under one key in [`QUEUE_SCOPE`]; statistics live in
//! [`STATS_SCOPE`] so clearing the snapshot never touches them. The owning
//! [`QueueSession`](crate::QueueSession) is the only writer.

use crate::queue::QueueState;
use crate::store::{KeyValueStore, StoreError};
use derive_getters::Getters;
use derive_new::new;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::{debug, info, instrument, warn};

/// Scope holding the queue snapshot.
pub const QUEUE_SCOPE: &str = "multiplayer_queue_persistence";
/// Scope holding queue statistics.
pub const STATS_SCOPE: &str = "multiplayer_queue_persistence_stats";
/// Snapshot format version. Snapshots with any other version are refused.
pub const SCHEMA_VERSION: &str = "1.0";
/// Statistics entries kept in the history.
pub const STATS_HISTORY_LIMIT: usize = 50;

const SNAPSHOT_KEY: &str = "queue_snapshot";
const LATEST_KEY: &str = "latest_session";
const HISTORY_KEY: &str = "history";

/// Wall-clock milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Wall clock that advances with tokio's clock, so paused-time tests see
/// dwell and age grow as timers fire.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_ms: i64,
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Clock reading `anchor_ms` now.
    pub fn starting_at(anchor_ms: i64) -> Self {
        Self {
            anchor_ms,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.anchor_ms + self.origin.elapsed().as_millis() as i64
    }
}

/// Clock moved by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock reading `now_ms`.
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    /// Sets the reading.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Moves the reading forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Thresholds for writing and accepting snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct PersistencePolicy {
    /// Minimum time in queue before the first write.
    pub min_dwell: Duration,
    /// Snapshots last saved longer ago than this are refused.
    pub max_age: Duration,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            min_dwell: Duration::from_millis(5000),
            max_age: Duration::from_millis(600_000),
        }
    }
}

/// Live queue progress handed to [`QueuePersistence::save`].
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct QueueProgress {
    /// Current queue state.
    pub state: QueueState,
    /// Local player id.
    pub player_id: String,
    /// Local device id.
    pub device_id: String,
    /// Epoch ms when the player entered the queue.
    pub queue_started_at: i64,
    /// Queue time carried over from earlier sessions.
    pub accumulated_queue_time: i64,
    /// Join attempts so far.
    pub attempt_count: u32,
    /// Last reported queue size.
    pub last_known_queue_position: Option<u32>,
}

/// Stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    state: String,
    player_id: String,
    device_id: String,
    queue_started_at: i64,
    accumulated_queue_time: i64,
    attempt_count: u32,
    last_known_queue_position: Option<u32>,
    session_id: String,
    saved_at: i64,
    schema_version: String,
}

impl QueueSnapshot {
    /// Milliseconds since the player entered the queue.
    pub fn time_in_queue(&self, now_ms: i64) -> i64 {
        (now_ms - self.queue_started_at).max(0)
    }
}

/// Lenient view used during validation so every defect gets a reason.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoredSnapshot {
    state: Option<String>,
    player_id: Option<String>,
    device_id: Option<String>,
    queue_started_at: i64,
    accumulated_queue_time: i64,
    attempt_count: u32,
    last_known_queue_position: Option<u32>,
    session_id: Option<String>,
    saved_at: i64,
    schema_version: Option<String>,
}

/// Result of [`QueuePersistence::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing stored.
    Absent,
    /// Something stored but refused.
    Invalid(String),
    /// A restorable snapshot.
    Valid(QueueSnapshot),
}

impl LoadOutcome {
    /// The snapshot, if valid.
    pub fn snapshot(&self) -> Option<&QueueSnapshot> {
        match self {
            LoadOutcome::Valid(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    /// True for a restorable snapshot.
    pub fn is_valid(&self) -> bool {
        matches!(self, LoadOutcome::Valid(_))
    }
}

/// Result of [`QueuePersistence::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SaveOutcome {
    /// Snapshot written.
    Written,
    /// Not in queue; nothing written.
    NotInQueue,
    /// In queue for less than the minimum dwell; nothing written.
    TooShort,
}

/// Why a queue session ended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Paired with an opponent.
    MatchFound,
    /// The player left.
    Left,
    /// The queue timeout expired.
    Timeout,
    /// The join request failed.
    JoinFailed,
    /// The match was refused as a state conflict.
    Conflict,
    /// Torn down by cleanup.
    Cleanup,
}

/// One terminal queue outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatistics {
    timestamp: i64,
    total_wait_time: i64,
    total_attempts: u32,
    match_found: bool,
    end_reason: EndReason,
    session_id: String,
}

impl fmt::Display for QueueStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {}s ({} attempts, match found: {})",
            self.end_reason,
            self.total_wait_time / 1000,
            self.total_attempts,
            self.match_found
        )
    }
}

/// Snapshot and statistics writer for one process launch.
#[derive(Debug, Clone)]
pub struct QueuePersistence {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policy: PersistencePolicy,
    session_id: String,
}

impl QueuePersistence {
    /// Creates a writer with a fresh launch id.
    #[instrument(skip_all)]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        policy: PersistencePolicy,
    ) -> Self {
        let session_id = format!(
            "SESSION_{}_{}",
            clock.now_ms(),
            rand::random::<u16>() % 1000
        );
        debug!(session_id = %session_id, "Persistence initialised");
        Self {
            store,
            clock,
            policy,
            session_id,
        }
    }

    /// Launch id stamped into every snapshot and statistics entry.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Thresholds in force.
    pub fn policy(&self) -> PersistencePolicy {
        self.policy
    }

    /// Current wall-clock reading.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Writes a snapshot when `progress` is InQueue and past the dwell threshold.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    #[instrument(skip(self, progress), fields(state = %progress.state, player_id = %progress.player_id))]
    pub fn save(&self, progress: &QueueProgress) -> Result<SaveOutcome, StoreError> {
        if progress.state != QueueState::InQueue {
            debug!("Not in queue; snapshot not written");
            return Ok(SaveOutcome::NotInQueue);
        }
        let now = self.clock.now_ms();
        let dwell = now - progress.queue_started_at;
        if dwell < self.policy.min_dwell.as_millis() as i64 {
            debug!(dwell_ms = dwell, "Queue time too short to persist");
            return Ok(SaveOutcome::TooShort);
        }

        let snapshot = QueueSnapshot {
            state: progress.state.to_string(),
            player_id: progress.player_id.clone(),
            device_id: progress.device_id.clone(),
            queue_started_at: progress.queue_started_at,
            accumulated_queue_time: progress.accumulated_queue_time,
            attempt_count: progress.attempt_count,
            last_known_queue_position: progress.last_known_queue_position,
            session_id: self.session_id.clone(),
            saved_at: now,
            schema_version: SCHEMA_VERSION.to_string(),
        };
        self.write_snapshot(&snapshot)?;
        debug!(dwell_ms = dwell, "Queue snapshot saved");
        Ok(SaveOutcome::Written)
    }

    /// Reads and validates the stored snapshot.
    ///
    /// Checks run in a fixed order and the first failure names the reason.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only if the store itself fails.
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<LoadOutcome, StoreError> {
        let Some(raw) = self.store.get(QUEUE_SCOPE, SNAPSHOT_KEY)? else {
            debug!("No saved queue state");
            return Ok(LoadOutcome::Absent);
        };
        let outcome = self.validate(&raw);
        match &outcome {
            LoadOutcome::Valid(snapshot) => info!(
                player_id = %snapshot.player_id,
                position = ?snapshot.last_known_queue_position,
                "Loaded valid queue snapshot"
            ),
            LoadOutcome::Invalid(reason) => warn!(%reason, "Queue snapshot refused"),
            LoadOutcome::Absent => {}
        }
        Ok(outcome)
    }

    fn validate(&self, raw: &str) -> LoadOutcome {
        let stored: StoredSnapshot = match serde_json::from_str(raw) {
            Ok(stored) => stored,
            Err(e) => return LoadOutcome::Invalid(format!("Corrupted snapshot: {}", e)),
        };

        let state_text = stored.state.unwrap_or_default();
        let Ok(state) = QueueState::from_str(&state_text) else {
            return LoadOutcome::Invalid(format!("Invalid queue state: {}", state_text));
        };

        let version = stored.schema_version.unwrap_or_else(|| "0.0".to_string());
        if version != SCHEMA_VERSION {
            return LoadOutcome::Invalid(format!(
                "Schema version mismatch: {} vs {}",
                version, SCHEMA_VERSION
            ));
        }

        let (Some(player_id), Some(device_id)) = (
            stored.player_id.filter(|id| !id.is_empty()),
            stored.device_id.filter(|id| !id.is_empty()),
        ) else {
            return LoadOutcome::Invalid("Missing player or device ID".to_string());
        };

        if stored.queue_started_at <= 0 {
            return LoadOutcome::Invalid("Invalid queue start time".to_string());
        }

        let age = self.clock.now_ms() - stored.saved_at;
        if age > self.policy.max_age.as_millis() as i64 {
            return LoadOutcome::Invalid(format!("Saved data too old: {}ms", age));
        }

        if state != QueueState::InQueue {
            return LoadOutcome::Invalid(format!(
                "Only {} state can be restored",
                QueueState::InQueue
            ));
        }

        LoadOutcome::Valid(QueueSnapshot {
            state: state.to_string(),
            player_id,
            device_id,
            queue_started_at: stored.queue_started_at,
            accumulated_queue_time: stored.accumulated_queue_time,
            attempt_count: stored.attempt_count,
            last_known_queue_position: stored.last_known_queue_position,
            session_id: stored.session_id.unwrap_or_default(),
            saved_at: stored.saved_at,
            schema_version: version,
        })
    }

    /// Removes the snapshot. Statistics are kept.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(QUEUE_SCOPE, SNAPSHOT_KEY)?;
        debug!("Queue snapshot cleared");
        Ok(())
    }

    /// True if a snapshot (valid or not) is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn has_snapshot(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(QUEUE_SCOPE, SNAPSHOT_KEY)?.is_some())
    }

    /// Records the latest queue size and refreshes `savedAt`. No-op without a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails.
    #[instrument(skip(self))]
    pub fn update_position(&self, position: u32) -> Result<(), StoreError> {
        self.modify(|snapshot| snapshot.last_known_queue_position = Some(position))?;
        debug!("Queue position updated");
        Ok(())
    }

    fn modify(&self, change: impl FnOnce(&mut QueueSnapshot)) -> Result<(), StoreError> {
        let Some(raw) = self.store.get(QUEUE_SCOPE, SNAPSHOT_KEY)? else {
            return Ok(());
        };
        let mut snapshot: QueueSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Stored snapshot unreadable; not updating");
                return Ok(());
            }
        };
        change(&mut snapshot);
        snapshot.saved_at = self.clock.now_ms();
        self.write_snapshot(&snapshot)
    }

    fn write_snapshot(&self, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string(snapshot)?;
        self.store.set(QUEUE_SCOPE, SNAPSHOT_KEY, &json)
    }

    /// Appends one terminal outcome to the statistics.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails.
    #[instrument(skip(self))]
    pub fn record_outcome(
        &self,
        total_wait_ms: i64,
        total_attempts: u32,
        match_found: bool,
        end_reason: EndReason,
    ) -> Result<QueueStatistics, StoreError> {
        let entry = QueueStatistics {
            timestamp: self.clock.now_ms(),
            total_wait_time: total_wait_ms.max(0),
            total_attempts,
            match_found,
            end_reason,
            session_id: self.session_id.clone(),
        };

        let mut history = self.history()?;
        history.push(entry.clone());
        if history.len() > STATS_HISTORY_LIMIT {
            let excess = history.len() - STATS_HISTORY_LIMIT;
            history.drain(..excess);
        }

        self.store
            .set(STATS_SCOPE, LATEST_KEY, &serde_json::to_string(&entry)?)?;
        self.store
            .set(STATS_SCOPE, HISTORY_KEY, &serde_json::to_string(&history)?)?;
        info!(%entry, "Queue statistics saved");
        Ok(entry)
    }

    /// Most recent outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails or the entry is corrupt.
    pub fn statistics(&self) -> Result<Option<QueueStatistics>, StoreError> {
        match self.store.get(STATS_SCOPE, LATEST_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Up to [`STATS_HISTORY_LIMIT`] outcomes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails or the history is corrupt.
    pub fn history(&self) -> Result<Vec<QueueStatistics>, StoreError> {
        match self.store.get(STATS_SCOPE, HISTORY_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// True if a valid snapshot was written by a different launch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails.
    #[instrument(skip(self))]
    pub fn was_restored_after_restart(&self) -> Result<bool, StoreError> {
        let restored = self
            .load()?
            .snapshot()
            .is_some_and(|s| !s.session_id.is_empty() && s.session_id != self.session_id);
        if restored {
            info!(current = %self.session_id, "Snapshot belongs to an earlier launch");
        }
        Ok(restored)
    }
}
