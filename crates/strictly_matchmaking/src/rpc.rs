//! Retry with exponential backoff, guarded by a circuit breaker.
//!
//! [`ResilientRpcClient::execute`] runs an operation until it succeeds, fails
//! for good, or runs out of attempts. Each operation id may have at most one
//! attempt chain outstanding, and every pending chain can be cancelled at once.
//!
//! The breaker is shared by all operations on one client. Outcomes are always
//! recorded; only policies with `use_breaker` consult it before an attempt.

use crate::transport::TransportError;
use derive_setters::Setters;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use strum::Display;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Failures in a row that open the breaker.
pub const BREAKER_THRESHOLD: u32 = 5;

/// Time the breaker stays open before allowing a trial call.
pub const BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Setters)]
#[setters(prefix = "with_")]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
    /// Whether to fail fast while the breaker is open.
    pub use_breaker: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            use_breaker: true,
        }
    }
}

impl RetryPolicy {
    /// Two quick tries, no breaker. For cheap, latency-sensitive calls.
    pub fn quick() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
            use_breaker: false,
        }
    }

    /// Five patient tries with a breaker.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(2000),
            multiplier: 2.5,
            max_delay: Duration::from_secs(60),
            use_breaker: true,
        }
    }

    /// Wait after the `attempt`-th failure: `min(initial * multiplier^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

/// Counts failures and fails fast once too many pile up.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    threshold: u32,
    reset_timeout: Duration,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            threshold,
            reset_timeout,
            trial_in_flight: false,
        }
    }

    /// Current state, moving Open to HalfOpen once the reset timeout passed.
    pub fn state(&mut self, now: Instant) -> BreakerState {
        if self.state == BreakerState::Open
            && self
                .last_failure_at
                .is_some_and(|at| now.duration_since(at) >= self.reset_timeout)
        {
            info!("Circuit breaker moved to half-open");
            self.state = BreakerState::HalfOpen;
            self.trial_in_flight = false;
        }
        self.state
    }

    /// Failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Asks to make a call. Returns `false` to fail fast.
    ///
    /// In HalfOpen exactly one caller gets through until that call resolves.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state(now) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen if self.trial_in_flight => false,
            BreakerState::HalfOpen => {
                self.trial_in_flight = true;
                true
            }
        }
    }

    /// Resets the counter and closes.
    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("Circuit breaker closed");
        }
        self.failure_count = 0;
        self.state = BreakerState::Closed;
        self.trial_in_flight = false;
    }

    /// Counts a failure, opening on threshold or on any HalfOpen failure.
    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure_at = Some(now);
        self.trial_in_flight = false;

        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open;
            warn!("Circuit breaker opened after half-open failure");
        } else if self.state == BreakerState::Closed && self.failure_count >= self.threshold {
            self.state = BreakerState::Open;
            warn!(failures = self.failure_count, "Circuit breaker opened");
        }
    }

    /// Frees the HalfOpen trial slot without recording an outcome.
    fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BREAKER_THRESHOLD, BREAKER_RESET_TIMEOUT)
    }
}

/// Passed to each attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// Operation id the attempt belongs to.
    pub operation_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Attempts allowed by the policy.
    pub max_attempts: u32,
    /// Wait before the next attempt if this one fails.
    pub next_delay: Duration,
}

impl RetryContext {
    /// True on the final allowed attempt.
    pub fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// How a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AttemptError {
    /// Worth trying again.
    #[display("{}", _0)]
    Retryable(String),
    /// Will fail the same way again.
    #[display("{}", _0)]
    Fatal(String),
    /// The server answered and said no; the service itself is healthy.
    #[display("{}", _0)]
    Rejected(String),
}

impl std::error::Error for AttemptError {}

impl From<TransportError> for AttemptError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(msg) => AttemptError::Rejected(msg),
            other if other.is_retryable() => AttemptError::Retryable(other.to_string()),
            other => AttemptError::Fatal(other.to_string()),
        }
    }
}

/// Final failure of an [`ResilientRpcClient::execute`] call.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum RpcError {
    /// The breaker is open; the operation was not invoked.
    #[display("Service temporarily unavailable (circuit breaker open)")]
    ServiceUnavailable,

    /// Every allowed attempt failed.
    #[display("Failed after {} attempts: {}", attempts, last)]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last failure message.
        last: String,
    },

    /// A non-retryable failure.
    #[display("Non-retryable error: {}", _0)]
    Fatal(String),

    /// The server refused the request.
    #[display("{}", _0)]
    Rejected(String),

    /// The operation id already has an outstanding attempt.
    #[display("Operation {} already in progress", _0)]
    Busy(String),

    /// The chain was cancelled before it finished.
    #[display("Operation {} cancelled", _0)]
    Cancelled(String),
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// True for failures that should halt the calling subsystem.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            RpcError::ServiceUnavailable | RpcError::Exhausted { .. } | RpcError::Fatal(_)
        )
    }
}

#[derive(Debug)]
struct InFlight {
    ticket: u64,
    abort: AbortHandle,
}

#[derive(Debug, Default)]
struct RpcInner {
    breaker: CircuitBreaker,
    in_flight: HashMap<String, InFlight>,
    next_ticket: u64,
}

type Shared = Arc<Mutex<RpcInner>>;

fn lock(inner: &Shared) -> std::sync::MutexGuard<'_, RpcInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome recorder for one attempt. When it owns the HalfOpen trial slot it
/// frees the slot if the attempt is dropped unresolved.
struct BreakerPermit {
    inner: Shared,
    holds_trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    fn success(mut self) {
        self.resolved = true;
        lock(&self.inner).breaker.record_success();
    }

    fn failure(mut self) {
        self.resolved = true;
        lock(&self.inner).breaker.record_failure(Instant::now());
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.holds_trial && !self.resolved {
            lock(&self.inner).breaker.release_trial();
        }
    }
}

/// Retrying RPC executor shared by the queue, poller and game client.
#[derive(Debug, Clone, Default)]
pub struct ResilientRpcClient {
    inner: Shared,
}

impl ResilientRpcClient {
    /// Creates a client with a default breaker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client with a custom breaker.
    pub fn with_breaker(breaker: CircuitBreaker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RpcInner {
                breaker,
                ..RpcInner::default()
            })),
        }
    }

    /// Breaker state right now.
    pub fn breaker_state(&self) -> BreakerState {
        lock(&self.inner).breaker.state(Instant::now())
    }

    /// Consecutive failures seen by the breaker.
    pub fn breaker_failures(&self) -> u32 {
        lock(&self.inner).breaker.failure_count()
    }

    /// Operation ids with an attempt chain still running.
    pub fn pending_operations(&self) -> Vec<String> {
        let inner = lock(&self.inner);
        let mut ids: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| !f.abort.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Cancels the chain for `operation_id`; returns whether one was running.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let flight = lock(&self.inner).in_flight.remove(operation_id);
        match flight {
            Some(flight) if !flight.abort.is_finished() => {
                flight.abort.abort();
                debug!(operation_id, "Cancelled pending operation");
                true
            }
            _ => false,
        }
    }

    /// Cancels every pending attempt chain; returns how many were stopped.
    #[instrument(skip(self))]
    pub fn cancel_all(&self) -> usize {
        let mut inner = lock(&self.inner);
        let mut cancelled = 0;
        for (id, flight) in inner.in_flight.drain() {
            if !flight.abort.is_finished() {
                flight.abort.abort();
                cancelled += 1;
                debug!(operation_id = %id, "Cancelled pending operation");
            }
        }
        if cancelled > 0 {
            info!(cancelled, "All pending retries cancelled");
        }
        cancelled
    }

    /// Runs `op` under `policy`.
    ///
    /// The chain runs on its own task so [`cancel_all`](Self::cancel_all) can
    /// stop it between or during attempts.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Busy`] if `operation_id` already has a chain running
    /// - [`RpcError::ServiceUnavailable`] if the breaker is open (the operation
    ///   is not invoked and no attempt is used)
    /// - [`RpcError::Exhausted`] after the last retryable failure
    /// - [`RpcError::Fatal`] / [`RpcError::Rejected`] on a final failure
    /// - [`RpcError::Cancelled`] if the chain was cancelled
    #[instrument(skip(self, policy, op), fields(operation_id = %operation_id, max_attempts = policy.max_attempts))]
    pub async fn execute<T, F, Fut>(
        &self,
        operation_id: &str,
        policy: RetryPolicy,
        op: F,
    ) -> Result<T, RpcError>
    where
        T: Send + 'static,
        F: FnMut(RetryContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
    {
        let (ticket, join) = {
            let mut inner = lock(&self.inner);
            if inner
                .in_flight
                .get(operation_id)
                .is_some_and(|f| !f.abort.is_finished())
            {
                warn!("Operation already in flight");
                return Err(RpcError::Busy(operation_id.to_string()));
            }
            inner.next_ticket += 1;
            let ticket = inner.next_ticket;

            let chain = run_chain(Arc::clone(&self.inner), operation_id.to_string(), policy, op);
            let join = tokio::spawn(chain);
            inner.in_flight.insert(
                operation_id.to_string(),
                InFlight {
                    ticket,
                    abort: join.abort_handle(),
                },
            );
            (ticket, join)
        };

        let result = join.await;

        {
            let mut inner = lock(&self.inner);
            if inner
                .in_flight
                .get(operation_id)
                .is_some_and(|f| f.ticket == ticket)
            {
                inner.in_flight.remove(operation_id);
            }
        }

        match result {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_cancelled() => {
                debug!("Operation cancelled");
                Err(RpcError::Cancelled(operation_id.to_string()))
            }
            Err(join_err) => {
                error!(error = %join_err, "Operation task failed");
                Err(RpcError::Fatal(join_err.to_string()))
            }
        }
    }
}

async fn run_chain<T, F, Fut>(
    inner: Shared,
    operation_id: String,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, RpcError>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempt = 1;
    loop {
        let permit = {
            let mut guard = lock(&inner);
            let mut holds_trial = false;
            if policy.use_breaker {
                let now = Instant::now();
                let half_open = guard.breaker.state(now) == BreakerState::HalfOpen;
                if !guard.breaker.try_acquire(now) {
                    error!(operation_id = %operation_id, attempt, "Circuit breaker open, failing fast");
                    return Err(RpcError::ServiceUnavailable);
                }
                holds_trial = half_open;
            }
            BreakerPermit {
                inner: Arc::clone(&inner),
                holds_trial,
                resolved: false,
            }
        };

        debug!(operation_id = %operation_id, attempt, max = policy.max_attempts, "Executing attempt");
        let context = RetryContext {
            operation_id: operation_id.clone(),
            attempt,
            max_attempts: policy.max_attempts,
            next_delay: policy.backoff(attempt),
        };

        match op(context).await {
            Ok(value) => {
                permit.success();
                return Ok(value);
            }
            Err(AttemptError::Rejected(message)) => {
                permit.success();
                warn!(operation_id = %operation_id, %message, "Request rejected by server");
                return Err(RpcError::Rejected(message));
            }
            Err(AttemptError::Fatal(message)) => {
                permit.failure();
                error!(operation_id = %operation_id, %message, "Non-retryable failure");
                return Err(RpcError::Fatal(message));
            }
            Err(AttemptError::Retryable(message)) => {
                permit.failure();
                if attempt >= policy.max_attempts {
                    error!(operation_id = %operation_id, attempts = attempt, %message, "Max retries exceeded");
                    return Err(RpcError::Exhausted {
                        attempts: attempt,
                        last: message,
                    });
                }
                let delay = policy.backoff(attempt);
                warn!(
                    operation_id = %operation_id,
                    next_attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    %message,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
