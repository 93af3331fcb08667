//! Circuit breaker with lock-free atomic state transitions.
//!
//! The breaker sits closest to the outbound call. While `Closed` it counts
//! consecutive trip-condition outcomes; at `failure_threshold` it opens and
//! rejects calls locally for `break_duration`. The Open → HalfOpen
//! transition is a state read at call time, not a background timer: once the
//! cooldown has elapsed, the next caller wins a compare-and-swap and runs a
//! single exclusive trial call. A passing trial closes the circuit and
//! resets the failure count; a tripping trial re-opens it and restarts the
//! cooldown.
//!
//! Clones share the same state via `Arc`, so every concurrent caller
//! observes and affects one circuit lifecycle. All transitions are CAS-based
//! and the post-trial update is last-writer-consistent.

use crate::classify::{self, OutcomePredicate, ResponseClass};
use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{BreakerEvent, EventBus, PipelineEvent};
use crate::PipelineError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default consecutive-failure threshold before opening.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;

/// Default cooldown while open.
pub const DEFAULT_BREAK_DURATION: Duration = Duration::from_secs(60);

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; failures are being counted.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// The cooldown elapsed; a trial call is deciding the next state.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Closed => STATE_CLOSED,
            Self::Open => STATE_OPEN,
            Self::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_OPEN => Self::Open,
            STATE_HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerConfigError {
    /// Threshold of zero would open the circuit before any call.
    #[error("failure_threshold must be > 0")]
    ZeroFailureThreshold,
    /// A zero cooldown would re-probe on every call.
    #[error("break_duration must be > 0")]
    ZeroBreakDuration,
}

#[derive(Debug)]
struct BreakerShared {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    probe_in_flight: AtomicBool,
}

/// Releases the half-open probe slot even if the trial is cancelled.
struct ProbeGuard<'a> {
    shared: &'a BreakerShared,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.shared.probe_in_flight.store(false, Ordering::Release);
    }
}

/// Circuit breaker policy guarding the outbound call.
///
/// Clones share the underlying state, so all handles observe the same
/// failure counts and open/half-open/closed transitions.
pub struct CircuitBreakerPolicy<T, E> {
    shared: Arc<BreakerShared>,
    failure_threshold: usize,
    break_duration: Duration,
    trip_condition: OutcomePredicate<T, E>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl<T, E> Clone for CircuitBreakerPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            failure_threshold: self.failure_threshold,
            break_duration: self.break_duration,
            trip_condition: Arc::clone(&self.trip_condition),
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for CircuitBreakerPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field(
                "state",
                &CircuitState::from_u8(self.shared.state.load(Ordering::Acquire)),
            )
            .field("failure_threshold", &self.failure_threshold)
            .field("break_duration", &self.break_duration)
            .finish()
    }
}

impl<T, E> CircuitBreakerPolicy<T, E>
where
    T: ResponseClass + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a breaker with the default trip condition (timeout status,
    /// server error, or transport failure).
    ///
    /// Errors if `failure_threshold` or `break_duration` is zero.
    pub fn new(
        failure_threshold: usize,
        break_duration: Duration,
    ) -> Result<Self, BreakerConfigError> {
        Self::from_parts(
            failure_threshold,
            break_duration,
            Arc::new(|outcome| classify::is_breaker_trip(outcome)),
            Arc::new(MonotonicClock::default()),
            EventBus::disabled(),
        )
    }
}

impl<T, E> CircuitBreakerPolicy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub(crate) fn from_parts(
        failure_threshold: usize,
        break_duration: Duration,
        trip_condition: OutcomePredicate<T, E>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self, BreakerConfigError> {
        if failure_threshold == 0 {
            return Err(BreakerConfigError::ZeroFailureThreshold);
        }
        if break_duration.is_zero() {
            return Err(BreakerConfigError::ZeroBreakDuration);
        }
        Ok(Self {
            shared: Arc::new(BreakerShared {
                state: AtomicU8::new(CircuitState::Closed.to_u8()),
                consecutive_failures: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                probe_in_flight: AtomicBool::new(false),
            }),
            failure_threshold,
            break_duration,
            trip_condition,
            clock,
            events,
        })
    }

    /// Override the trip-condition classification.
    pub fn trip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PipelineError<E>>) -> bool + Send + Sync + 'static,
    {
        self.trip_condition = Arc::new(predicate);
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Dispatch status-change events to the given bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Current state, decoded from the shared atomics.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Consecutive qualifying failures counted while closed.
    pub fn failure_count(&self) -> usize {
        self.shared.consecutive_failures.load(Ordering::Acquire)
    }

    /// Configured threshold before opening.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Configured cooldown while open.
    pub fn break_duration(&self) -> Duration {
        self.break_duration
    }

    /// Execute the operation under breaker protection.
    ///
    /// - `Closed`: invoke the operation, classify the outcome, and update
    ///   the failure count or open the circuit.
    /// - `Open` inside the cooldown: reject with
    ///   [`PipelineError::CircuitOpen`] without invoking the operation.
    /// - `Open` past the cooldown / `HalfOpen`: at most one trial call runs;
    ///   concurrent callers are rejected until it completes.
    ///
    /// Exactly one underlying invocation occurs per call that is not
    /// short-circuited; the breaker never retries internally.
    pub async fn execute<Fut, Op>(&self, operation: Op) -> Result<T, PipelineError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PipelineError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let mut probe_guard: Option<ProbeGuard<'_>> = None;

        loop {
            match self.state() {
                CircuitState::Closed => break,
                CircuitState::Open => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);

                    if elapsed < self.break_duration.as_millis() as u64 {
                        return Err(self.rejection(elapsed));
                    }

                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // Won the race: this call is the trial.
                            self.shared.probe_in_flight.store(true, Ordering::Release);
                            probe_guard = Some(ProbeGuard { shared: &self.shared });
                            tracing::info!("circuit breaker → half-open");
                            self.events.emit(PipelineEvent::Breaker(BreakerEvent::HalfOpen)).await;
                            break;
                        }
                        // Another caller transitioned first; re-read the state.
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    if self.shared.probe_in_flight.swap(true, Ordering::AcqRel) {
                        let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                        return Err(self.rejection(elapsed));
                    }
                    probe_guard = Some(ProbeGuard { shared: &self.shared });
                    tracing::debug!("circuit breaker: trial call");
                    break;
                }
            }
        }

        let outcome = operation().await;

        let transition = if (self.trip_condition)(&outcome) {
            self.record_trip()
        } else {
            self.record_pass()
        };
        drop(probe_guard);

        if let Some(event) = transition {
            match event {
                BreakerEvent::Opened { failure_count } => tracing::warn!(
                    failure_count,
                    threshold = self.failure_threshold,
                    "circuit breaker → open"
                ),
                BreakerEvent::Closed => tracing::info!("circuit breaker → closed"),
                BreakerEvent::HalfOpen => {}
            }
            self.events.emit(PipelineEvent::Breaker(event)).await;
        }

        outcome
    }

    fn rejection(&self, elapsed_millis: u64) -> PipelineError<E> {
        PipelineError::CircuitOpen {
            failure_count: self.failure_count(),
            open_duration: Duration::from_millis(elapsed_millis),
        }
    }

    fn record_trip(&self) -> Option<BreakerEvent> {
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // Trial failed: cooldown restarts from now.
                    self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    self.shared.probe_in_flight.store(false, Ordering::Release);
                    Some(BreakerEvent::Opened { failure_count: self.failure_count() })
                } else {
                    None
                }
            }
            CircuitState::Closed => {
                let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    self.shared.probe_in_flight.store(false, Ordering::Release);
                    Some(BreakerEvent::Opened { failure_count: failures })
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn record_pass(&self) -> Option<BreakerEvent> {
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.consecutive_failures.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(0, Ordering::Release);
                    self.shared.probe_in_flight.store(false, Ordering::Release);
                    Some(BreakerEvent::Closed)
                } else {
                    None
                }
            }
            CircuitState::Closed => {
                // Only consecutive failures open the circuit; any benign
                // outcome resets the streak.
                self.shared.consecutive_failures.store(0, Ordering::Release);
                None
            }
            CircuitState::Open => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    type Outcome = Result<u16, PipelineError<TestError>>;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn breaker(
        threshold: usize,
        cooldown: Duration,
    ) -> CircuitBreakerPolicy<u16, TestError> {
        CircuitBreakerPolicy::new(threshold, cooldown).expect("valid breaker")
    }

    async fn trip_once(breaker: &CircuitBreakerPolicy<u16, TestError>) {
        let _ = breaker
            .execute(|| async { Err(PipelineError::Inner(TestError("fail".into()))) })
            .await;
    }

    #[test]
    fn rejects_zero_threshold() {
        let err = CircuitBreakerPolicy::<u16, TestError>::new(0, Duration::from_secs(1))
            .expect_err("zero threshold should be invalid");
        assert_eq!(err, BreakerConfigError::ZeroFailureThreshold);
    }

    #[test]
    fn rejects_zero_cooldown() {
        let err = CircuitBreakerPolicy::<u16, TestError>::new(1, Duration::ZERO)
            .expect_err("zero cooldown should be invalid");
        assert_eq!(err, BreakerConfigError::ZeroBreakDuration);
    }

    #[tokio::test]
    async fn starts_closed_and_passes_outcomes_through() {
        let breaker = breaker(3, Duration::from_secs(1));
        assert_eq!(breaker.state(), CircuitState::Closed);

        let result = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(200u16) }).await;
        assert_eq!(result.unwrap(), 200);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_trips() {
        let breaker = breaker(3, Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls_clone = calls.clone();
            let _ = breaker
                .execute(|| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, PipelineError<TestError>>(500u16)
                    }
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Next call is rejected without invoking the operation.
        calls.store(0, Ordering::SeqCst);
        let calls_clone = calls.clone();
        let result = breaker
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PipelineError<TestError>>(200u16)
                }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn benign_outcome_resets_the_failure_streak() {
        let breaker = breaker(3, Duration::from_secs(10));

        trip_once(&breaker).await;
        trip_once(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        // 404 is not a trip condition, so the streak resets.
        let _ = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(404u16) }).await;
        assert_eq!(breaker.failure_count(), 0);

        trip_once(&breaker).await;
        trip_once(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed, "streak restarted after reset");
    }

    #[tokio::test]
    async fn cooldown_elapse_allows_a_trial_that_closes_on_success() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::from_millis(100)).with_clock(clock.clone());

        trip_once(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Still inside the cooldown: rejected with no invocation.
        let result = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(200u16) }).await;
        assert!(result.unwrap_err().is_circuit_open());

        clock.advance(150);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = breaker
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PipelineError<TestError>>(200u16)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one trial invocation");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn failing_trial_reopens_and_restarts_the_cooldown() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::from_millis(100)).with_clock(clock.clone());

        trip_once(&breaker).await;
        clock.advance(150);

        // Trial still trips: back to open.
        let _ = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(503u16) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // The cooldown restarted at the failed trial, so 60ms later the
        // circuit is still rejecting.
        clock.advance(60);
        let result = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(200u16) }).await;
        assert!(result.unwrap_err().is_circuit_open());

        // Once the restarted cooldown elapses, a passing trial closes it.
        clock.advance(60);
        let result = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(200u16) }).await;
        assert_eq!(result.unwrap(), 200);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn successes_never_move_the_failure_count() {
        let breaker = breaker(2, Duration::from_secs(10));

        for _ in 0..20 {
            let result =
                breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(200u16) }).await;
            assert!(result.is_ok());
        }
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn custom_trip_condition_is_honored() {
        let breaker = breaker(1, Duration::from_secs(10))
            .trip_when(|outcome: &Outcome| matches!(outcome, Ok(status) if *status == 418));

        // 500 no longer trips.
        let _ = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(500u16) }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(418u16) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn concurrent_half_open_callers_get_one_trial() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::from_millis(50)).with_clock(clock.clone());

        trip_once(&breaker).await;
        clock.advance(100);

        let invocations = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..3 {
            let breaker = breaker.clone();
            let invocations = invocations.clone();
            handles.push(tokio::spawn(async move {
                breaker
                    .execute(|| {
                        let invocations = invocations.clone();
                        async move {
                            invocations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, PipelineError<TestError>>(200u16)
                        }
                    })
                    .await
            }));
        }

        let results: Vec<_> = futures::future::join_all(handles).await;
        let successes =
            results.iter().filter(|r| r.as_ref().expect("join error").is_ok()).count();
        let rejections = results
            .iter()
            .filter(|r| {
                r.as_ref()
                    .expect("join error")
                    .as_ref()
                    .err()
                    .is_some_and(|e| e.is_circuit_open())
            })
            .count();

        assert_eq!(invocations.load(Ordering::SeqCst), 1, "one trial invocation");
        assert_eq!(successes, 1);
        assert_eq!(rejections, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn cancelled_trial_releases_the_probe_slot() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::from_millis(50)).with_clock(clock.clone());

        trip_once(&breaker).await;
        clock.advance(100);

        // Start a trial that never completes, then drop it.
        let pending_trial = breaker.execute(|| async {
            futures::future::pending::<Outcome>().await
        });
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), pending_trial).await;
        assert!(cancelled.is_err(), "trial should still be pending when dropped");

        // The slot is free again: a new trial runs and closes the circuit.
        let result = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(200u16) }).await;
        assert_eq!(result.unwrap(), 200);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn transitions_emit_status_events() {
        let clock = ManualClock::new();
        let sink = MemorySink::new();
        let breaker = breaker(2, Duration::from_millis(50))
            .with_clock(clock.clone())
            .with_events(EventBus::new(sink.clone()));

        trip_once(&breaker).await;
        trip_once(&breaker).await;
        clock.advance(100);
        let _ = breaker.execute(|| async { Ok::<_, PipelineError<TestError>>(200u16) }).await;

        assert_eq!(
            sink.events(),
            vec![
                PipelineEvent::Breaker(BreakerEvent::Opened { failure_count: 2 }),
                PipelineEvent::Breaker(BreakerEvent::HalfOpen),
                PipelineEvent::Breaker(BreakerEvent::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn panicking_operation_releases_the_probe_slot() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::from_millis(50)).with_clock(clock.clone());

        trip_once(&breaker).await;
        clock.advance(100);

        let result: Result<Outcome, _> = std::panic::AssertUnwindSafe(async {
            breaker.execute(|| async { panic!("boom") }).await
        })
        .catch_unwind()
        .await;
        assert!(result.is_err());
        assert!(!breaker.shared.probe_in_flight.load(Ordering::Acquire));
    }
}
