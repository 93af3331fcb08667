//! Pipeline composition: Fallback ∘ Retry ∘ CircuitBreaker.
//!
//! The nesting order is fixed and load-bearing. The circuit breaker sits
//! closest to the real call so retries and fallback both observe its
//! rejections; retry sits between breaker and fallback so re-invocations run
//! against the breaker, not around it; fallback is outermost and is the
//! single place that converts any unresolved failure into a safe result.
//! [`STAGE_ORDER`] exposes that order as a contract.

use crate::circuit_breaker::{
    BreakerConfigError, CircuitBreakerPolicy, DEFAULT_BREAK_DURATION, DEFAULT_FAILURE_THRESHOLD,
};
use crate::classify::{self, OutcomePredicate, ResponseClass};
use crate::clock::{Clock, MonotonicClock};
use crate::fallback::FallbackPolicy;
use crate::retry::{Jitter, RetryDelay, RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{EventBus, TelemetrySink};
use crate::PipelineError;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Outermost: substitutes eligible failures.
    Fallback,
    /// Re-invokes retryable outcomes against the breaker.
    Retry,
    /// Innermost: guards the real outbound call.
    CircuitBreaker,
}

/// Evaluation order, outermost first.
pub const STAGE_ORDER: [Stage; 3] = [Stage::Fallback, Stage::Retry, Stage::CircuitBreaker];

/// Errors produced when assembling a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// No fallback outcome was configured.
    #[error("pipeline requires a fallback outcome (use fallback_value or fallback_with)")]
    MissingFallback,
    /// The breaker configuration was invalid.
    #[error(transparent)]
    Breaker(#[from] BreakerConfigError),
}

/// The assembled fault-tolerance pipeline.
///
/// One instance owns one circuit breaker; clones share it, so every
/// concurrent caller contributes to the same failure budget.
pub struct ResiliencePipeline<T, E> {
    fallback: FallbackPolicy<T, E>,
    retry: RetryPolicy<T, E>,
    breaker: CircuitBreakerPolicy<T, E>,
}

impl<T, E> Clone for ResiliencePipeline<T, E> {
    fn clone(&self) -> Self {
        Self {
            fallback: self.fallback.clone(),
            retry: self.retry.clone(),
            breaker: self.breaker.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for ResiliencePipeline<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("stages", &STAGE_ORDER)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl<T, E> ResiliencePipeline<T, E>
where
    T: ResponseClass + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Start building a pipeline with the default configuration.
    pub fn builder() -> PipelineBuilder<T, E> {
        PipelineBuilder::new()
    }

    /// The fixed evaluation order, outermost first.
    pub fn stages(&self) -> [Stage; 3] {
        STAGE_ORDER
    }

    /// The shared circuit breaker, for state introspection.
    pub fn breaker(&self) -> &CircuitBreakerPolicy<T, E> {
        &self.breaker
    }

    /// Execute the outbound operation through all three stages.
    ///
    /// The caller-visible result is either the operation's own success, an
    /// ineligible outcome passed through, or the configured fallback —
    /// classified failures never escape as panics.
    pub async fn execute<Fut, Op>(&self, operation: Op) -> Result<T, PipelineError<E>>
    where
        Fut: Future<Output = Result<T, PipelineError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op = Arc::new(Mutex::new(operation));
        let retry = self.retry.clone();
        let breaker = self.breaker.clone();

        self.fallback
            .execute(move || async move {
                retry
                    .execute(move || {
                        let breaker = breaker.clone();
                        let op = Arc::clone(&op);
                        async move {
                            breaker
                                .execute(move || {
                                    let mut op = op.lock().unwrap();
                                    (*op)()
                                })
                                .await
                        }
                    })
                    .await
            })
            .await
    }
}

/// Builder carrying the pipeline's recognized options.
pub struct PipelineBuilder<T, E> {
    max_retries: usize,
    retry_delay: RetryDelay,
    jitter: Jitter,
    failure_threshold: usize,
    break_duration: Duration,
    fallback: Option<Arc<dyn Fn() -> T + Send + Sync>>,
    retry_when: Option<OutcomePredicate<T, E>>,
    trip_when: Option<OutcomePredicate<T, E>>,
    fallback_when: Option<OutcomePredicate<T, E>>,
    events: EventBus,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl<T, E> PipelineBuilder<T, E>
where
    T: ResponseClass + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Defaults: 2 retries with a fixed 5 s delay, breaker threshold 5 with
    /// a 60 s cooldown, default classifications, no sink.
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: RetryDelay::fixed(DEFAULT_RETRY_DELAY),
            jitter: Jitter::None,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            break_duration: DEFAULT_BREAK_DURATION,
            fallback: None,
            retry_when: None,
            trip_when: None,
            fallback_when: None,
            events: EventBus::disabled(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Retry budget after the initial attempt. Zero disables retries.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Delay schedule between attempts.
    pub fn retry_delay(mut self, delay: RetryDelay) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Jitter applied to each retry delay.
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Consecutive qualifying failures before the breaker opens.
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Cooldown during which an open breaker rejects calls.
    pub fn break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = duration;
        self
    }

    /// Fixed substitute returned when every other layer fails.
    pub fn fallback_value(mut self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.fallback = Some(Arc::new(move || value.clone()));
        self
    }

    /// Computed substitute returned when every other layer fails.
    pub fn fallback_with<F>(mut self, produce: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(produce));
        self
    }

    /// Override the retryable-outcome classification.
    pub fn retry_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PipelineError<E>>) -> bool + Send + Sync + 'static,
    {
        self.retry_when = Some(Arc::new(predicate));
        self
    }

    /// Override the breaker trip classification.
    pub fn trip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PipelineError<E>>) -> bool + Send + Sync + 'static,
    {
        self.trip_when = Some(Arc::new(predicate));
        self
    }

    /// Override the fallback-eligibility classification.
    pub fn fallback_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PipelineError<E>>) -> bool + Send + Sync + 'static,
    {
        self.fallback_when = Some(Arc::new(predicate));
        self
    }

    /// Dispatch policy events to the given sink.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        self.events = EventBus::new(sink);
        self
    }

    /// Provide a custom sleeper for retry delays.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Provide a custom clock for breaker cooldown timing.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Assemble the pipeline, validating the configuration.
    pub fn build(self) -> Result<ResiliencePipeline<T, E>, BuildError> {
        let produce = self.fallback.ok_or(BuildError::MissingFallback)?;

        let retry_when = self
            .retry_when
            .unwrap_or_else(|| Arc::new(|outcome| classify::is_retryable(outcome)));
        let trip_when = self
            .trip_when
            .unwrap_or_else(|| Arc::new(|outcome| classify::is_breaker_trip(outcome)));
        let fallback_when = self
            .fallback_when
            .unwrap_or_else(|| Arc::new(|outcome| classify::is_fallback_eligible(outcome)));

        let breaker = CircuitBreakerPolicy::from_parts(
            self.failure_threshold,
            self.break_duration,
            trip_when,
            self.clock,
            self.events.clone(),
        )?;
        let retry = RetryPolicy::from_parts(
            self.max_retries,
            self.retry_delay,
            self.jitter,
            retry_when,
            self.sleeper,
            self.events.clone(),
        );
        let fallback = FallbackPolicy::from_parts(produce, fallback_when, self.events);

        Ok(ResiliencePipeline { fallback, retry, breaker })
    }
}

impl<T, E> Default for PipelineBuilder<T, E>
where
    T: ResponseClass + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
