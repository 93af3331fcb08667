//! Retry policy for the outbound call.
//!
//! Semantics:
//! - `max_retries` counts re-invocations after the initial attempt, so a
//!   policy with `max_retries = 2` performs at most 3 underlying calls.
//! - `should_retry` classifies each outcome; the defaults treat transport
//!   failures, request timeouts, and server errors (>= 500) as retryable.
//!   Breaker rejections are never retried.
//! - Delays come from a [`RetryDelay`] schedule (fixed by default), with
//!   optional [`Jitter`], applied through an injectable [`Sleeper`].
//! - Exhausted retries return the last outcome exactly as received; the
//!   policy never substitutes a synthetic result.
//!
//! Invariants:
//! - Underlying invocations never exceed `max_retries + 1`.
//! - Attempts are strictly sequential: the next attempt starts only after
//!   the previous outcome is known and its delay has elapsed.

use crate::classify::{self, OutcomePredicate, ResponseClass};
use crate::telemetry::{EventBus, PipelineEvent, RetryEvent};
use crate::{PipelineError, Sleeper, TokioSleeper};
use rand::{rng, Rng};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default retry budget after the initial attempt.
pub const DEFAULT_MAX_RETRIES: usize = 2;

/// Default wait between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// The same delay before every retry.
    Fixed(Duration),
    /// Doubling delay starting at `base`, never exceeding `cap`.
    Exponential { base: Duration, cap: Duration },
}

impl RetryDelay {
    /// Fixed delay schedule.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed(delay)
    }

    /// Exponential schedule: `base * 2^(attempt - 1)`, capped.
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self::Exponential { base, cap }
    }

    /// Delay before the given retry (1-indexed). Saturates at `cap`.
    pub fn for_attempt(&self, attempt: usize) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, cap } => {
                let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                let factor = 2u32.saturating_pow(exponent.min(32));
                base.checked_mul(factor).map_or(*cap, |delay| delay.min(*cap))
            }
        }
    }
}

/// Randomization applied on top of the delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the scheduled delay exactly.
    #[default]
    None,
    /// Uniform in `[0, delay]`, spreading synchronized retries.
    Full,
}

impl Jitter {
    /// Apply jitter to a scheduled delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Full => {
                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng().random_range(0..=millis))
            }
        }
    }
}

/// Retry policy combining a budget, delay schedule, predicate, and sleeper.
pub struct RetryPolicy<T, E> {
    max_retries: usize,
    delay: RetryDelay,
    jitter: Jitter,
    should_retry: OutcomePredicate<T, E>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
}

impl<T, E> Clone for RetryPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            delay: self.delay,
            jitter: self.jitter,
            should_retry: Arc::clone(&self.should_retry),
            sleeper: Arc::clone(&self.sleeper),
            events: self.events.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for RetryPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("delay", &self.delay)
            .field("jitter", &self.jitter)
            .field("should_retry", &"<predicate>")
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl<T, E> RetryPolicy<T, E>
where
    T: ResponseClass + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Construct a builder with the default classification.
    pub fn builder() -> RetryPolicyBuilder<T, E> {
        RetryPolicyBuilder::new()
    }
}

impl<T, E> RetryPolicy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub(crate) fn from_parts(
        max_retries: usize,
        delay: RetryDelay,
        jitter: Jitter,
        should_retry: OutcomePredicate<T, E>,
        sleeper: Arc<dyn Sleeper>,
        events: EventBus,
    ) -> Self {
        Self { max_retries, delay, jitter, should_retry, sleeper, events }
    }

    /// Configured retry budget.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<Fut, Op>(&self, mut operation: Op) -> Result<T, PipelineError<E>>
    where
        Fut: Future<Output = Result<T, PipelineError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut outcome = operation().await;

        for attempt in 1..=self.max_retries {
            if !(self.should_retry)(&outcome) {
                return outcome;
            }

            let delay = self.jitter.apply(self.delay.for_attempt(attempt));
            tracing::debug!(attempt, max_retries = self.max_retries, ?delay, "retrying");
            self.events
                .emit(PipelineEvent::Retry(RetryEvent::Attempt {
                    attempt,
                    max_retries: self.max_retries,
                    delay,
                }))
                .await;

            self.sleeper.sleep(delay).await;
            outcome = operation().await;
        }

        // Budget spent: the last outcome goes out unchanged.
        outcome
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder<T, E> {
    max_retries: usize,
    delay: RetryDelay,
    jitter: Jitter,
    should_retry: OutcomePredicate<T, E>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
}

impl<T, E> RetryPolicyBuilder<T, E>
where
    T: ResponseClass + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a builder with the defaults: 2 retries, fixed 5 s delay, no
    /// jitter, default classification, tokio sleeper, no sink.
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: RetryDelay::fixed(DEFAULT_RETRY_DELAY),
            jitter: Jitter::None,
            should_retry: Arc::new(|outcome| classify::is_retryable(outcome)),
            sleeper: Arc::new(TokioSleeper),
            events: EventBus::disabled(),
        }
    }

    /// Retry budget after the initial attempt. Zero disables retries.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Delay schedule between attempts.
    pub fn delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Jitter applied to each scheduled delay.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Override the retryable-outcome classification.
    pub fn retry_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PipelineError<E>>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Dispatch attempt events to the given bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Build the retry policy.
    pub fn build(self) -> RetryPolicy<T, E> {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: self.delay,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            events: self.events,
        }
    }
}

impl<T, E> Default for RetryPolicyBuilder<T, E>
where
    T: ResponseClass + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
