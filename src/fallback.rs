//! Fallback policy: the pipeline's outermost layer.
//!
//! Any outcome the classifier marks fallback-eligible — a non-success
//! response, a transport failure, or the breaker's rejection — is discarded
//! and replaced by a predetermined substitute. The caller never observes the
//! underlying failure; ineligible outcomes pass through untouched.

use crate::classify::{self, OutcomePredicate, ResponseClass};
use crate::telemetry::{EventBus, FallbackEvent, PipelineEvent};
use crate::PipelineError;
use std::future::Future;
use std::sync::Arc;

/// Fallback policy substituting a fixed result for eligible failures.
pub struct FallbackPolicy<T, E> {
    produce: Arc<dyn Fn() -> T + Send + Sync>,
    eligible: OutcomePredicate<T, E>,
    events: EventBus,
}

impl<T, E> Clone for FallbackPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            produce: Arc::clone(&self.produce),
            eligible: Arc::clone(&self.eligible),
            events: self.events.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for FallbackPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("produce", &"<substitute>")
            .field("eligible", &"<predicate>")
            .finish()
    }
}

impl<T, E> FallbackPolicy<T, E>
where
    T: ResponseClass + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Substitute a fixed value for eligible failures.
    pub fn new(substitute: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_fn(move || substitute.clone())
    }

    /// Substitute a computed value for eligible failures.
    pub fn from_fn<F>(produce: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::from_parts(
            Arc::new(produce),
            Arc::new(|outcome| classify::is_fallback_eligible(outcome)),
            EventBus::disabled(),
        )
    }

    pub(crate) fn from_parts(
        produce: Arc<dyn Fn() -> T + Send + Sync>,
        eligible: OutcomePredicate<T, E>,
        events: EventBus,
    ) -> Self {
        Self { produce, eligible, events }
    }

    /// Override the fallback-eligibility classification.
    pub fn eligible_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PipelineError<E>>) -> bool + Send + Sync + 'static,
    {
        self.eligible = Arc::new(predicate);
        self
    }

    /// Dispatch substitution events to the given bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Execute the wrapped pipeline, substituting eligible failures.
    ///
    /// The discarded outcome is described in a warning log and a
    /// [`FallbackEvent`]; both are recorded off the caller's path, so
    /// neither a slow sink nor a sink failure can affect the returned
    /// result.
    pub async fn execute<Fut, Op>(&self, operation: Op) -> Result<T, PipelineError<E>>
    where
        Fut: Future<Output = Result<T, PipelineError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let outcome = operation().await;
        if !(self.eligible)(&outcome) {
            return outcome;
        }

        let reason = describe(&outcome);
        tracing::warn!(%reason, "substituting fallback result");
        if self.events.is_enabled() {
            let events = self.events.clone();
            tokio::spawn(async move {
                events.emit(PipelineEvent::Fallback(FallbackEvent::Triggered { reason })).await;
            });
        }

        Ok((self.produce)())
    }
}

fn describe<T, E>(outcome: &Result<T, PipelineError<E>>) -> String
where
    T: ResponseClass,
    E: std::error::Error,
{
    match outcome {
        Ok(response) => format!("response status {}", response.status()),
        Err(error) => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    type Outcome = Result<u16, PipelineError<TestError>>;

    fn policy() -> FallbackPolicy<u16, TestError> {
        FallbackPolicy::new(404)
    }

    #[tokio::test]
    async fn success_passes_through_unchanged() {
        let result = policy().execute(|| async { Ok::<_, PipelineError<TestError>>(200u16) }).await;
        assert_eq!(result.unwrap(), 200);
    }

    #[tokio::test]
    async fn failing_status_is_substituted() {
        let result = policy().execute(|| async { Ok::<_, PipelineError<TestError>>(500u16) }).await;
        assert_eq!(result.unwrap(), 404);
    }

    #[tokio::test]
    async fn transport_failure_is_substituted() {
        let result: Outcome = policy()
            .execute(|| async { Err(PipelineError::Inner(TestError("refused".into()))) })
            .await;
        assert_eq!(result.unwrap(), 404);
    }

    #[tokio::test]
    async fn breaker_rejection_is_substituted() {
        let result: Outcome = policy()
            .execute(|| async {
                Err(PipelineError::CircuitOpen {
                    failure_count: 5,
                    open_duration: Duration::from_secs(1),
                })
            })
            .await;
        assert_eq!(result.unwrap(), 404);
    }

    #[tokio::test]
    async fn computed_substitute_is_used() {
        let policy: FallbackPolicy<u16, TestError> = FallbackPolicy::from_fn(|| 204);
        let result = policy.execute(|| async { Ok::<_, PipelineError<TestError>>(503u16) }).await;
        assert_eq!(result.unwrap(), 204);
    }

    #[tokio::test]
    async fn custom_predicate_lets_failures_through() {
        let policy = policy().eligible_when(|_outcome: &Outcome| false);
        let result = policy.execute(|| async { Ok::<_, PipelineError<TestError>>(500u16) }).await;
        assert_eq!(result.unwrap(), 500, "ineligible outcomes pass through");
    }

    #[tokio::test]
    async fn substitution_records_the_original_reason() {
        let sink = MemorySink::new();
        let policy = policy().with_events(EventBus::new(sink.clone()));

        let result = policy.execute(|| async { Ok::<_, PipelineError<TestError>>(500u16) }).await;
        assert_eq!(result.unwrap(), 404);

        // The event is recorded off the caller's path.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sink.events(),
            vec![PipelineEvent::Fallback(FallbackEvent::Triggered {
                reason: "response status 500".into(),
            })]
        );
    }

    #[tokio::test]
    async fn transport_reason_uses_the_error_display() {
        let sink = MemorySink::new();
        let policy = policy().with_events(EventBus::new(sink.clone()));

        let _: Outcome = policy
            .execute(|| async { Err(PipelineError::Inner(TestError("refused".into()))) })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sink.events(),
            vec![PipelineEvent::Fallback(FallbackEvent::Triggered {
                reason: "TestError: refused".into(),
            })]
        );
    }
}
