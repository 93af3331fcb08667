//! Pipeline observability.
//!
//! Policies describe their behavior as discrete [`PipelineEvent`]s: retry
//! attempts, breaker status changes, and fallback substitutions. Events flow
//! through a [`TelemetrySink`] (a `tower::Service<PipelineEvent>`) supplied
//! by the caller; the pipeline emits them best-effort and a failing or slow
//! sink can never change a call's outcome.

use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Events emitted by the pipeline's policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Retry policy events.
    Retry(RetryEvent),
    /// Circuit breaker status changes.
    Breaker(BreakerEvent),
    /// Fallback substitutions.
    Fallback(FallbackEvent),
}

/// Emitted by the retry policy before each re-invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry is about to run after the given delay.
    Attempt {
        /// Retry number, 1-indexed.
        attempt: usize,
        /// Configured retry budget.
        max_retries: usize,
        /// Delay applied before this retry.
        delay: Duration,
    },
}

/// Emitted by the circuit breaker on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// The circuit opened; calls will be rejected until the cooldown elapses.
    Opened {
        /// Consecutive qualifying failures observed at the transition.
        failure_count: usize,
    },
    /// The cooldown elapsed; a trial call is being allowed through.
    HalfOpen,
    /// The trial succeeded; normal operation resumed.
    Closed,
}

/// Emitted by the fallback policy when it substitutes a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackEvent {
    /// The substitute was returned instead of the original outcome.
    Triggered {
        /// Human-readable description of the discarded failure.
        reason: String,
    },
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry(RetryEvent::Attempt { attempt, max_retries, delay }) => {
                write!(f, "retry attempt {}/{} after {:?}", attempt, max_retries, delay)
            }
            Self::Breaker(BreakerEvent::Opened { failure_count }) => {
                write!(f, "circuit opened after {} failures", failure_count)
            }
            Self::Breaker(BreakerEvent::HalfOpen) => write!(f, "circuit half-open"),
            Self::Breaker(BreakerEvent::Closed) => write!(f, "circuit closed"),
            Self::Fallback(FallbackEvent::Triggered { reason }) => {
                write!(f, "fallback triggered: {}", reason)
            }
        }
    }
}

/// A telemetry sink that consumes pipeline events.
pub trait TelemetrySink:
    Service<PipelineEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: PipelineEvent)
where
    S: Service<PipelineEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type DispatchFn = Arc<dyn Fn(PipelineEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Type-erased handle the policies use to dispatch events.
///
/// Wraps a [`TelemetrySink`] so policy types stay free of sink generics.
/// Every dispatch goes through [`emit_best_effort`], so sink errors stop
/// here. A disabled bus drops events without any work.
#[derive(Clone, Default)]
pub struct EventBus {
    dispatch: Option<DispatchFn>,
}

impl EventBus {
    /// Build a bus dispatching to the given sink.
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        let dispatch: DispatchFn = Arc::new(move |event: PipelineEvent| -> BoxFuture<'static, ()> {
            let sink = sink.clone();
            Box::pin(emit_best_effort(sink, event))
        });
        Self { dispatch: Some(dispatch) }
    }

    /// A bus that discards every event.
    pub fn disabled() -> Self {
        Self { dispatch: None }
    }

    /// Whether a sink is attached.
    pub fn is_enabled(&self) -> bool {
        self.dispatch.is_some()
    }

    /// Dispatch one event, swallowing sink failures.
    pub async fn emit(&self, event: PipelineEvent) {
        if let Some(dispatch) = &self.dispatch {
            dispatch(event).await;
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("enabled", &self.is_enabled()).finish()
    }
}

/// A sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PipelineEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PipelineEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs events through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PipelineEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        tracing::info!(event = %event, "pipeline_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A sink that stores events in memory, for tests and inspection.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, in emission order.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl Service<PipelineEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        self.events.lock().unwrap().push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
