//! Error channel shared by all pipeline policies.

use std::time::Duration;

/// Unified failure type flowing through the pipeline.
///
/// Semantics:
/// - `Inner(E)` wraps the outbound call's own transport error (the request
///   never produced a response). Completed-but-failing responses stay in the
///   success channel and are classified by status instead.
/// - `CircuitOpen` is synthesized locally by the circuit breaker when it
///   rejects a call without invoking the operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError<E> {
    /// The circuit breaker rejected the call without attempting it.
    #[error("circuit breaker open ({failure_count} failures, open for {open_duration:?})")]
    CircuitOpen {
        /// Consecutive qualifying failures observed before opening.
        failure_count: usize,
        /// How long the breaker had been open when the call was rejected.
        open_duration: Duration,
    },
    /// The outbound call failed at the transport level.
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E> PipelineError<E> {
    /// Check whether this is a breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check whether this wraps a transport error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Borrow the transport error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Extract the transport error if present.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Breaker rejection details as (failure_count, open_duration).
    pub fn circuit_open_details(&self) -> Option<(usize, Duration)> {
        match self {
            Self::CircuitOpen { failure_count, open_duration } => {
                Some((*failure_count, *open_duration))
            }
            _ => None,
        }
    }
}
