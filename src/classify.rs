//! Outcome classification.
//!
//! Pure predicates over a single attempt's outcome. An outcome is
//! `Result<T, PipelineError<E>>`: the success channel carries a completed
//! exchange (which may still have a failing status), the error channel
//! carries transport failures and breaker rejections. The same outcome can
//! satisfy several classifications at once; a 500 response is both
//! retryable and counts against the breaker.
//!
//! Responses expose their status through [`ResponseClass`]. Plain `u16`
//! status codes implement it directly, which keeps tests and demos free of
//! any transport type.

use crate::PipelineError;
use std::sync::Arc;

/// Status code signaling a client-side request timeout.
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;

/// Exposes the wire status of a completed exchange so policies can classify
/// it without knowing the transport type.
pub trait ResponseClass {
    /// Numeric status carried by the response.
    fn status(&self) -> u16;

    /// Whether the status is in the success range.
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status())
    }
}

impl ResponseClass for u16 {
    fn status(&self) -> u16 {
        *self
    }
}

/// Shared predicate type used to override the default classifications on
/// any policy.
pub type OutcomePredicate<T, E> =
    Arc<dyn Fn(&Result<T, PipelineError<E>>) -> bool + Send + Sync>;

/// Whether an outcome justifies another attempt: a transport failure, a
/// request-timeout status, or a server error (>= 500).
///
/// Breaker rejections are never retryable; they end the call.
///
/// ```
/// use palisade::classify::is_retryable;
/// use palisade::PipelineError;
///
/// let ok: Result<u16, PipelineError<std::io::Error>> = Ok(200);
/// assert!(!is_retryable(&ok));
/// let server_error: Result<u16, PipelineError<std::io::Error>> = Ok(503);
/// assert!(is_retryable(&server_error));
/// ```
pub fn is_retryable<T, E>(outcome: &Result<T, PipelineError<E>>) -> bool
where
    T: ResponseClass,
{
    match outcome {
        Ok(response) => {
            let status = response.status();
            status == STATUS_REQUEST_TIMEOUT || status >= 500
        }
        Err(PipelineError::Inner(_)) => true,
        Err(PipelineError::CircuitOpen { .. }) => false,
    }
}

/// Whether an outcome counts against the breaker's failure budget.
///
/// Deliberately the same outcome class as [`is_retryable`]: what justifies
/// an immediate retry also counts toward opening the circuit.
pub fn is_breaker_trip<T, E>(outcome: &Result<T, PipelineError<E>>) -> bool
where
    T: ResponseClass,
{
    is_retryable(outcome)
}

/// Whether an outcome should be replaced by the fallback result: any
/// non-success response, any transport failure, and any breaker rejection.
pub fn is_fallback_eligible<T, E>(outcome: &Result<T, PipelineError<E>>) -> bool
where
    T: ResponseClass,
{
    match outcome {
        Ok(response) => !response.is_success(),
        Err(_) => true,
    }
}
