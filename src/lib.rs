#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Palisade
//!
//! Layered fault tolerance for outbound calls: retry, circuit breaker, and
//! fallback composed into a single pipeline.
//!
//! ## Features
//!
//! - **Retry** of transient failures (timeouts, server errors, transport
//!   faults) with fixed or exponential delays and optional jitter
//! - **Circuit breaker** with half-open trial-call recovery, shared across
//!   concurrent callers, built on lock-free atomics
//! - **Fallback** substitution so callers receive a bounded, predictable
//!   outcome instead of a raw failure
//! - **Fixed composition order** — Fallback ∘ Retry ∘ CircuitBreaker —
//!   exposed as a testable contract
//! - **Structured events** (retry attempts, breaker status changes,
//!   fallback substitutions) through a pluggable telemetry sink
//! - **Injectable time** (`Sleeper`, `Clock`) for fast deterministic tests
//!
//! ## Quick Start
//!
//! ```rust
//! use palisade::{PipelineError, ResiliencePipeline, RetryDelay};
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let pipeline: ResiliencePipeline<u16, std::io::Error> = ResiliencePipeline::builder()
//!     .max_retries(2)
//!     .retry_delay(RetryDelay::fixed(Duration::from_secs(5)))
//!     .failure_threshold(5)
//!     .break_duration(Duration::from_secs(60))
//!     .fallback_value(404)
//!     .build()
//!     .unwrap();
//!
//! let outcome = pipeline
//!     .execute(|| async { Ok::<_, PipelineError<std::io::Error>>(200) })
//!     .await;
//! assert_eq!(outcome.unwrap(), 200);
//! # });
//! ```

pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod error;
pub mod fallback;
pub mod pipeline;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use circuit_breaker::{BreakerConfigError, CircuitBreakerPolicy, CircuitState};
pub use classify::{OutcomePredicate, ResponseClass};
pub use clock::{Clock, MonotonicClock};
pub use error::PipelineError;
pub use fallback::FallbackPolicy;
pub use pipeline::{BuildError, PipelineBuilder, ResiliencePipeline, Stage, STAGE_ORDER};
pub use retry::{Jitter, RetryDelay, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{
    emit_best_effort, BreakerEvent, EventBus, FallbackEvent, LogSink, MemorySink, NullSink,
    PipelineEvent, RetryEvent, TelemetrySink,
};
