//! # throttle-limit
//!
//! `throttle-limit` decides whether a dequeued job may run now or must be put back on its
//! queue, based on per job class concurrency and threshold limits.
//!
//! ## Core Philosophy
//!
//! Limiters hold no state of their own. Every check, reservation and release is a single
//! atomic operation against a shared [`CounterStore`], so any number of worker threads or
//! processes can consult the same limits without additional locking.
//!
//! ## Key Concepts
//!
//! * **Concurrency**: caps the number of in-flight instances of a job class. Reservations
//!   are idempotent per job id and must be released with [`Limiter::finalize`].
//! * **Threshold**: caps the number of admissions of a job class per fixed window.
//! * **Fail-Open**: malformed messages and unregistered classes are never throttled.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use throttle_limit::ConcurrencyOptions;
//! use throttle_limit::Limiter;
//! use throttle_limit::Registry;
//! use throttle_limit::ThresholdOptions;
//! use throttle_limit::ThrottleOptions;
//!
//! let registry = Registry::in_memory();
//! let strategy = registry.add(
//!     "ReportJob",
//!     &ThrottleOptions::new()
//!         .with_concurrency(ConcurrencyOptions::new(10))
//!         .with_threshold(ThresholdOptions::new(1_000, Duration::from_secs(3600))),
//! );
//!
//! if strategy.check("jid-1", &[]).unwrap().is_continue() {
//!     // Run the job, then release its slot
//!     strategy.finalize("jid-1", &[]).unwrap();
//! }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

use serde_json::Value;

mod concurrency;
mod error;
mod message;
mod options;
mod registry;
mod store;
mod strategy;
mod threshold;

#[cfg(feature = "redis")]
mod redis_store;

pub use concurrency::ConcurrencyLimiter;
pub use error::CheckError;
pub use error::MessageError;
pub use error::StoreError;
pub use message::JobMessage;
pub use options::ConcurrencyOptions;
pub use options::DEFAULT_CONCURRENCY_TTL;
pub use options::Dynamic;
pub use options::ThresholdOptions;
pub use options::ThrottleOptions;
pub use registry::Registry;
pub use store::CounterStore;
pub use store::MemoryStore;
pub use store::Reservation;
pub use strategy::Strategy;
pub use threshold::ThresholdLimiter;

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Reasons why a job might be throttled by a limiter.
#[derive(Clone, Debug, PartialEq)]
pub enum Reason {
    /// Every concurrency slot is taken.
    Concurrency { limit: i64 },
    /// The current window already holds `limit` admissions.
    Threshold { limit: i64, retry_after: Duration },
}

/// The core trait for all job limiters.
///
/// Limiters must be `Send` and `Sync` so one instance can be shared by every fetch loop
/// in the process.
pub trait Limiter: Debug + Send + Sync {
    /// Answers whether the job `jid` is throttled right now.
    ///
    /// This is not side effect free: an admitted job may have reserved a slot or consumed
    /// part of a window.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the counter store could not be reached.
    fn check(&self, jid: &str, args: &[Value]) -> Result<ControlFlow<Reason>, StoreError>;

    /// Releases any state held on behalf of `jid`. Releasing twice is a no-op.
    fn finalize(&self, jid: &str, args: &[Value]) -> Result<(), StoreError>;
}
