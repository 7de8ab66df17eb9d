//! # Tower Throttle
//!
//! `tower-throttle` plugs the limits of [`throttle_limit`] into a job runner's work cycle:
//! jobs are checked when they are fetched and released when they are finished.
//!
//! ## The Work Cycle
//!
//! 1. **Fetch**: [`ThrottledFetch`] wraps a queue [`Backend`]. A throttled job is put back
//!    on the front of its queue and the queue is skipped for a short cooldown, so workers
//!    move on to other queues instead of spinning on it.
//! 2. **Run**: [`FinalizeLayer`] wraps the service that executes jobs. Once a job is over,
//!    whether it succeeded, failed, panicked or was cancelled, its concurrency slot is
//!    released.
//! 3. **Recover**: [`OrphanRecovery`] releases the limits of jobs a dead worker left
//!    behind, before handing them to the backend's existing orphan handler.
//!
//! Every failure to check a job admits it: throttling can delay work but never lose it.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use throttle_limit::ConcurrencyOptions;
//! use throttle_limit::JobMessage;
//! use throttle_limit::Registry;
//! use throttle_limit::ThrottleOptions;
//! use tower_throttle::MemoryBackend;
//! use tower_throttle::ThrottledFetch;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Arc::new(Registry::in_memory());
//! registry.add(
//!     "ReportJob",
//!     &ThrottleOptions::new().with_concurrency(ConcurrencyOptions::new(1)),
//! );
//!
//! let backend = MemoryBackend::new(["default"]);
//! backend.push("default", JobMessage::new("ReportJob", "jid-1").to_json().unwrap());
//!
//! let fetch = ThrottledFetch::new(backend, registry);
//! assert!(fetch.retrieve_work().await.unwrap().is_some());
//! # }
//! ```

mod backend;
mod error;
mod exclusion;
mod fetch;
mod layer;
mod memory;
mod orphan;
mod service;


pub use backend::Backend;
pub use backend::Notification;
pub use backend::PausableFetch;
pub use backend::Pausing;
pub use backend::WorkItem;
pub use error::FetchError;
pub use exclusion::ExclusionSet;
pub use fetch::DEFAULT_COOLDOWN;
pub use fetch::FetchConfig;
pub use fetch::ThrottledFetch;
pub use layer::FinalizeLayer;
pub use memory::DEFAULT_POLL_TIMEOUT;
pub use memory::MemoryBackend;
pub use memory::MemoryWork;
pub use orphan::OrphanHandler;
pub use orphan::OrphanRecovery;
pub use service::FinalizeGuard;
pub use service::FinalizeService;
pub use service::ResponseFuture;
