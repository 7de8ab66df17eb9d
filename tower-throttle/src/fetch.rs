use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use throttle_limit::JobMessage;
use throttle_limit::Reason;
use throttle_limit::Registry;
use tracing::debug;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::WorkItem;
use crate::error::FetchError;
use crate::exclusion::ExclusionSet;

/// How long a queue is skipped after one of its jobs was throttled.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

/// Tuning for a [`ThrottledFetch`].
#[derive(Clone, Debug)]
pub struct FetchConfig {
    pub cooldown: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl FetchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how long a queue is excluded after a throttled job.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Clone, Debug)]
struct ThrottledFetchMetrics {
    admitted: Counter<u64>,
    throttled: Counter<u64>,
    fail_open: Counter<u64>,
}

/// Wraps a queue [`Backend`] so that throttled jobs never reach a worker.
///
/// Each retrieval skips queues in their cooldown, checks the retrieved job against its
/// class's strategy and either hands it out or puts it back on the front of its queue.
/// Jobs that cannot be checked are always handed out.
#[derive(Debug)]
pub struct ThrottledFetch<B> {
    backend: B,
    registry: Arc<Registry>,
    exclusions: ExclusionSet,
    cooldown: Duration,
    instruments: ThrottledFetchMetrics,
}

impl<B> ThrottledFetch<B>
where
    B: Backend,
{
    pub fn new(backend: B, registry: Arc<Registry>) -> Self {
        Self::with_config(backend, registry, FetchConfig::default())
    }

    pub fn with_config(backend: B, registry: Arc<Registry>, config: FetchConfig) -> Self {
        let meter = global::meter("throttled_fetch");
        let instruments = ThrottledFetchMetrics {
            admitted: meter.u64_counter("admitted").build(),
            throttled: meter.u64_counter("throttled").build(),
            fail_open: meter.u64_counter("fail_open").build(),
        };

        Self {
            backend,
            registry,
            exclusions: ExclusionSet::new(),
            cooldown: config.cooldown,
            instruments,
        }
    }

    /// Replace the exclusion set, e.g. with one driven by a mock clock.
    pub fn with_exclusions(mut self, exclusions: ExclusionSet) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        &self.exclusions
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Retrieve the next job a worker may run.
    ///
    /// `Ok(None)` means either that no work arrived before the backend's timeout, or that
    /// the retrieved job was throttled and requeued. Callers simply poll again.
    ///
    /// # Errors
    ///
    /// Returns `FetchError` if the backend fails, or if a throttled job cannot be requeued.
    pub async fn retrieve_work(&self) -> Result<Option<B::Work>, FetchError> {
        let excluded = self.exclusions.snapshot();
        let Some(work) = self
            .backend
            .retrieve_work(&excluded)
            .await
            .map_err(FetchError::Backend)?
        else {
            return Ok(None);
        };

        let job = match JobMessage::parse(work.raw_message()) {
            Ok(job) => job,
            Err(err) => {
                warn!(queue = work.queue_name(), error = %err, "admitting undecodable job");
                self.instruments.fail_open.add(1, &[]);
                return Ok(Some(work));
            }
        };
        if !self.is_throttled(job).await {
            return Ok(Some(work));
        }

        let queue = work.queue_name().to_string();
        self.backend
            .requeue_throttled(work)
            .await
            .map_err(FetchError::Requeue)?;
        self.exclusions.add(&queue, self.cooldown);
        Ok(None)
    }

    /// Return unfinished work to the backend.
    pub async fn bulk_requeue(&self, work: Vec<B::Work>) -> Result<(), FetchError> {
        self.backend
            .bulk_requeue(work)
            .await
            .map_err(FetchError::Backend)
    }

    async fn is_throttled(&self, job: JobMessage) -> bool {
        let (job, outcome) = if self.registry.store().is_blocking() {
            let registry = Arc::clone(&self.registry);
            let checked = tokio::task::spawn_blocking(move || {
                let outcome = registry.check_job(&job);
                (job, outcome)
            })
            .await;
            match checked {
                Ok(checked) => checked,
                Err(err) => {
                    warn!(error = %err, "admitting job whose check did not complete");
                    self.instruments.fail_open.add(1, &[]);
                    return false;
                }
            }
        } else {
            let outcome = self.registry.check_job(&job);
            (job, outcome)
        };

        let class = job.effective_class();
        let labels = [KeyValue::new("class", class.to_string())];
        match outcome {
            Ok(ControlFlow::Continue(())) => {
                self.instruments.admitted.add(1, &labels);
                false
            }
            Ok(ControlFlow::Break(reason)) => {
                match reason {
                    Reason::Concurrency { limit } => {
                        debug!(class, jid = %job.jid, limit, "concurrency limit reached")
                    }
                    Reason::Threshold { limit, retry_after } => {
                        debug!(class, jid = %job.jid, limit, ?retry_after, "threshold reached")
                    }
                }
                self.instruments.throttled.add(1, &labels);
                true
            }
            Err(err) => {
                warn!(class, jid = %job.jid, error = %err, "admitting job that could not be checked");
                self.instruments.fail_open.add(1, &labels);
                false
            }
        }
    }
}
