use std::fmt;
use std::sync::Arc;

use throttle_limit::JobMessage;
use throttle_limit::Limiter;
use throttle_limit::Registry;
use tracing::debug;
use tracing::error;
use tracing::warn;

/// Called by a backend with the raw payload of every job it recovers from a dead worker.
pub type OrphanHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Releases the limits held by orphaned jobs, then hands them to the next handler.
///
/// A job orphaned while running never reaches its finalizer, so without recovery its
/// concurrency slot stays held until the reservation ttl lapses.
#[derive(Clone)]
pub struct OrphanRecovery {
    registry: Arc<Registry>,
    downstream: Option<OrphanHandler>,
}

impl fmt::Debug for OrphanRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrphanRecovery")
            .field("registry", &self.registry)
            .field("downstream", &self.downstream.is_some())
            .finish()
    }
}

impl OrphanRecovery {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            downstream: None,
        }
    }

    /// Forward every orphan to `handler` after recovery.
    pub fn with_downstream(mut self, handler: OrphanHandler) -> Self {
        self.downstream = Some(handler);
        self
    }

    /// Build a handler that recovers limits and then calls `previous`, if any.
    ///
    /// Install the result in place of the backend's current handler.
    pub fn chain(registry: Arc<Registry>, previous: Option<OrphanHandler>) -> OrphanHandler {
        let mut recovery = Self::new(registry);
        recovery.downstream = previous;
        recovery.into_handler()
    }

    pub fn into_handler(self) -> OrphanHandler {
        Arc::new(move |raw: &str| self.handle(raw))
    }

    /// Recover `raw`. The downstream handler is called whatever the outcome.
    pub fn handle(&self, raw: &str) {
        self.release(raw);
        if let Some(downstream) = &self.downstream {
            downstream(raw);
        }
    }

    fn release(&self, raw: &str) {
        let job = match JobMessage::parse(raw) {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "cannot recover limits of undecodable orphan");
                return;
            }
        };

        let class = job.effective_class();
        let Some(strategy) = self.registry.get_registered(class) else {
            return;
        };

        match strategy.finalize(&job.jid, &job.args) {
            Ok(()) => debug!(class, jid = %job.jid, "recovered limits of orphaned job"),
            Err(err) => error!(class, jid = %job.jid, error = %err, "failed to recover orphaned job"),
        }
    }
}
