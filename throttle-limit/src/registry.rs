use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::CheckError;
use super::CounterStore;
use super::JobMessage;
use super::Limiter;
use super::MemoryStore;
use super::Reason;
use super::Strategy;
use super::ThrottleOptions;

/// Maps job class names to their strategies.
///
/// A registry is built at startup and shared by reference with everything that checks or
/// releases limits. Lookups never fail: unknown classes get a strategy that never
/// throttles.
#[derive(Debug)]
pub struct Registry {
    store: Arc<dyn CounterStore>,
    strategies: RwLock<HashMap<String, Arc<Strategy>>>,
    unthrottled: Arc<Strategy>,
}

impl Registry {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            strategies: RwLock::new(HashMap::new()),
            unthrottled: Arc::new(Strategy::Unthrottled),
        }
    }

    /// A registry backed by a private [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Build and register the strategy for `class`, replacing any previous one.
    pub fn add(&self, class: impl Into<String>, options: &ThrottleOptions) -> Arc<Strategy> {
        let class = class.into();
        let strategy = Arc::new(Strategy::new(&class, options, Arc::clone(&self.store)));
        debug!(class = %class, ?strategy, "registered throttling strategy");
        self.strategies
            .write()
            .insert(class, Arc::clone(&strategy));
        strategy
    }

    /// Make `alias` share the strategy, and therefore the counters, of `class`.
    ///
    /// Returns `false` if `class` is not registered.
    pub fn add_alias(&self, alias: impl Into<String>, class: &str) -> bool {
        let mut strategies = self.strategies.write();
        match strategies.get(class).cloned() {
            Some(strategy) => {
                strategies.insert(alias.into(), strategy);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, class: &str) -> Option<Arc<Strategy>> {
        self.strategies.write().remove(class)
    }

    /// The registered strategy for `class`, or one that never throttles.
    pub fn get(&self, class: &str) -> Arc<Strategy> {
        self.get_registered(class)
            .unwrap_or_else(|| Arc::clone(&self.unthrottled))
    }

    pub fn get_registered(&self, class: &str) -> Option<Arc<Strategy>> {
        self.strategies.read().get(class).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Check a decoded job against the strategy of its effective class.
    pub fn check_job(&self, job: &JobMessage) -> Result<ControlFlow<Reason>, CheckError> {
        Ok(self
            .get(job.effective_class())
            .check(&job.jid, &job.args)?)
    }

    /// Release whatever the strategy of the job's effective class holds for it.
    pub fn finalize_job(&self, job: &JobMessage) -> Result<(), CheckError> {
        Ok(self
            .get(job.effective_class())
            .finalize(&job.jid, &job.args)?)
    }

    /// Check a raw payload.
    pub fn check_message(&self, raw: &str) -> Result<ControlFlow<Reason>, CheckError> {
        self.check_job(&JobMessage::parse(raw)?)
    }

    /// Tells whether the job in `raw` is throttled.
    ///
    /// Anything that prevents an answer, including malformed payloads and store errors,
    /// reads as not throttled. Like any check, an admitted answer may reserve a slot.
    pub fn is_throttled(&self, raw: &str) -> bool {
        matches!(self.check_message(raw), Ok(ControlFlow::Break(_)))
    }

    /// Release the limits held by a job that will never finish, e.g. one orphaned by a
    /// crashed worker.
    ///
    /// Returns `true` if a registered strategy released the job.
    pub fn recover(&self, raw: &str) -> bool {
        let Ok(job) = JobMessage::parse(raw) else {
            return false;
        };
        match self.get_registered(job.effective_class()) {
            Some(strategy) => strategy.finalize(&job.jid, &job.args).is_ok(),
            None => false,
        }
    }
}
