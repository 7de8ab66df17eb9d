use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::CounterStore;
use super::Dynamic;
use super::Limiter;
use super::Reason;
use super::StoreError;
use super::ThresholdOptions;

/// Caps the number of admissions of a job class per window.
///
/// Windows are fixed, starting at the first admission and lasting `period`. This allows
/// bursts at window edges in exchange for O(1) checks.
#[derive(Debug)]
pub struct ThresholdLimiter {
    key: String,
    limit: Dynamic<i64>,
    period: Dynamic<Duration>,
    key_suffix: Option<Dynamic<String>>,
    store: Arc<dyn CounterStore>,
}

impl ThresholdLimiter {
    pub fn new(class: &str, options: &ThresholdOptions, store: Arc<dyn CounterStore>) -> Self {
        Self {
            key: format!("throttled:{class}:threshold"),
            limit: options.limit.clone(),
            period: options.period.clone(),
            key_suffix: options.key_suffix.clone(),
            store,
        }
    }

    fn key(&self, args: &[Value]) -> String {
        match &self.key_suffix {
            Some(suffix) => format!("{}:{}", self.key, suffix.resolve(args)),
            None => self.key.clone(),
        }
    }

    /// The number of admissions in the current window `args` map to.
    pub fn count(&self, args: &[Value]) -> Result<u64, StoreError> {
        self.store.window_count(&self.key(args))
    }
}

impl Limiter for ThresholdLimiter {
    fn check(&self, _jid: &str, args: &[Value]) -> Result<ControlFlow<Reason>, StoreError> {
        let limit = self.limit.resolve(args);
        let period = self.period.resolve(args);
        if limit <= 0 {
            return Ok(ControlFlow::Break(Reason::Threshold {
                limit,
                retry_after: period,
            }));
        }

        match self.store.increment(&self.key(args), limit as u64, period)? {
            ControlFlow::Continue(()) => Ok(ControlFlow::Continue(())),
            ControlFlow::Break(retry_after) => {
                Ok(ControlFlow::Break(Reason::Threshold { limit, retry_after }))
            }
        }
    }

    fn finalize(&self, _jid: &str, _args: &[Value]) -> Result<(), StoreError> {
        Ok(())
    }
}
