use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::ConcurrencyLimiter;
use super::CounterStore;
use super::Limiter;
use super::Reason;
use super::Reservation;
use super::StoreError;
use super::ThresholdLimiter;
use super::ThrottleOptions;

/// The limiter configured for a job class.
#[derive(Debug)]
pub enum Strategy {
    /// Never throttles. Used for classes without limits and for unregistered classes.
    Unthrottled,
    Concurrency(ConcurrencyLimiter),
    Threshold(ThresholdLimiter),
    /// Admits a job only if every member admits it.
    All(Vec<Strategy>),
}

impl Strategy {
    /// Build the strategy for `class` from its declared options.
    ///
    /// Concurrency is checked before threshold, so a job that is turned away for lack of
    /// a slot never consumes part of a threshold window.
    pub fn new(class: &str, options: &ThrottleOptions, store: Arc<dyn CounterStore>) -> Self {
        let mut limiters = Vec::with_capacity(2);
        if let Some(concurrency) = &options.concurrency {
            limiters.push(Strategy::Concurrency(ConcurrencyLimiter::new(
                class,
                concurrency,
                Arc::clone(&store),
            )));
        }
        if let Some(threshold) = &options.threshold {
            limiters.push(Strategy::Threshold(ThresholdLimiter::new(
                class, threshold, store,
            )));
        }

        match limiters.len() {
            0 => Strategy::Unthrottled,
            1 => limiters.remove(0),
            _ => Strategy::All(limiters),
        }
    }

    pub fn is_unthrottled(&self) -> bool {
        matches!(self, Strategy::Unthrottled)
    }

    /// Checks every member, recording the concurrency slots this call took for `jid`.
    ///
    /// Slots `jid` already held before the call are not recorded.
    fn admit<'a>(
        &'a self,
        jid: &str,
        args: &[Value],
        taken: &mut Vec<&'a ConcurrencyLimiter>,
    ) -> Result<ControlFlow<Reason>, StoreError> {
        match self {
            Strategy::Unthrottled => Ok(ControlFlow::Continue(())),
            Strategy::Concurrency(limiter) => match limiter.reserve(jid, args)? {
                ControlFlow::Continue(Reservation::Taken) => {
                    taken.push(limiter);
                    Ok(ControlFlow::Continue(()))
                }
                ControlFlow::Continue(_) => Ok(ControlFlow::Continue(())),
                ControlFlow::Break(reason) => Ok(ControlFlow::Break(reason)),
            },
            Strategy::Threshold(limiter) => limiter.check(jid, args),
            Strategy::All(limiters) => {
                for limiter in limiters {
                    if let ControlFlow::Break(reason) = limiter.admit(jid, args, taken)? {
                        return Ok(ControlFlow::Break(reason));
                    }
                }
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    /// Release the slots a partially admitted check took.
    fn rollback(taken: &[&ConcurrencyLimiter], jid: &str, args: &[Value]) {
        for limiter in taken {
            if let Err(err) = limiter.finalize(jid, args) {
                warn!(jid, error = %err, "failed to roll back partial admission");
            }
        }
    }
}

impl Limiter for Strategy {
    fn check(&self, jid: &str, args: &[Value]) -> Result<ControlFlow<Reason>, StoreError> {
        match self {
            Strategy::Unthrottled => Ok(ControlFlow::Continue(())),
            Strategy::Concurrency(limiter) => limiter.check(jid, args),
            Strategy::Threshold(limiter) => limiter.check(jid, args),
            Strategy::All(_) => {
                let mut taken = Vec::new();
                let outcome = self.admit(jid, args, &mut taken);
                if !matches!(outcome, Ok(ControlFlow::Continue(()))) {
                    Self::rollback(&taken, jid, args);
                }
                outcome
            }
        }
    }

    fn finalize(&self, jid: &str, args: &[Value]) -> Result<(), StoreError> {
        match self {
            Strategy::Unthrottled => Ok(()),
            Strategy::Concurrency(limiter) => limiter.finalize(jid, args),
            Strategy::Threshold(limiter) => limiter.finalize(jid, args),
            Strategy::All(limiters) => {
                // Every member is released even if an earlier one fails
                let mut result = Ok(());
                for limiter in limiters {
                    if let Err(err) = limiter.finalize(jid, args)
                        && result.is_ok()
                    {
                        result = Err(err);
                    }
                }
                result
            }
        }
    }
}
