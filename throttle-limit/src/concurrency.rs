use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::ConcurrencyOptions;
use super::CounterStore;
use super::Dynamic;
use super::Limiter;
use super::Reason;
use super::Reservation;
use super::StoreError;

/// Caps the number of simultaneously running instances of a job class.
///
/// Each admitted job id holds one slot until it is finalized, or until its reservation
/// outlives `ttl`.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    key: String,
    limit: Dynamic<i64>,
    key_suffix: Option<Dynamic<String>>,
    ttl: Duration,
    store: Arc<dyn CounterStore>,
}

impl ConcurrencyLimiter {
    pub fn new(class: &str, options: &ConcurrencyOptions, store: Arc<dyn CounterStore>) -> Self {
        Self {
            key: format!("throttled:{class}:concurrency"),
            limit: options.limit.clone(),
            key_suffix: options.key_suffix.clone(),
            ttl: options.ttl,
            store,
        }
    }

    fn key(&self, args: &[Value]) -> String {
        match &self.key_suffix {
            Some(suffix) => format!("{}:{}", self.key, suffix.resolve(args)),
            None => self.key.clone(),
        }
    }

    /// Like [`Limiter::check`], but tells a newly taken slot apart from one `jid` already
    /// held.
    pub fn reserve(
        &self,
        jid: &str,
        args: &[Value],
    ) -> Result<ControlFlow<Reason, Reservation>, StoreError> {
        let limit = self.limit.resolve(args);
        if limit <= 0 {
            return Ok(ControlFlow::Break(Reason::Concurrency { limit }));
        }

        match self
            .store
            .reserve(&self.key(args), jid, limit as u64, self.ttl)?
        {
            Reservation::Full => Ok(ControlFlow::Break(Reason::Concurrency { limit })),
            reservation => Ok(ControlFlow::Continue(reservation)),
        }
    }

    /// The number of slots currently held in the pool `args` map to.
    pub fn count(&self, args: &[Value]) -> Result<u64, StoreError> {
        self.store.occupancy(&self.key(args))
    }
}

impl Limiter for ConcurrencyLimiter {
    fn check(&self, jid: &str, args: &[Value]) -> Result<ControlFlow<Reason>, StoreError> {
        Ok(match self.reserve(jid, args)? {
            ControlFlow::Continue(_) => ControlFlow::Continue(()),
            ControlFlow::Break(reason) => ControlFlow::Break(reason),
        })
    }

    fn finalize(&self, jid: &str, args: &[Value]) -> Result<(), StoreError> {
        self.store.release(&self.key(args), jid)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::MemoryStore;

    fn limiter(options: ConcurrencyOptions) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new("Bar", &options, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn it_enforces_limits() {
        let rl = limiter(ConcurrencyOptions::new(2));

        assert_eq!(rl.check("a", &[]).unwrap(), ControlFlow::Continue(()));
        assert_eq!(rl.check("b", &[]).unwrap(), ControlFlow::Continue(()));
        assert_eq!(
            rl.check("c", &[]).unwrap(),
            ControlFlow::Break(Reason::Concurrency { limit: 2 })
        );
        assert_eq!(rl.count(&[]).unwrap(), 2);
    }

    #[test]
    fn it_does_not_double_reserve() {
        let rl = limiter(ConcurrencyOptions::new(2));

        assert!(rl.check("a", &[]).unwrap().is_continue());
        assert!(rl.check("a", &[]).unwrap().is_continue());
        assert_eq!(rl.count(&[]).unwrap(), 1);
        assert!(rl.check("b", &[]).unwrap().is_continue());
    }

    #[test]
    fn test_reserve_reports_held_slots() {
        let rl = limiter(ConcurrencyOptions::new(1));

        assert_eq!(
            rl.reserve("a", &[]).unwrap(),
            ControlFlow::Continue(Reservation::Taken)
        );
        assert_eq!(
            rl.reserve("a", &[]).unwrap(),
            ControlFlow::Continue(Reservation::Held)
        );
        assert_eq!(
            rl.reserve("b", &[]).unwrap(),
            ControlFlow::Break(Reason::Concurrency { limit: 1 })
        );
    }

    #[test]
    fn it_releases_on_finalize() {
        let rl = limiter(ConcurrencyOptions::new(1));

        assert!(rl.check("a", &[]).unwrap().is_continue());
        assert!(rl.check("b", &[]).unwrap().is_break());

        rl.finalize("a", &[]).unwrap();
        assert!(rl.check("b", &[]).unwrap().is_continue());
    }

    #[test]
    fn test_double_finalize_does_not_over_release() {
        let rl = limiter(ConcurrencyOptions::new(1));

        assert!(rl.check("a", &[]).unwrap().is_continue());
        rl.finalize("a", &[]).unwrap();
        rl.finalize("a", &[]).unwrap();
        rl.finalize("never-admitted", &[]).unwrap();

        assert!(rl.check("b", &[]).unwrap().is_continue());
        assert!(rl.check("c", &[]).unwrap().is_break());
    }

    #[test]
    fn test_non_positive_limit_always_throttles() {
        let rl = limiter(ConcurrencyOptions::new(0));
        assert!(rl.check("a", &[]).unwrap().is_break());

        let rl = limiter(ConcurrencyOptions::new(-3));
        assert!(rl.check("a", &[]).unwrap().is_break());
        assert_eq!(rl.count(&[]).unwrap(), 0);
    }

    #[test]
    fn test_key_suffix_partitions_pool() {
        let rl = limiter(
            ConcurrencyOptions::new(1).with_key_suffix(|args| {
                args.first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            }),
        );

        assert!(rl.check("a", &[json!("acme")]).unwrap().is_continue());
        assert!(rl.check("b", &[json!("acme")]).unwrap().is_break());
        assert!(rl.check("c", &[json!("globex")]).unwrap().is_continue());

        rl.finalize("a", &[json!("acme")]).unwrap();
        assert!(rl.check("b", &[json!("acme")]).unwrap().is_continue());
    }

    #[test]
    fn test_dynamic_limit_uses_current_args() {
        let rl = limiter(ConcurrencyOptions::dynamic(|args| {
            args.first().and_then(Value::as_i64).unwrap_or(0)
        }));

        assert!(rl.check("a", &[json!(1)]).unwrap().is_continue());
        assert!(rl.check("b", &[json!(1)]).unwrap().is_break());
        assert!(rl.check("b", &[json!(2)]).unwrap().is_continue());
    }

    #[tokio::test]
    async fn test_actual_concurrency() {
        let capacity = 100;
        let rl = Arc::new(limiter(ConcurrencyOptions::new(capacity)));

        let mut handles = vec![];
        for i in 0..capacity + 10 {
            let rl_clone = Arc::clone(&rl);
            handles.push(tokio::spawn(async move {
                rl_clone.check(&format!("jid-{i}"), &[])
            }));
        }

        let results = futures::future::join_all(handles).await;
        let success_count = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(ControlFlow::Continue(())))))
            .count();

        // Even with multiple tasks, exactly 'capacity' should be admitted
        assert_eq!(success_count, capacity as usize);
        assert_eq!(rl.count(&[]).unwrap(), capacity as u64);
    }
}
