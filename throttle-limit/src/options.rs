use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

/// How long a concurrency reservation survives if it is never released.
pub const DEFAULT_CONCURRENCY_TTL: Duration = Duration::from_secs(15 * 60);

/// A value which is either fixed at registration time or computed from each job's
/// arguments.
pub enum Dynamic<T> {
    Fixed(T),
    Computed(Arc<dyn Fn(&[Value]) -> T + Send + Sync>),
}

impl<T: Clone> Dynamic<T> {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> T + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// Evaluate against the arguments of the job being checked.
    pub fn resolve(&self, args: &[Value]) -> T {
        match self {
            Self::Fixed(value) => value.clone(),
            Self::Computed(f) => f(args),
        }
    }
}

impl<T> From<T> for Dynamic<T> {
    fn from(value: T) -> Self {
        Self::Fixed(value)
    }
}

// Arc<dyn Fn> prevents deriving these
impl<T: Clone> Clone for Dynamic<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(value) => Self::Fixed(value.clone()),
            Self::Computed(f) => Self::Computed(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Dynamic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Options for a concurrency limiter.
#[derive(Clone, Debug)]
pub struct ConcurrencyOptions {
    pub limit: Dynamic<i64>,
    /// Partitions the pool, e.g. one limit per tenant instead of one per class.
    pub key_suffix: Option<Dynamic<String>>,
    /// Lifetime of a reservation that is never released.
    pub ttl: Duration,
}

impl ConcurrencyOptions {
    pub fn new(limit: i64) -> Self {
        Self {
            limit: Dynamic::Fixed(limit),
            key_suffix: None,
            ttl: DEFAULT_CONCURRENCY_TTL,
        }
    }

    pub fn dynamic<F>(limit: F) -> Self
    where
        F: Fn(&[Value]) -> i64 + Send + Sync + 'static,
    {
        Self {
            limit: Dynamic::computed(limit),
            ..Self::new(0)
        }
    }

    pub fn with_key_suffix<F>(mut self, suffix: F) -> Self
    where
        F: Fn(&[Value]) -> String + Send + Sync + 'static,
    {
        self.key_suffix = Some(Dynamic::computed(suffix));
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Options for a threshold limiter.
#[derive(Clone, Debug)]
pub struct ThresholdOptions {
    pub limit: Dynamic<i64>,
    pub period: Dynamic<Duration>,
    pub key_suffix: Option<Dynamic<String>>,
}

impl ThresholdOptions {
    pub fn new(limit: i64, period: Duration) -> Self {
        Self {
            limit: Dynamic::Fixed(limit),
            period: Dynamic::Fixed(period),
            key_suffix: None,
        }
    }

    pub fn with_dynamic_limit<F>(mut self, limit: F) -> Self
    where
        F: Fn(&[Value]) -> i64 + Send + Sync + 'static,
    {
        self.limit = Dynamic::computed(limit);
        self
    }

    pub fn with_dynamic_period<F>(mut self, period: F) -> Self
    where
        F: Fn(&[Value]) -> Duration + Send + Sync + 'static,
    {
        self.period = Dynamic::computed(period);
        self
    }

    pub fn with_key_suffix<F>(mut self, suffix: F) -> Self
    where
        F: Fn(&[Value]) -> String + Send + Sync + 'static,
    {
        self.key_suffix = Some(Dynamic::computed(suffix));
        self
    }
}

/// Throttling options declared for a job class.
///
/// A class with neither constraint is never throttled. With both, a job is admitted only
/// if it passes both.
#[derive(Clone, Debug, Default)]
pub struct ThrottleOptions {
    pub concurrency: Option<ConcurrencyOptions>,
    pub threshold: Option<ThresholdOptions>,
}

impl ThrottleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyOptions) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_threshold(mut self, threshold: ThresholdOptions) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn it_resolves_with_each_calls_args() {
        let limit: Dynamic<i64> =
            Dynamic::computed(|args| args.iter().filter_map(Value::as_i64).sum());

        assert_eq!(limit.resolve(&[json!(2), json!(3)]), 5);
        assert_eq!(limit.resolve(&[json!(10)]), 10);
        assert_eq!(Dynamic::from(7_i64).resolve(&[json!(10)]), 7);
    }

    #[test]
    fn it_builds_options() {
        let options = ThrottleOptions::new()
            .with_concurrency(
                ConcurrencyOptions::new(3)
                    .with_key_suffix(|args| args[0].to_string())
                    .with_ttl(Duration::from_secs(60)),
            )
            .with_threshold(ThresholdOptions::new(5, Duration::from_secs(10)));

        let concurrency = options.concurrency.unwrap();
        assert_eq!(concurrency.limit.resolve(&[]), 3);
        assert_eq!(concurrency.ttl, Duration::from_secs(60));
        assert_eq!(
            concurrency.key_suffix.unwrap().resolve(&[json!("acme")]),
            "\"acme\""
        );
        assert_eq!(
            options.threshold.unwrap().period.resolve(&[]),
            Duration::from_secs(10)
        );
    }
}
