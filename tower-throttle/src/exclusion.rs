use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;

// Cooldowns beyond this are treated as this
const MAX_COOLDOWN: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Queues that must not be polled until their cooldown expires.
///
/// There is no background sweeper: expired entries are pruned whenever the set is read.
/// The set is per process and only filters that process's polling.
#[derive(Debug)]
pub struct ExclusionSet {
    entries: Mutex<HashMap<String, Instant>>,
    clock: Clock,
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Exclude `queue` for `cooldown`. An existing later expiry is kept.
    pub fn add(&self, queue: &str, cooldown: Duration) {
        let now = self.clock.now();
        let expires = now.checked_add(cooldown.min(MAX_COOLDOWN)).unwrap_or(now);
        let mut entries = self.entries.lock();
        match entries.get_mut(queue) {
            Some(current) => *current = (*current).max(expires),
            None => {
                entries.insert(queue.to_string(), expires);
            }
        }
    }

    /// The queues currently excluded.
    pub fn snapshot(&self) -> HashSet<String> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);
        entries.keys().cloned().collect()
    }

    pub fn contains(&self, queue: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(queue)
            .is_some_and(|expires| *expires > now)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn it_expires_entries() {
        let (clock, mock) = Clock::mock();
        let set = ExclusionSet::with_clock(clock);

        set.add("q", Duration::from_millis(100));
        assert!(set.snapshot().contains("q"));
        assert!(set.contains("q"));

        mock.increment(Duration::from_millis(99));
        assert_eq!(set.len(), 1);

        mock.increment(Duration::from_millis(1));
        assert!(set.snapshot().is_empty());
        assert!(!set.contains("q"));
        assert!(set.is_empty());
    }

    #[test]
    fn it_refreshes_without_shortening() {
        let (clock, mock) = Clock::mock();
        let set = ExclusionSet::with_clock(clock);

        set.add("q", Duration::from_millis(100));
        mock.increment(Duration::from_millis(50));
        // Refresh extends to 150ms
        set.add("q", Duration::from_millis(100));
        // A shorter cooldown does not pull the expiry back
        set.add("q", Duration::from_millis(10));

        mock.increment(Duration::from_millis(60));
        assert!(set.contains("q"));

        mock.increment(Duration::from_millis(40));
        assert!(!set.contains("q"));
    }

    #[test]
    fn it_tracks_queues_independently() {
        let (clock, mock) = Clock::mock();
        let set = ExclusionSet::with_clock(clock);

        set.add("heroes", Duration::from_millis(10));
        set.add("dreamers", Duration::from_millis(30));
        assert_eq!(set.len(), 2);

        mock.increment(Duration::from_millis(20));
        let snapshot = set.snapshot();
        assert!(!snapshot.contains("heroes"));
        assert!(snapshot.contains("dreamers"));
    }

    #[test]
    fn test_unbounded_cooldown_saturates() {
        let (clock, mock) = Clock::mock();
        let set = ExclusionSet::with_clock(clock);

        set.add("q", Duration::MAX);
        mock.increment(Duration::from_secs(365 * 24 * 60 * 60));
        assert!(set.contains("q"));
    }

    #[test]
    fn test_real_clock_expiry() {
        let set = ExclusionSet::new();
        set.add("q", Duration::from_millis(20));
        assert!(set.contains("q"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(set.is_empty());
    }

    #[test]
    fn test_concurrent_adds() {
        use std::thread;

        let set = Arc::new(ExclusionSet::new());
        let mut handles = vec![];
        for i in 0..8 {
            let set = Arc::clone(&set);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    set.add(&format!("queue-{}", i % 4), Duration::from_secs(60));
                    let _ = set.snapshot();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(set.len(), 4);
    }
}
