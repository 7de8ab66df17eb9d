use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;

use crate::StoreError;

/// Durations are capped to this before they are turned into expiries.
pub(crate) const MAX_EXPIRY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A full sweep of expired keys runs once per this many mutations.
const SWEEP_INTERVAL: u64 = 100;

/// The outcome of [`CounterStore::reserve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// The member took a free slot in this call.
    Taken,
    /// The member already held a slot. Its reservation was refreshed.
    Held,
    /// Every slot is taken by other members.
    Full,
}

impl Reservation {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Reservation::Full)
    }
}

/// The atomic counter operations limiters are built on.
///
/// Every method must execute as a single atomic step against state shared by all workers.
/// That is the only synchronisation limiters rely on.
pub trait CounterStore: Debug + Send + Sync {
    /// Adds `member` to the set at `key` unless the set already holds `limit` members.
    ///
    /// A member that is already present is admitted again without taking a second slot,
    /// and its reservation is refreshed to live for `ttl`.
    fn reserve(
        &self,
        key: &str,
        member: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<Reservation, StoreError>;

    /// Removes `member` from the set at `key`. Removing an absent member is a no-op.
    fn release(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// The number of live reservations at `key`.
    fn occupancy(&self, key: &str) -> Result<u64, StoreError>;

    /// Counts one admission in the window at `key` unless it already holds `limit`.
    ///
    /// A window starts with the first admission and lasts `period`. Rejected attempts are
    /// not counted. On rejection the time left in the window is returned.
    fn increment(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
    ) -> Result<ControlFlow<Duration>, StoreError>;

    /// The number of admissions in the current window at `key`.
    fn window_count(&self, key: &str) -> Result<u64, StoreError>;

    /// Whether operations wait on network I/O.
    ///
    /// Async callers run the operations of a blocking store on the runtime's blocking
    /// thread pool.
    fn is_blocking(&self) -> bool {
        false
    }
}

/// `now + duration`, capped at [`MAX_EXPIRY`] from now.
pub(crate) fn expiry(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration.min(MAX_EXPIRY)).unwrap_or(now)
}

#[derive(Debug)]
struct Window {
    count: u64,
    expires: Instant,
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<String, HashMap<String, Instant>>,
    windows: HashMap<String, Window>,
    mutations: u64,
}

impl State {
    // Keys are only dropped eagerly on release, so expired ones are swept periodically
    fn maybe_sweep(&mut self, now: Instant) {
        self.mutations = self.mutations.wrapping_add(1);
        if self.mutations % SWEEP_INTERVAL != 0 {
            return;
        }
        self.windows.retain(|_, window| window.expires > now);
        self.slots.retain(|_, members| {
            prune(members, now);
            !members.is_empty()
        });
    }
}

/// An in-process counter store.
///
/// A single mutex makes each operation atomic. Suitable for single process deployments
/// and tests; multi process deployments need a shared store.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Clock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }
}

fn prune(members: &mut HashMap<String, Instant>, now: Instant) {
    members.retain(|_, expires| *expires > now);
}

impl CounterStore for MemoryStore {
    fn reserve(
        &self,
        key: &str,
        member: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<Reservation, StoreError> {
        let now = self.clock.now();
        let expires = expiry(now, ttl);
        let mut state = self.state.lock();
        state.maybe_sweep(now);
        let members = state.slots.entry(key.to_string()).or_default();
        prune(members, now);

        if let Some(current) = members.get_mut(member) {
            *current = expires;
            return Ok(Reservation::Held);
        }
        if members.len() as u64 >= limit {
            return Ok(Reservation::Full);
        }
        members.insert(member.to_string(), expires);
        Ok(Reservation::Taken)
    }

    fn release(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(members) = state.slots.get_mut(key) {
            members.remove(member);
            if members.is_empty() {
                state.slots.remove(key);
            }
        }
        Ok(())
    }

    fn occupancy(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let occupied = state.slots.get_mut(key).map_or(0, |members| {
            prune(members, now);
            members.len() as u64
        });
        if occupied == 0 {
            state.slots.remove(key);
        }
        Ok(occupied)
    }

    fn increment(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
    ) -> Result<ControlFlow<Duration>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.maybe_sweep(now);
        let window = state.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires: expiry(now, period),
        });

        if now >= window.expires {
            window.count = 0;
            window.expires = expiry(now, period);
        }
        if window.count >= limit {
            return Ok(ControlFlow::Break(
                window.expires.saturating_duration_since(now),
            ));
        }
        window.count += 1;
        Ok(ControlFlow::Continue(()))
    }

    fn window_count(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let state = self.state.lock();
        Ok(state
            .windows
            .get(key)
            .filter(|window| now < window.expires)
            .map_or(0, |window| window.count))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn it_reserves_up_to_limit() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.reserve("k", "a", 2, ttl).unwrap(), Reservation::Taken);
        assert_eq!(store.reserve("k", "b", 2, ttl).unwrap(), Reservation::Taken);
        assert_eq!(store.reserve("k", "c", 2, ttl).unwrap(), Reservation::Full);
        // Holding members are admitted again without a second slot
        assert_eq!(store.reserve("k", "a", 2, ttl).unwrap(), Reservation::Held);
        assert_eq!(store.occupancy("k").unwrap(), 2);

        store.release("k", "a").unwrap();
        store.release("k", "a").unwrap();
        assert_eq!(store.occupancy("k").unwrap(), 1);
        assert_eq!(store.reserve("k", "c", 2, ttl).unwrap(), Reservation::Taken);
    }

    #[test]
    fn it_expires_lost_reservations() {
        let (clock, mock) = Clock::mock();
        let store = MemoryStore::with_clock(clock);

        assert!(store.reserve("k", "a", 1, Duration::from_secs(5)).unwrap().is_admitted());
        assert!(!store.reserve("k", "b", 1, Duration::from_secs(5)).unwrap().is_admitted());

        mock.increment(Duration::from_secs(5));
        assert_eq!(store.occupancy("k").unwrap(), 0);
        assert_eq!(
            store.reserve("k", "b", 1, Duration::from_secs(5)).unwrap(),
            Reservation::Taken
        );
    }

    #[test]
    fn it_counts_fixed_windows() {
        let (clock, mock) = Clock::mock();
        let store = MemoryStore::with_clock(clock);
        let period = Duration::from_secs(10);

        for _ in 0..3 {
            assert!(store.increment("w", 3, period).unwrap().is_continue());
        }
        mock.increment(Duration::from_secs(4));
        assert_eq!(
            store.increment("w", 3, period).unwrap(),
            ControlFlow::Break(Duration::from_secs(6))
        );
        // Rejections do not count
        assert_eq!(store.window_count("w").unwrap(), 3);

        mock.increment(Duration::from_secs(6));
        assert_eq!(store.window_count("w").unwrap(), 0);
        assert!(store.increment("w", 3, period).unwrap().is_continue());
        assert_eq!(store.window_count("w").unwrap(), 1);
    }

    #[test]
    fn test_concurrent_reservations() {
        use std::thread;

        let store = Arc::new(MemoryStore::new());
        let mut handles = vec![];
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store
                    .reserve("k", &format!("jid-{i}"), 10, Duration::from_secs(60))
                    .unwrap()
            }));
        }

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|reservation| reservation.is_admitted())
            .count();
        assert_eq!(admitted, 10);
        assert_eq!(store.occupancy("k").unwrap(), 10);
    }

    #[test]
    fn test_sweeps_expired_keys() {
        let (clock, mock) = Clock::mock();
        let store = MemoryStore::with_clock(clock);
        let period = Duration::from_secs(10);

        for i in 0..1_000 {
            store.increment(&format!("w:{i}"), 5, period).unwrap();
            store.reserve(&format!("k:{i}"), "a", 1, period).unwrap();
        }
        mock.increment(Duration::from_secs(60));

        for _ in 0..SWEEP_INTERVAL {
            store.increment("w:live", 1_000, period).unwrap();
        }

        let state = store.state.lock();
        assert_eq!(state.windows.len(), 1);
        assert!(state.slots.is_empty());
    }

    #[test]
    fn test_occupancy_drops_empty_keys() {
        let (clock, mock) = Clock::mock();
        let store = MemoryStore::with_clock(clock);

        store.reserve("k", "a", 1, Duration::from_secs(1)).unwrap();
        mock.increment(Duration::from_secs(2));
        assert_eq!(store.occupancy("k").unwrap(), 0);
        assert!(store.state.lock().slots.is_empty());
    }

    #[test]
    fn test_huge_durations_saturate() {
        let store = MemoryStore::new();

        assert!(store.reserve("k", "a", 1, Duration::MAX).unwrap().is_admitted());
        assert!(store.increment("w", 1, Duration::MAX).unwrap().is_continue());
        assert!(store.increment("w", 1, Duration::MAX).unwrap().is_break());
        assert_eq!(store.occupancy("k").unwrap(), 1);
    }
}
