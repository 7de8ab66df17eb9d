//! A counter store shared by every worker process through Redis.
//!
//! Each check-and-mutate runs as one Lua script, which Redis executes atomically.
//!
//! - **Reservations**: a sorted set per key, scored by expiry in milliseconds.
//! - **Windows**: a counter per key that expires `period` after its first increment.

use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;

use parking_lot::Mutex;
use redis::Script;

use crate::CounterStore;
use crate::Reservation;
use crate::StoreError;
use crate::store::MAX_EXPIRY;

/// Idle connections kept for reuse. Busier moments open extra ones that are closed after use.
const MAX_IDLE: usize = 16;

const RESERVE: &str = r#"
local key, member = KEYS[1], ARGV[1]
local limit, ttl = tonumber(ARGV[2]), tonumber(ARGV[3])
local t = redis.call("TIME")
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

redis.call("ZREMRANGEBYSCORE", key, "-inf", now)

local held = redis.call("ZSCORE", key, member)
if not held and redis.call("ZCARD", key) >= limit then
  return 0
end

redis.call("ZADD", key, now + ttl, member)
redis.call("PEXPIRE", key, ttl)

if held then
  return 2
end
return 1
"#;

const OCCUPANCY: &str = r#"
local t = redis.call("TIME")
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", now)
return redis.call("ZCARD", KEYS[1])
"#;

const INCREMENT: &str = r#"
local key = KEYS[1]
local limit, period = tonumber(ARGV[1]), tonumber(ARGV[2])

if tonumber(redis.call("GET", key) or "0") >= limit then
  return {0, redis.call("PTTL", key)}
end

if redis.call("INCR", key) == 1 then
  redis.call("PEXPIRE", key, period)
end

return {1, redis.call("PTTL", key)}
"#;

/// A counter store shared by every worker process through Redis.
///
/// Operations block the calling thread on network I/O, so [`CounterStore::is_blocking`]
/// is true. Each operation checks out its own connection; concurrent callers never wait
/// on each other's round trips.
pub struct RedisStore {
    client: redis::Client,
    idle: Mutex<Vec<redis::Connection>>,
    reserve: Script,
    occupancy: Script,
    increment: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &self.client)
            .field("idle", &self.idle.lock().len())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for `redis_url`, e.g. "redis://localhost:6379".
    ///
    /// Connections are opened lazily by the operations that need them.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            reserve: Script::new(RESERVE),
            occupancy: Script::new(OCCUPANCY),
            increment: Script::new(INCREMENT),
        })
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, StoreError> {
        // The lock is only held to check a connection in or out, never across I/O
        let idle = self.idle.lock().pop();
        let mut conn = match idle {
            Some(conn) => conn,
            None => self
                .client
                .get_connection()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?,
        };

        match f(&mut conn) {
            Ok(value) => {
                self.check_in(conn);
                Ok(value)
            }
            Err(e) => {
                // Broken connections are dropped; a fresh one is opened next time
                if !(e.is_io_error() || e.is_connection_dropped()) {
                    self.check_in(conn);
                }
                Err(StoreError::Command(e.to_string()))
            }
        }
    }

    fn check_in(&self, conn: redis::Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    (duration.min(MAX_EXPIRY).as_millis() as u64).max(1)
}

impl CounterStore for RedisStore {
    fn reserve(
        &self,
        key: &str,
        member: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<Reservation, StoreError> {
        let reserved: i64 = self.with_connection(|conn| {
            self.reserve
                .key(key)
                .arg(member)
                .arg(limit)
                .arg(millis(ttl))
                .invoke(conn)
        })?;
        Ok(match reserved {
            2 => Reservation::Held,
            1 => Reservation::Taken,
            _ => Reservation::Full,
        })
    }

    fn release(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| redis::cmd("ZREM").arg(key).arg(member).query(conn))
    }

    fn occupancy(&self, key: &str) -> Result<u64, StoreError> {
        self.with_connection(|conn| self.occupancy.key(key).invoke(conn))
    }

    fn increment(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
    ) -> Result<ControlFlow<Duration>, StoreError> {
        let (admitted, ttl): (i64, i64) = self.with_connection(|conn| {
            self.increment
                .key(key)
                .arg(limit)
                .arg(millis(period))
                .invoke(conn)
        })?;

        if admitted == 1 {
            Ok(ControlFlow::Continue(()))
        } else {
            // PTTL is negative when the key vanished between calls
            Ok(ControlFlow::Break(Duration::from_millis(ttl.max(0) as u64)))
        }
    }

    fn window_count(&self, key: &str) -> Result<u64, StoreError> {
        let count: Option<u64> =
            self.with_connection(|conn| redis::cmd("GET").arg(key).query(conn))?;
        Ok(count.unwrap_or(0))
    }

    fn is_blocking(&self) -> bool {
        true
    }
}
