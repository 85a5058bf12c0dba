//! Redis-backed window store.
//!
//! Each window is a sorted set of entry timestamps (score = member time in ms). All three
//! operations run as Lua scripts, so prune, count, and conditional insert are atomic on the
//! server and safe across processes sharing the same Redis.

use super::store::{StoreError, WindowRequest, WindowStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::fmt;

// KEYS[1] = window key; ARGV[1] = now ms; ARGV[2] = window ms
const COUNT_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[2]))
return redis.call('ZCARD', KEYS[1])
"#;

// ARGV[3] = unique member; ARGV[4] = key expiry in seconds
const INSERT_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[2]))
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return redis.call('ZCARD', KEYS[1])
"#;

// ARGV[5] = limit; returns the count before the conditional insert
const INSERT_BELOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[2]))
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[5]) then
  return count
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return count
"#;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

/// Sliding windows in Redis sorted sets.
#[derive(Clone)]
pub struct RedisWindowStore {
    connection: ConnectionManager,
    count: Script,
    insert: Script,
    insert_below: Script,
}

impl fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisWindowStore").finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Connect to Redis (e.g. `redis://127.0.0.1/`). The connection manager reconnects on its own
    /// after the initial connection succeeds.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            count: Script::new(COUNT_SCRIPT),
            insert: Script::new(INSERT_SCRIPT),
            insert_below: Script::new(INSERT_BELOW_SCRIPT),
        })
    }

    /// Unique sorted-set member so two entries in the same millisecond are both kept.
    fn member(now_ms: i64) -> String {
        format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple())
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn count(&self, req: WindowRequest<'_>) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let n: u64 = self
            .count
            .key(req.key)
            .arg(req.now_ms)
            .arg(req.window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(n)
    }

    async fn insert(&self, req: WindowRequest<'_>) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let n: u64 = self
            .insert
            .key(req.key)
            .arg(req.now_ms)
            .arg(req.window_ms)
            .arg(Self::member(req.now_ms))
            .arg(req.expiry_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(n)
    }

    async fn insert_below(&self, req: WindowRequest<'_>, limit: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let n: u64 = self
            .insert_below
            .key(req.key)
            .arg(req.now_ms)
            .arg(req.window_ms)
            .arg(Self::member(req.now_ms))
            .arg(req.expiry_secs)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(n)
    }
}
