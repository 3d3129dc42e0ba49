//! Redis-backed coordination.
//!
//! Lease keys use `SET NX PX`; release and refresh are owner-checked Lua
//! scripts so a handle can never drop a lease someone else re-acquired.
//! The waiter queue is a sorted set scored by arrival time, so the head is
//! always the longest-waiting live waiter; each waiter's give-up deadline
//! lives in a companion hash and expired entries are purged when the head
//! is read, which lets crashed or cancelled waiters age out on their own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use crate::backend::{BackendError, CoordinationBackend};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const REFRESH_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

// Walks the arrival-ordered queue from the front, dropping waiters whose
// deadline passed (or whose deadline entry is missing), and returns the
// first live one. KEYS[1] = waiter zset, KEYS[2] = deadline hash,
// ARGV[1] = now in ms.
const HEAD_WAITER_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
while true do
    local head = redis.call('zrange', KEYS[1], 0, 0)[1]
    if not head then
        return nil
    end
    local deadline = tonumber(redis.call('hget', KEYS[2], head))
    if deadline and deadline > now then
        return head
    end
    redis.call('zrem', KEYS[1], head)
    redis.call('hdel', KEYS[2], head)
end
"#;

pub struct RedisCoordination {
    conn: ConnectionManager,
    release: Script,
    refresh: Script,
    head_waiter: Script,
}

impl RedisCoordination {
    pub async fn connect(redis_url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
            refresh: Script::new(REFRESH_SCRIPT),
            head_waiter: Script::new(HEAD_WAITER_SCRIPT),
        })
    }

    fn lease_key(resource: &str) -> String {
        format!("df:lock:{}", resource)
    }

    fn waiters_key(resource: &str) -> String {
        format!("df:lock:{}:waiters", resource)
    }

    fn deadlines_key(resource: &str) -> String {
        format!("df:lock:{}:waiters:deadline", resource)
    }
}

#[async_trait]
impl CoordinationBackend for RedisCoordination {
    async fn try_lock(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::lease_key(resource))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(reply.is_some())
    }

    async fn unlock(&self, resource: &str, owner: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(Self::lease_key(resource))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if released == 0 {
            debug!(resource = %resource, "Release found no lease held by this owner");
        }
        Ok(())
    }

    async fn refresh(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .refresh
            .key(Self::lease_key(resource))
            .arg(owner)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(refreshed == 1)
    }

    async fn enqueue_waiter(
        &self,
        resource: &str,
        owner: &str,
        patience: Duration,
    ) -> Result<(), BackendError> {
        // Scored by arrival so a later waiter with a shorter patience can
        // never jump the queue; millisecond ties break on owner id. The
        // deadline lives in the companion hash. A crash between the two
        // writes leaves a deadline-less entry, which the head script
        // purges as expired.
        let now_ms = Utc::now().timestamp_millis();
        let deadline_ms = now_ms + patience.as_millis() as i64;
        let mut conn = self.conn.clone();

        let _: i64 = redis::cmd("ZADD")
            .arg(Self::waiters_key(resource))
            .arg(now_ms)
            .arg(owner)
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let _: i64 = redis::cmd("HSET")
            .arg(Self::deadlines_key(resource))
            .arg(owner)
            .arg(deadline_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn first_waiter(&self, resource: &str) -> Result<Option<String>, BackendError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();

        let head: Option<String> = self
            .head_waiter
            .key(Self::waiters_key(resource))
            .key(Self::deadlines_key(resource))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(head)
    }

    async fn remove_waiter(&self, resource: &str, owner: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(Self::waiters_key(resource))
            .arg(owner)
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let _: i64 = redis::cmd("HDEL")
            .arg(Self::deadlines_key(resource))
            .arg(owner)
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
