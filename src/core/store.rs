//! Shared counter store backed by Redis.
//!
//! Every mutable piece of engine state (limiter counters, sliding-window
//! logs, trailing violation windows, cached response actions) lives behind
//! this wrapper. All operations carry a timeout so a slow store can never
//! hang a request, and the read-modify-write paths whose correctness depends
//! on atomicity run as Lua scripts or MULTI/EXEC pipelines rather than
//! separate get+set calls.

use std::time::Duration;

use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::time;

/// Errors that can occur talking to the shared store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store value decode error: {0}")]
    Decode(String),
}

/// Atomic token bucket: refill from elapsed wall-clock time, consume if the
/// cost fits, persist with a TTL. Returns `{allowed, tokens_after}`.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'refreshed')
local tokens = tonumber(state[1])
local refreshed = tonumber(state[2])
if tokens == nil or refreshed == nil then
  tokens = capacity
  refreshed = now
end

local elapsed = now - refreshed
if elapsed < 0 then elapsed = 0 end
tokens = tokens + elapsed * refill_rate
if tokens > capacity then tokens = capacity end

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'refreshed', now)
redis.call('EXPIRE', key, ttl)
return {allowed, tostring(tokens)}
"#;

/// Atomic sliding-window log: purge entries older than the window, admit and
/// record if under the limit. Returns `{allowed, count, oldest_score_ms}`.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < max_requests then
  redis.call('ZADD', key, now, member)
  count = count + 1
  allowed = 1
end
redis.call('EXPIRE', key, ttl)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = 0
if oldest[2] then oldest_ms = tonumber(oldest[2]) end
return {allowed, count, oldest_ms}
"#;

/// Shared store handle; cheap to clone, one connection per operation.
#[derive(Clone)]
pub struct SharedStore {
    client: redis::Client,
    op_timeout: Duration,
}

impl SharedStore {
    pub fn new(client: redis::Client, op_timeout: Duration) -> Self {
        Self { client, op_timeout }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        match time::timeout(self.op_timeout, self.client.get_async_connection()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StoreError::Backend(e)),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Backend(e)),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }

    /// Increment a counter and set its expiry on first touch.
    pub async fn incr_expire(
        &self,
        key: &str,
        delta: i64,
        ttl_seconds: usize,
    ) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let count: i64 = self.bounded(conn.incr(key, delta)).await?;
        if count == delta {
            let _: () = self.bounded(conn.expire(key, ttl_seconds)).await?;
        }
        Ok(count)
    }

    pub async fn get_f64(&self, key: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<f64> = self.bounded(conn.get(key)).await?;
        Ok(value)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = self.bounded(conn.get(key)).await?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn set_json_ex<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: usize,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(value).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut conn = self.connection().await?;
        let _: () = self.bounded(conn.set_ex(key, json, ttl_seconds)).await?;
        Ok(())
    }

    /// SET NX EX: returns true when the key was newly created.
    pub async fn set_nx_ex(&self, key: &str, ttl_seconds: usize) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_seconds)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    pub async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: () = self.bounded(conn.del(keys)).await?;
        Ok(())
    }

    /// One atomic token-bucket step. Returns `(allowed, tokens_after)`.
    pub async fn token_bucket_take(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now_seconds: f64,
        cost: f64,
        ttl_seconds: usize,
    ) -> Result<(bool, f64), StoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(TOKEN_BUCKET_SCRIPT);
        let (allowed, tokens): (i64, String) = self
            .bounded(
                script
                    .key(key)
                    .arg(capacity)
                    .arg(refill_rate)
                    .arg(now_seconds)
                    .arg(cost)
                    .arg(ttl_seconds)
                    .invoke_async(&mut conn),
            )
            .await?;
        let tokens: f64 = tokens
            .parse()
            .map_err(|_| StoreError::Decode(format!("bad token count: {}", tokens)))?;
        Ok((allowed == 1, tokens))
    }

    /// One atomic sliding-window-log step.
    /// Returns `(allowed, count_in_window, oldest_entry_ms)`.
    pub async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        max_requests: u32,
        member: &str,
        ttl_seconds: usize,
    ) -> Result<(bool, u32, i64), StoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(SLIDING_WINDOW_SCRIPT);
        let (allowed, count, oldest_ms): (i64, i64, i64) = self
            .bounded(
                script
                    .key(key)
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(max_requests)
                    .arg(member)
                    .arg(ttl_seconds)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok((allowed == 1, count as u32, oldest_ms))
    }

    /// Record a member into a trailing sorted-set window and purge entries
    /// older than the retention horizon in the same transaction.
    pub async fn window_record(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        purge_before_ms: i64,
        ttl_seconds: usize,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: ((), (), ()) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .zadd(key, member, score_ms)
                    .zrembyscore(key, "-inf", purge_before_ms)
                    .expire(key, ttl_seconds)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    /// Members of a trailing window with scores at or after `since_ms`.
    pub async fn window_events(
        &self,
        key: &str,
        since_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = self
            .bounded(conn.zrangebyscore(key, since_ms, "+inf"))
            .await?;
        Ok(members)
    }

    /// Add a member to a rolling window and return the resulting cardinality.
    pub async fn rolling_count(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_seconds: usize,
    ) -> Result<u32, StoreError> {
        let mut conn = self.connection().await?;
        let (_, _, count, _): ((), (), i64, ()) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .zadd(key, member, now_ms)
                    .zrembyscore(key, "-inf", now_ms - window_ms)
                    .zcard(key)
                    .expire(key, ttl_seconds)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(count as u32)
    }

    /// Append to a bounded list, trimming from the front past `max_entries`.
    pub async fn list_append_bounded(
        &self,
        key: &str,
        value: &str,
        max_entries: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: ((), ()) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .rpush(key, value)
                    .ltrim(key, -max_entries as isize, -1)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SharedStore {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        SharedStore::new(client, Duration::from_millis(250))
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn token_bucket_drains_and_refills() {
        let store = store();
        let key = format!("test:bucket:{}", uuid::Uuid::new_v4());

        // Capacity 2, no refill within the test horizon.
        let (allowed, _) = store
            .token_bucket_take(&key, 2.0, 0.001, 1_000.0, 1.0, 60)
            .await
            .unwrap();
        assert!(allowed);
        let (allowed, _) = store
            .token_bucket_take(&key, 2.0, 0.001, 1_000.0, 1.0, 60)
            .await
            .unwrap();
        assert!(allowed);
        let (allowed, tokens) = store
            .token_bucket_take(&key, 2.0, 0.001, 1_000.0, 1.0, 60)
            .await
            .unwrap();
        assert!(!allowed);
        assert!(tokens < 1.0);

        // A full window of elapsed time refills the bucket.
        let (allowed, _) = store
            .token_bucket_take(&key, 2.0, 0.001, 4_000.0, 1.0, 60)
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn sliding_window_enforces_count() {
        let store = store();
        let key = format!("test:window:{}", uuid::Uuid::new_v4());

        for i in 0..3 {
            let (allowed, _, _) = store
                .sliding_window_admit(&key, 1_000 + i, 60_000, 3, &format!("m{}", i), 120)
                .await
                .unwrap();
            assert!(allowed);
        }
        let (allowed, count, oldest) = store
            .sliding_window_admit(&key, 1_010, 60_000, 3, "m3", 120)
            .await
            .unwrap();
        assert!(!allowed);
        assert_eq!(count, 3);
        assert_eq!(oldest, 1_000);

        // Entries age out of the window and admission resumes.
        let (allowed, _, _) = store
            .sliding_window_admit(&key, 70_000, 60_000, 3, "m4", 120)
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn set_nx_ex_fires_once() {
        let store = store();
        let key = format!("test:nx:{}", uuid::Uuid::new_v4());
        assert!(store.set_nx_ex(&key, 60).await.unwrap());
        assert!(!store.set_nx_ex(&key, 60).await.unwrap());
    }
}
