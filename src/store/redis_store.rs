//! Redis store backend.
//!
//! Async client over `redis::aio::ConnectionManager`. Named atomic
//! operations are Lua scripts so the compare-and-swap transitions and
//! windowed counters have a single linearization point in the server.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{CasOutcome, Store};
use crate::error::{ForemanError, Result};

/// Reconnect backoff cap. Keep-alive retries double from one second up to
/// this bound.
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Keep-alive ping cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

static AUTH_FAILURE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn auth_failure_pattern() -> &'static Regex {
    AUTH_FAILURE_PATTERN.get_or_init(|| Regex::new(r"NOAUTH|ERR AUTH").unwrap())
}

fn classify(err: redis::RedisError) -> ForemanError {
    let msg = err.to_string();
    if auth_failure_pattern().is_match(&msg) {
        ForemanError::StoreAuth(msg)
    } else if err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
        ForemanError::StoreUnavailable(msg)
    } else {
        ForemanError::Store(msg)
    }
}

static CAS_STATUS_SCRIPT: OnceLock<redis::Script> = OnceLock::new();
static INCR_WINDOW_SCRIPT: OnceLock<redis::Script> = OnceLock::new();
static CLAIM_NEXT_SCRIPT: OnceLock<redis::Script> = OnceLock::new();
static PROMOTE_DUE_SCRIPT: OnceLock<redis::Script> = OnceLock::new();
static COMPLETE_GATE_SCRIPT: OnceLock<redis::Script> = OnceLock::new();

fn cas_status_script() -> &'static redis::Script {
    CAS_STATUS_SCRIPT.get_or_init(|| {
        redis::Script::new(
            r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local ok, rec = pcall(cjson.decode, raw)
if not ok or type(rec) ~= 'table' then return 'malformed' end
local cur = rec['status']
if type(cur) ~= 'string' then return 'malformed' end
for i = 4, #ARGV do
  if cur == ARGV[i] then
    rec['status'] = ARGV[1]
    rec[ARGV[2]] = ARGV[3]
    local ttl = redis.call('PTTL', KEYS[1])
    if ttl > 0 then
      redis.call('SET', KEYS[1], cjson.encode(rec), 'PX', ttl)
    else
      redis.call('SET', KEYS[1], cjson.encode(rec))
    end
    return 'ok'
  end
end
return cur
"#,
        )
    })
}

fn incr_window_script() -> &'static redis::Script {
    INCR_WINDOW_SCRIPT.get_or_init(|| {
        redis::Script::new(
            r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then redis.call('PEXPIRE', KEYS[1], ARGV[1]) end
return v
"#,
        )
    })
}

fn claim_next_script() -> &'static redis::Script {
    CLAIM_NEXT_SCRIPT.get_or_init(|| {
        redis::Script::new(
            r#"
local id = redis.call('LPOP', KEYS[1])
if not id then return false end
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
return id
"#,
        )
    })
}

fn promote_due_script() -> &'static redis::Script {
    PROMOTE_DUE_SCRIPT.get_or_init(|| {
        redis::Script::new(
            r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for i = 1, #due do
  redis.call('ZREM', KEYS[1], due[i])
  redis.call('RPUSH', KEYS[2], due[i])
end
return #due
"#,
        )
    })
}

fn complete_gate_script() -> &'static redis::Script {
    COMPLETE_GATE_SCRIPT.get_or_init(|| {
        redis::Script::new(
            r#"
local remaining = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if remaining <= 0 then
  redis.call('HDEL', KEYS[1], ARGV[1])
  redis.call('ZREM', KEYS[2], ARGV[1])
  redis.call('RPUSH', KEYS[3], ARGV[1])
end
return remaining
"#,
        )
    })
}

pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect and build the managed connection. Callers that need a
    /// readiness bound wrap this in `tokio::time::timeout`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ForemanError::Config(format!("invalid redis url: {}", e)))?;
        let manager = ConnectionManager::new(client).await.map_err(classify)?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(classify)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await.map_err(classify)?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await.map_err(classify)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        conn.hget(key, field).await.map_err(classify)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hset(key, field, value).await.map_err(classify)?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hdel(key, field).await.map_err(classify)?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn();
        conn.hgetall(key).await.map_err(classify)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        conn.hincr(key, field, delta).await.map_err(classify)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key, member, score).await.map_err(classify)?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.zrem(key, member).await.map_err(classify)?;
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        conn.zrange(key, start, stop).await.map_err(classify)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        conn.zrevrange(key, start, stop).await.map_err(classify)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        conn.zrangebyscore(key, min, max).await.map_err(classify)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        conn.zcard(key).await.map_err(classify)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        conn.zscore(key, member).await.map_err(classify)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.conn();
        conn.zrembyscore(key, min, max).await.map_err(classify)
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<u64> {
        let mut conn = self.conn();
        conn.zremrangebyrank(key, start, stop).await.map_err(classify)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn();
        conn.rpush(key, value).await.map_err(classify)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        conn.lrange(key, start, stop).await.map_err(classify)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn();
        conn.lrem(key, 0, value).await.map_err(classify)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        conn.llen(key).await.map_err(classify)
    }

    async fn compare_and_swap_status(
        &self,
        key: &str,
        allowed_from: &[&str],
        to: &str,
        stamp_field: &str,
        now_iso: &str,
    ) -> Result<CasOutcome> {
        let mut conn = self.conn();
        let mut invocation = cas_status_script().key(key);
        invocation.arg(to).arg(stamp_field).arg(now_iso);
        for from in allowed_from {
            invocation.arg(*from);
        }
        let result: String = invocation.invoke_async(&mut conn).await.map_err(classify)?;
        Ok(match result.as_str() {
            "ok" => CasOutcome::Swapped,
            "missing" => CasOutcome::Missing,
            "malformed" => CasOutcome::Malformed,
            other => CasOutcome::Conflict(other.to_string()),
        })
    }

    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.conn();
        incr_window_script()
            .key(key)
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)
    }

    async fn claim_next(
        &self,
        waiting_key: &str,
        active_key: &str,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<Option<String>> {
        let mut conn = self.conn();
        claim_next_script()
            .key(waiting_key)
            .key(active_key)
            .arg(now_ms)
            .arg(lock_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)
    }

    async fn promote_due(&self, delayed_key: &str, waiting_key: &str, now_ms: i64) -> Result<u64> {
        let mut conn = self.conn();
        promote_due_script()
            .key(delayed_key)
            .key(waiting_key)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)
    }

    async fn complete_gate(
        &self,
        counts_key: &str,
        children_key: &str,
        waiting_key: &str,
        parent_id: &str,
    ) -> Result<i64> {
        let mut conn = self.conn();
        complete_gate_script()
            .key(counts_key)
            .key(children_key)
            .key(waiting_key)
            .arg(parent_id)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)
    }
}

/// Periodic connection keep-alive.
///
/// Pings on a fixed cadence; after a failed ping, retries with exponential
/// backoff capped at `RECONNECT_BACKOFF_CAP` until the connection answers
/// again. An auth failure invokes `on_auth_failure` so the service can
/// force-open the circuit breaker immediately.
pub async fn keepalive_loop<S, F>(store: S, mut shutdown: watch::Receiver<bool>, on_auth_failure: F)
where
    S: AsRef<dyn Store> + Send + Sync,
    F: Fn(&str) + Send + Sync,
{
    let mut backoff = Duration::from_secs(1);
    loop {
        let wait = tokio::select! {
            _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => false,
            _ = shutdown.changed() => true,
        };
        if wait || *shutdown.borrow() {
            return;
        }

        while let Err(e) = store.as_ref().ping().await {
            if e.is_auth_failure() {
                warn!(error = %e, "Store authentication failure during keep-alive");
                on_auth_failure(&e.to_string());
            } else {
                debug!(error = %e, backoff_secs = backoff.as_secs(), "Store ping failed, backing off");
            }
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(backoff) => false,
                _ = shutdown.changed() => true,
            };
            if interrupted || *shutdown.borrow() {
                return;
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }
        backoff = Duration::from_secs(1);
    }
}
