//! Shared durable store.
//!
//! The store is the single source of truth for jobs, indexes, approvals,
//! rate-limit counters, and learnings. `Store` is the seam between the
//! orchestrator and a concrete backend:
//! - `RedisStore`: production backend over `redis::aio::ConnectionManager`
//! - `MemoryStore`: in-process backend for tests and local development
//!
//! Compare-and-swap transitions and windowed counters are named atomic
//! operations on the trait; the Redis backend implements them as Lua
//! scripts, the memory backend as single critical sections.

pub mod keys;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
pub use redis_store::{KEEPALIVE_INTERVAL, RECONNECT_BACKOFF_CAP, RedisStore, keepalive_loop};

/// Outcome of a compare-and-swap status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The transition was applied.
    Swapped,
    /// The record was in none of the allowed source states; carries the
    /// status observed at the linearization point.
    Conflict(String),
    /// No record at the key.
    Missing,
    /// The record exists but is not a JSON object with a string status.
    Malformed,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<()>;

    // Strings.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    // Hashes.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    // Sorted sets.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64>;
    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<u64>;

    // Lists.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn lrem(&self, key: &str, value: &str) -> Result<u64>;
    async fn llen(&self, key: &str) -> Result<u64>;

    // Named atomic operations.

    /// Transition the `status` field of the JSON record at `key` to `to`
    /// iff its current status is one of `allowed_from`. On success the
    /// record's `stamp_field` is set to `now_iso` and the key's TTL is
    /// preserved.
    async fn compare_and_swap_status(
        &self,
        key: &str,
        allowed_from: &[&str],
        to: &str,
        stamp_field: &str,
        now_iso: &str,
    ) -> Result<CasOutcome>;

    /// Increment the counter at `key`; the first increment of a window
    /// also arms the TTL. Returns the post-increment value.
    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<u64>;

    /// Pop the head of `waiting_key` and mark it active with a lock that
    /// expires at `now_ms + lock_ms`. Returns the claimed member.
    async fn claim_next(
        &self,
        waiting_key: &str,
        active_key: &str,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<Option<String>>;

    /// Move every member of `delayed_key` whose release time is due onto
    /// the tail of `waiting_key`. Returns the number promoted.
    async fn promote_due(&self, delayed_key: &str, waiting_key: &str, now_ms: i64) -> Result<u64>;

    /// Record one gate completion for `parent_id`: decrement its pending
    /// counter in `counts_key`, and when the counter reaches zero drop
    /// it, remove the parent from `children_key`, and push it onto
    /// `waiting_key`. Returns the number of gates still pending.
    async fn complete_gate(
        &self,
        counts_key: &str,
        children_key: &str,
        waiting_key: &str,
        parent_id: &str,
    ) -> Result<i64>;
}

#[cfg(test)]
mod trait_tests {
    use super::*;

    // The memory backend doubles as the executable model of the atomic
    // operation contract; these tests pin the semantics both backends
    // must honor.

    #[tokio::test]
    async fn test_cas_swaps_only_from_allowed_states() {
        let store = MemoryStore::new();
        store
            .set("k", r#"{"status":"pending","id":"a"}"#)
            .await
            .unwrap();

        let out = store
            .compare_and_swap_status("k", &["pending"], "approved", "approvedAt", "2026-01-01T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(out, CasOutcome::Swapped);

        let raw = store.get("k").await.unwrap().unwrap();
        let rec: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(rec["status"], "approved");
        assert_eq!(rec["approvedAt"], "2026-01-01T00:00:00Z");

        let out = store
            .compare_and_swap_status("k", &["pending"], "rejected", "rejectedAt", "2026-01-01T00:00:01Z")
            .await
            .unwrap();
        assert_eq!(out, CasOutcome::Conflict("approved".to_string()));
    }

    #[tokio::test]
    async fn test_cas_missing_and_malformed() {
        let store = MemoryStore::new();
        let out = store
            .compare_and_swap_status("absent", &["pending"], "approved", "approvedAt", "now")
            .await
            .unwrap();
        assert_eq!(out, CasOutcome::Missing);

        store.set("junk", "not json").await.unwrap();
        let out = store
            .compare_and_swap_status("junk", &["pending"], "approved", "approvedAt", "now")
            .await
            .unwrap();
        assert_eq!(out, CasOutcome::Malformed);
    }

    #[tokio::test]
    async fn test_incr_with_window_arms_ttl_once() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        assert_eq!(store.incr_with_window("c", window).await.unwrap(), 1);
        assert_eq!(store.incr_with_window("c", window).await.unwrap(), 2);

        store.advance(Duration::from_secs(61));
        assert_eq!(store.incr_with_window("c", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_complete_gate_releases_parent_on_last_gate() {
        let store = MemoryStore::new();
        store.hset("counts", "p1", "2").await.unwrap();
        store.zadd("children", "p1", 1.0).await.unwrap();

        let remaining = store
            .complete_gate("counts", "children", "waiting", "p1")
            .await
            .unwrap();
        assert_eq!(remaining, 1);
        assert!(store.zscore("children", "p1").await.unwrap().is_some());
        assert!(store.lrange("waiting", 0, -1).await.unwrap().is_empty());

        let remaining = store
            .complete_gate("counts", "children", "waiting", "p1")
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(store.hget("counts", "p1").await.unwrap().is_none());
        assert!(store.zscore("children", "p1").await.unwrap().is_none());
        assert_eq!(
            store.lrange("waiting", 0, -1).await.unwrap(),
            vec!["p1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_claim_next_and_promote_due() {
        let store = MemoryStore::new();
        store.rpush("w", "j1").await.unwrap();
        store.rpush("w", "j2").await.unwrap();

        let claimed = store.claim_next("w", "a", 1_000, 300_000).await.unwrap();
        assert_eq!(claimed.as_deref(), Some("j1"));
        assert_eq!(store.zscore("a", "j1").await.unwrap(), Some(301_000.0));

        store.zadd("d", "j3", 5_000.0).await.unwrap();
        assert_eq!(store.promote_due("d", "w", 4_999).await.unwrap(), 0);
        assert_eq!(store.promote_due("d", "w", 5_000).await.unwrap(), 1);
        assert_eq!(
            store.lrange("w", 0, -1).await.unwrap(),
            vec!["j2".to_string(), "j3".to_string()]
        );
    }
}
