//! In-process store backend.
//!
//! Mutex-serialized, TTL-aware map used by the test suite and local
//! development. Every trait operation is a single critical section, which
//! makes this backend the executable model for the named atomic
//! operations.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CasOutcome, Store};
use crate::error::{ForemanError, Result};

#[derive(Debug, Clone)]
enum MemValue {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: MemValue,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    clock_offset: chrono::Duration,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift the store's clock forward. Lets tests roll rate-limit windows
    /// and TTLs without sleeping.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.clock_offset += chrono::Duration::from_std(by).unwrap_or_default();
    }
}

impl Inner {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    fn live_entry(&mut self, key: &str) -> Option<&mut Entry> {
        let now = self.now();
        if let Some(entry) = self.entries.get(key)
            && entry.expires_at.is_some_and(|at| at <= now)
        {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn str_mut(&mut self, key: &str) -> Option<&mut String> {
        match self.live_entry(key) {
            Some(Entry {
                value: MemValue::Str(s),
                ..
            }) => Some(s),
            _ => None,
        }
    }

    fn hash_mut(&mut self, key: &str) -> &mut HashMap<String, String> {
        self.ensure(key, || MemValue::Hash(HashMap::new()));
        match &mut self.entries.get_mut(key).unwrap().value {
            MemValue::Hash(h) => h,
            _ => unreachable!(),
        }
    }

    fn zset_mut(&mut self, key: &str) -> &mut HashMap<String, f64> {
        self.ensure(key, || MemValue::ZSet(HashMap::new()));
        match &mut self.entries.get_mut(key).unwrap().value {
            MemValue::ZSet(z) => z,
            _ => unreachable!(),
        }
    }

    fn list_mut(&mut self, key: &str) -> &mut VecDeque<String> {
        self.ensure(key, || MemValue::List(VecDeque::new()));
        match &mut self.entries.get_mut(key).unwrap().value {
            MemValue::List(l) => l,
            _ => unreachable!(),
        }
    }

    fn ensure(&mut self, key: &str, default: impl FnOnce() -> MemValue) {
        let now = self.now();
        let expired = self
            .entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= now));
        if expired {
            self.entries.remove(key);
        }
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: default(),
            expires_at: None,
        });
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(MemValue::Hash(h)) => h.is_empty(),
            Some(MemValue::ZSet(z)) => z.is_empty(),
            Some(MemValue::List(l)) => l.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn sorted_members(&mut self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = match self.live_entry(key) {
            Some(Entry {
                value: MemValue::ZSet(z),
                ..
            }) => z.iter().map(|(m, s)| (m.clone(), *s)).collect(),
            _ => Vec::new(),
        };
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        members
    }
}

fn slice_range<T: Clone>(items: &[T], start: isize, stop: isize) -> Vec<T> {
    let len = items.len() as isize;
    let norm = |i: isize| if i < 0 { (len + i).max(0) } else { i.min(len) };
    let from = norm(start);
    let to = (norm(stop) + 1).min(len);
    if from >= to {
        return Vec::new();
    }
    items[from as usize..to as usize].to_vec()
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        Ok(inner.str_mut(key).map(|s| s.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: MemValue::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        let expires_at = inner.now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: MemValue::Str(value.to_string()),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.lock().entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        let expires_at = inner.now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        if let Some(entry) = inner.live_entry(key) {
            entry.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        match inner.live_entry(key) {
            Some(Entry {
                value: MemValue::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            _ => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .hash_mut(key)
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.hash_mut(key).remove(field);
        inner.drop_if_empty(key);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut inner = self.inner.lock();
        match inner.live_entry(key) {
            Some(Entry {
                value: MemValue::Hash(h),
                ..
            }) => Ok(h.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        let hash = inner.hash_mut(key);
        let current: i64 = hash
            .get(field)
            .map(|v| v.parse())
            .transpose()
            .map_err(|e| ForemanError::Store(format!("hincrby on non-integer field: {}", e)))?
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.zset_mut(key).insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.zset_mut(key).remove(member);
        inner.drop_if_empty(key);
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let members = inner.sorted_members(key);
        Ok(slice_range(&members, start, stop)
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let mut members = inner.sorted_members(key);
        members.reverse();
        Ok(slice_range(&members, start, stop)
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .sorted_members(key)
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .map(|(m, _)| m)
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.live_entry(key) {
            Some(Entry {
                value: MemValue::ZSet(z),
                ..
            }) => Ok(z.len() as u64),
            _ => Ok(0),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut inner = self.inner.lock();
        match inner.live_entry(key) {
            Some(Entry {
                value: MemValue::ZSet(z),
                ..
            }) => Ok(z.get(member).copied()),
            _ => Ok(None),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .sorted_members(key)
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .map(|(m, _)| m)
            .collect();
        let zset = inner.zset_mut(key);
        for member in &doomed {
            zset.remove(member);
        }
        inner.drop_if_empty(key);
        Ok(doomed.len() as u64)
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<u64> {
        let mut inner = self.inner.lock();
        let members = inner.sorted_members(key);
        let doomed: Vec<String> = slice_range(&members, start, stop)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        let zset = inner.zset_mut(key);
        for member in &doomed {
            zset.remove(member);
        }
        inner.drop_if_empty(key);
        Ok(doomed.len() as u64)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        let list = inner.list_mut(key);
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        match inner.live_entry(key) {
            Some(Entry {
                value: MemValue::List(l),
                ..
            }) => {
                let items: Vec<String> = l.iter().cloned().collect();
                Ok(slice_range(&items, start, stop))
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        let list = inner.list_mut(key);
        let before = list.len();
        list.retain(|v| v != value);
        let removed = (before - list.len()) as u64;
        inner.drop_if_empty(key);
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.live_entry(key) {
            Some(Entry {
                value: MemValue::List(l),
                ..
            }) => Ok(l.len() as u64),
            _ => Ok(0),
        }
    }

    async fn compare_and_swap_status(
        &self,
        key: &str,
        allowed_from: &[&str],
        to: &str,
        stamp_field: &str,
        now_iso: &str,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.lock();
        let Some(raw) = inner.str_mut(key) else {
            return Ok(CasOutcome::Missing);
        };
        let Ok(mut record) = serde_json::from_str::<serde_json::Value>(raw) else {
            return Ok(CasOutcome::Malformed);
        };
        let Some(current) = record.get("status").and_then(|s| s.as_str()).map(String::from)
        else {
            return Ok(CasOutcome::Malformed);
        };
        if !allowed_from.contains(&current.as_str()) {
            return Ok(CasOutcome::Conflict(current));
        }
        record["status"] = serde_json::Value::String(to.to_string());
        record[stamp_field] = serde_json::Value::String(now_iso.to_string());
        *raw = record.to_string();
        Ok(CasOutcome::Swapped)
    }

    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<u64> {
        let mut inner = self.inner.lock();
        let now = inner.now();
        if let Some(s) = inner.str_mut(key) {
            let next: u64 = s
                .parse::<u64>()
                .map_err(|e| ForemanError::Store(format!("counter parse: {}", e)))?
                + 1;
            *s = next.to_string();
            return Ok(next);
        }
        let expires_at = now + chrono::Duration::from_std(window).unwrap_or_default();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: MemValue::Str("1".to_string()),
                expires_at: Some(expires_at),
            },
        );
        Ok(1)
    }

    async fn claim_next(
        &self,
        waiting_key: &str,
        active_key: &str,
        now_ms: i64,
        lock_ms: i64,
    ) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.list_mut(waiting_key).pop_front() else {
            inner.drop_if_empty(waiting_key);
            return Ok(None);
        };
        inner.drop_if_empty(waiting_key);
        inner
            .zset_mut(active_key)
            .insert(id.clone(), (now_ms + lock_ms) as f64);
        Ok(Some(id))
    }

    async fn promote_due(&self, delayed_key: &str, waiting_key: &str, now_ms: i64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let due: Vec<String> = inner
            .sorted_members(delayed_key)
            .into_iter()
            .filter(|(_, s)| *s <= now_ms as f64)
            .map(|(m, _)| m)
            .collect();
        for member in &due {
            inner.zset_mut(delayed_key).remove(member);
            inner.list_mut(waiting_key).push_back(member.clone());
        }
        inner.drop_if_empty(delayed_key);
        Ok(due.len() as u64)
    }

    async fn complete_gate(
        &self,
        counts_key: &str,
        children_key: &str,
        waiting_key: &str,
        parent_id: &str,
    ) -> Result<i64> {
        let mut inner = self.inner.lock();
        let remaining = {
            let counts = inner.hash_mut(counts_key);
            let current: i64 = counts
                .get(parent_id)
                .map(|v| v.parse())
                .transpose()
                .map_err(|e| {
                    ForemanError::Store(format!("gate counter on non-integer field: {}", e))
                })?
                .unwrap_or(0);
            let next = current - 1;
            if next > 0 {
                counts.insert(parent_id.to_string(), next.to_string());
            } else {
                counts.remove(parent_id);
            }
            next
        };
        inner.drop_if_empty(counts_key);
        if remaining <= 0 {
            inner.zset_mut(children_key).remove(parent_id);
            inner.drop_if_empty(children_key);
            inner.list_mut(waiting_key).push_back(parent_id.to_string());
        }
        Ok(remaining)
    }
}
