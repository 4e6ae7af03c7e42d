use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::config::{QueueTuning, Retention};
use super::events::{QueueEvent, QueueEventKind, QueueEvents};
use super::flow;
use super::job::JobEnvelope;
use crate::error::Result;
use crate::store::{Store, keys};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub waiting_children: u64,
}

impl QueueCounts {
    /// Depth measure for the dispatch cap: everything not yet finished.
    pub fn depth(&self) -> u64 {
        self.waiting + self.delayed + self.active
    }
}

/// Handle over one logical queue's key family.
pub struct Queue<T> {
    name: String,
    store: Arc<dyn Store>,
    tuning: QueueTuning,
    events: QueueEvents,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            tuning: self.tuning.clone(),
            events: self.events.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn Store>,
        tuning: QueueTuning,
        events: QueueEvents,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            tuning,
            events,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tuning(&self) -> &QueueTuning {
        &self.tuning
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Enqueue; a future `delay_until` routes through the delayed set.
    pub async fn add(&self, envelope: &JobEnvelope<T>) -> Result<()> {
        self.save(envelope).await?;
        match envelope.delay_until {
            Some(at) if at > Utc::now() => {
                self.store
                    .zadd(
                        &keys::queue_delayed(&self.name),
                        &envelope.id,
                        at.timestamp_millis() as f64,
                    )
                    .await
            }
            _ => {
                self.store
                    .rpush(&keys::queue_waiting(&self.name), &envelope.id)
                    .await?;
                Ok(())
            }
        }
    }

    /// Park a parent until `gate_count` gates complete.
    pub async fn add_gated(&self, envelope: &JobEnvelope<T>, gate_count: u64) -> Result<()> {
        self.save(envelope).await?;
        self.store
            .zadd(
                &keys::queue_waiting_children(&self.name),
                &envelope.id,
                Self::now_ms() as f64,
            )
            .await?;
        self.store
            .hset(
                &keys::queue_gate_counts(&self.name),
                &envelope.id,
                &gate_count.to_string(),
            )
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobEnvelope<T>>> {
        let raw = self.store.hget(&keys::queue_jobs(&self.name), id).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, envelope: &JobEnvelope<T>) -> Result<()> {
        let raw = serde_json::to_string(envelope)?;
        self.store
            .hset(&keys::queue_jobs(&self.name), &envelope.id, &raw)
            .await
    }

    /// Move due delayed jobs onto the waiting list.
    pub async fn promote_due(&self) -> Result<u64> {
        self.store
            .promote_due(
                &keys::queue_delayed(&self.name),
                &keys::queue_waiting(&self.name),
                Self::now_ms(),
            )
            .await
    }

    /// Claim the next waiting job under the queue lock.
    pub async fn claim(&self) -> Result<Option<JobEnvelope<T>>> {
        let claimed = self
            .store
            .claim_next(
                &keys::queue_waiting(&self.name),
                &keys::queue_active(&self.name),
                Self::now_ms(),
                self.tuning.lock_duration_ms as i64,
            )
            .await?;
        let Some(id) = claimed else {
            return Ok(None);
        };
        match self.get(&id).await? {
            Some(envelope) => Ok(Some(envelope)),
            None => {
                // Envelope vanished under us (retention or drain); drop
                // the orphaned active entry.
                warn!(queue = %self.name, job_id = %id, "Claimed job without envelope");
                self.store
                    .zrem(&keys::queue_active(&self.name), &id)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Queue-level completion: the handler finished its unit of work.
    pub async fn complete(&self, envelope: &mut JobEnvelope<T>) -> Result<()> {
        envelope.finished_at = Some(Utc::now());
        self.save(envelope).await?;
        self.store
            .zrem(&keys::queue_active(&self.name), &envelope.id)
            .await?;
        self.store
            .zadd(
                &keys::queue_completed(&self.name),
                &envelope.id,
                Self::now_ms() as f64,
            )
            .await?;
        self.trim(&keys::queue_completed(&self.name), self.tuning.completed_retention)
            .await?;
        if let Some(parent) = envelope.parent.clone() {
            let released = flow::release_gate(self.store.as_ref(), &parent).await?;
            if released {
                debug!(parent_queue = %parent.queue, parent_job = %parent.job_id,
                    "All gates complete, parent released to waiting");
            }
        }
        self.events.emit(QueueEvent {
            queue: self.name.clone(),
            job_id: envelope.id.clone(),
            kind: QueueEventKind::Completed,
        });
        Ok(())
    }

    /// Dead-letter the job.
    pub async fn fail(&self, envelope: &mut JobEnvelope<T>, reason: &str) -> Result<()> {
        envelope.finished_at = Some(Utc::now());
        envelope.failed_reason = Some(reason.to_string());
        self.save(envelope).await?;
        self.store
            .zrem(&keys::queue_active(&self.name), &envelope.id)
            .await?;
        self.store
            .zadd(
                &keys::queue_failed(&self.name),
                &envelope.id,
                Self::now_ms() as f64,
            )
            .await?;
        self.trim(&keys::queue_failed(&self.name), self.tuning.failed_retention)
            .await?;
        self.events.emit(QueueEvent {
            queue: self.name.clone(),
            job_id: envelope.id.clone(),
            kind: QueueEventKind::Failed {
                reason: reason.to_string(),
            },
        });
        Ok(())
    }

    /// Schedule another launch attempt after a backoff delay.
    pub async fn retry_later(&self, envelope: &mut JobEnvelope<T>, delay_ms: u64) -> Result<()> {
        let release_at = Utc::now() + Duration::milliseconds(delay_ms as i64);
        envelope.delay_until = Some(release_at);
        self.save(envelope).await?;
        self.store
            .zrem(&keys::queue_active(&self.name), &envelope.id)
            .await?;
        self.store
            .zadd(
                &keys::queue_delayed(&self.name),
                &envelope.id,
                release_at.timestamp_millis() as f64,
            )
            .await?;
        self.events.emit(QueueEvent {
            queue: self.name.clone(),
            job_id: envelope.id.clone(),
            kind: QueueEventKind::Retrying { delay_ms },
        });
        Ok(())
    }

    /// Sweep active entries whose locks expired. Stalled jobs re-enter
    /// the waiting list until the stall budget is spent, then
    /// dead-letter.
    pub async fn requeue_stalled(&self) -> Result<u64> {
        let expired = self
            .store
            .zrangebyscore(
                &keys::queue_active(&self.name),
                f64::NEG_INFINITY,
                Self::now_ms() as f64,
            )
            .await?;
        let mut requeued = 0;
        for id in expired {
            let Some(mut envelope) = self.get(&id).await? else {
                self.store
                    .zrem(&keys::queue_active(&self.name), &id)
                    .await?;
                continue;
            };
            envelope.stalled_count += 1;
            if envelope.stalled_count > self.tuning.max_stalled_count {
                self.fail(&mut envelope, "job stalled more than allowable limit")
                    .await?;
                continue;
            }
            self.save(&envelope).await?;
            self.store
                .zrem(&keys::queue_active(&self.name), &id)
                .await?;
            self.store
                .rpush(&keys::queue_waiting(&self.name), &id)
                .await?;
            self.events.emit(QueueEvent {
                queue: self.name.clone(),
                job_id: id,
                kind: QueueEventKind::Stalled,
            });
            requeued += 1;
        }
        Ok(requeued)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            waiting: self.store.llen(&keys::queue_waiting(&self.name)).await?,
            delayed: self.store.zcard(&keys::queue_delayed(&self.name)).await?,
            active: self.store.zcard(&keys::queue_active(&self.name)).await?,
            completed: self.store.zcard(&keys::queue_completed(&self.name)).await?,
            failed: self.store.zcard(&keys::queue_failed(&self.name)).await?,
            waiting_children: self
                .store
                .zcard(&keys::queue_waiting_children(&self.name))
                .await?,
        })
    }

    /// Every envelope still retained on this queue. Used by the recovery
    /// scan, the index-repair fallback, and filtered listings.
    pub async fn all_envelopes(&self) -> Result<Vec<JobEnvelope<T>>> {
        let raw = self.store.hgetall(&keys::queue_jobs(&self.name)).await?;
        let mut envelopes = Vec::with_capacity(raw.len());
        for (id, value) in raw {
            match serde_json::from_str(&value) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    warn!(queue = %self.name, job_id = %id, error = %e,
                        "Skipping malformed job envelope");
                }
            }
        }
        Ok(envelopes)
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .hget(&keys::queue_jobs(&self.name), id)
            .await?
            .is_some())
    }

    /// Whether the job is still parked behind dependency gates.
    pub async fn is_gated(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .zscore(&keys::queue_waiting_children(&self.name), id)
            .await?
            .is_some())
    }

    /// Remove a single job from every queue structure.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.hdel(&keys::queue_jobs(&self.name), id).await?;
        self.store
            .lrem(&keys::queue_waiting(&self.name), id)
            .await?;
        for key in [
            keys::queue_delayed(&self.name),
            keys::queue_active(&self.name),
            keys::queue_completed(&self.name),
            keys::queue_failed(&self.name),
            keys::queue_waiting_children(&self.name),
        ] {
            self.store.zrem(&key, id).await?;
        }
        self.store
            .hdel(&keys::queue_gate_counts(&self.name), id)
            .await?;
        Ok(())
    }

    /// Drop all waiting and delayed jobs. Active jobs finish their
    /// launch; finished sets are untouched.
    pub async fn drain(&self) -> Result<u64> {
        let mut ids = self
            .store
            .lrange(&keys::queue_waiting(&self.name), 0, -1)
            .await?;
        ids.extend(
            self.store
                .zrange(&keys::queue_delayed(&self.name), 0, -1)
                .await?,
        );
        ids.extend(
            self.store
                .zrange(&keys::queue_waiting_children(&self.name), 0, -1)
                .await?,
        );
        let drained = ids.len() as u64;
        for id in ids {
            self.remove(&id).await?;
        }
        Ok(drained)
    }

    async fn trim(&self, set_key: &str, retention: Retention) -> Result<()> {
        let cutoff = Self::now_ms() - retention.max_age_ms as i64;
        let expired = self
            .store
            .zrangebyscore(set_key, f64::NEG_INFINITY, cutoff as f64)
            .await?;
        for id in expired {
            self.store.zrem(set_key, &id).await?;
            self.store.hdel(&keys::queue_jobs(&self.name), &id).await?;
        }
        let count = self.store.zcard(set_key).await?;
        if count > retention.max_count {
            let excess = (count - retention.max_count) as isize;
            let oldest = self.store.zrange(set_key, 0, excess - 1).await?;
            for id in oldest {
                self.store.zrem(set_key, &id).await?;
                self.store.hdel(&keys::queue_jobs(&self.name), &id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue() -> Queue<serde_json::Value> {
        Queue::new(
            "agent-jarvis",
            Arc::new(MemoryStore::new()),
            QueueTuning::default(),
            QueueEvents::default(),
        )
    }

    fn envelope(queue: &Queue<serde_json::Value>, id: &str) -> JobEnvelope<serde_json::Value> {
        JobEnvelope::new(id, serde_json::json!({}), queue.tuning())
    }

    #[tokio::test]
    async fn test_add_claim_complete() {
        let q = queue();
        let job = envelope(&q, "j1");
        q.add(&job).await.unwrap();

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);

        let mut claimed = q.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, "j1");
        assert_eq!(q.counts().await.unwrap().active, 1);

        q.complete(&mut claimed).await.unwrap();
        let counts = q.counts().await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);
        // The envelope survives for record-level lifecycle tracking.
        assert!(q.get("j1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fifo_claim_order() {
        let q = queue();
        for id in ["a", "b", "c"] {
            q.add(&envelope(&q, id)).await.unwrap();
        }
        assert_eq!(q.claim().await.unwrap().unwrap().id, "a");
        assert_eq!(q.claim().await.unwrap().unwrap().id, "b");
        assert_eq!(q.claim().await.unwrap().unwrap().id, "c");
        assert!(q.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_jobs_wait_for_promotion() {
        let q = queue();
        let job = envelope(&q, "j1").delayed_until(Utc::now() + Duration::milliseconds(50));
        q.add(&job).await.unwrap();
        assert!(q.claim().await.unwrap().is_none());
        assert_eq!(q.counts().await.unwrap().delayed, 1);

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(q.promote_due().await.unwrap(), 1);
        assert_eq!(q.claim().await.unwrap().unwrap().id, "j1");
    }

    #[tokio::test]
    async fn test_stalled_job_requeues_then_dead_letters() {
        let store = Arc::new(MemoryStore::new());
        let tuning = QueueTuning {
            lock_duration_ms: 0,
            max_stalled_count: 2,
            ..Default::default()
        };
        let q: Queue<serde_json::Value> = Queue::new(
            "agent-jarvis",
            store,
            tuning,
            QueueEvents::default(),
        );
        let job = JobEnvelope::new("j1", serde_json::json!({}), q.tuning());
        q.add(&job).await.unwrap();

        for round in 1..=2 {
            q.claim().await.unwrap().unwrap();
            // Zero lock duration: the claim is immediately expired.
            assert_eq!(q.requeue_stalled().await.unwrap(), 1, "round {}", round);
            assert_eq!(q.counts().await.unwrap().waiting, 1);
        }

        q.claim().await.unwrap().unwrap();
        assert_eq!(q.requeue_stalled().await.unwrap(), 0);
        let counts = q.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 0);
        let envelope = q.get("j1").await.unwrap().unwrap();
        assert_eq!(envelope.stalled_count, 3);
        assert!(envelope.failed_reason.is_some());
    }

    #[tokio::test]
    async fn test_retention_trims_by_count() {
        let store = Arc::new(MemoryStore::new());
        let tuning = QueueTuning {
            completed_retention: Retention {
                max_age_ms: u64::MAX / 4,
                max_count: 2,
            },
            ..Default::default()
        };
        let q: Queue<serde_json::Value> =
            Queue::new("agent-jarvis", store, tuning, QueueEvents::default());
        for id in ["a", "b", "c"] {
            q.add(&envelope(&q, id)).await.unwrap();
            let mut claimed = q.claim().await.unwrap().unwrap();
            q.complete(&mut claimed).await.unwrap();
        }
        assert_eq!(q.counts().await.unwrap().completed, 2);
        assert!(q.get("a").await.unwrap().is_none());
        assert!(q.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_drain_removes_pending_only() {
        let q = queue();
        q.add(&envelope(&q, "w1")).await.unwrap();
        q.add(&envelope(&q, "w2").delayed_until(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        q.add(&envelope(&q, "a1")).await.unwrap();
        let mut active = q.claim().await.unwrap().unwrap();
        assert_eq!(active.id, "w1");

        // w1 is active now; the drain takes w2 and a1's waiting sibling.
        let drained = q.drain().await.unwrap();
        assert_eq!(drained, 2);
        q.complete(&mut active).await.unwrap();
        assert_eq!(q.counts().await.unwrap().completed, 1);
    }
}
