//! Job tracker.
//!
//! Owns the queue handles, the jobId -> queue and sessionKey -> job
//! indexes, the flow producer for dependency jobs, and the periodic
//! stale-index sweep. Index lookups are the O(1) fast path; a full scan
//! with index repair backs them up.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ForemanError, Result};
use crate::queue::{FlowProducer, JobEnvelope, Queue, QueueCounts, QueueEvents, QueueTuning};
use crate::record::{JobRecord, JobStatus, RecordPatch};
use crate::store::{Store, keys};

/// Error written by the recovery scan to jobs a restart interrupted.
pub const RESTART_ERROR: &str = "Gateway restart during execution — job state unknown";

/// Batch size for the stale-index sweep; keeps any single pass over the
/// store short.
const CLEANUP_BATCH: usize = 50;

/// Session-index value, serialized camelCase per the keyspace contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIndexEntry {
    job_id: String,
    queue_name: String,
}

/// A job resolved to its queue.
#[derive(Debug, Clone)]
pub struct LocatedJob {
    pub queue_name: String,
    pub envelope: JobEnvelope<JobRecord>,
}

pub struct JobTracker {
    store: Arc<dyn Store>,
    tuning: QueueTuning,
    events: QueueEvents,
    queues: DashMap<String, Queue<JobRecord>>,
    flow: FlowProducer,
}

impl JobTracker {
    pub fn new(store: Arc<dyn Store>, tuning: QueueTuning, events: QueueEvents) -> Self {
        let gate_queue = Queue::new(
            keys::GATE_QUEUE,
            Arc::clone(&store),
            QueueTuning::gate(),
            events.clone(),
        );
        Self {
            store,
            tuning,
            events,
            queues: DashMap::new(),
            flow: FlowProducer::new(gate_queue),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn flow(&self) -> &FlowProducer {
        &self.flow
    }

    /// Queue handle for an agent, registering it on first use.
    pub fn agent_queue(&self, agent_id: &str) -> Queue<JobRecord> {
        self.queue(&keys::agent_queue(agent_id))
    }

    pub fn queue(&self, queue_name: &str) -> Queue<JobRecord> {
        self.queues
            .entry(queue_name.to_string())
            .or_insert_with(|| {
                Queue::new(
                    queue_name,
                    Arc::clone(&self.store),
                    self.tuning.clone(),
                    self.events.clone(),
                )
            })
            .clone()
    }

    pub fn registered_queues(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Create a job, routing through a dependency flow when the record
    /// carries `depends_on`. Re-creating an existing jobId is a no-op
    /// returning the id (jobId doubles as the idempotency key).
    pub async fn create_job(&self, record: JobRecord) -> Result<String> {
        self.create_job_delayed(record, None).await
    }

    pub async fn create_job_delayed(
        &self,
        record: JobRecord,
        delay_ms: Option<u64>,
    ) -> Result<String> {
        let job_id = record.job_id.clone();
        if self
            .store
            .hget(&keys::job_index(), &job_id)
            .await?
            .is_some()
        {
            debug!(job_id, "Job already exists, dispatch is idempotent");
            return Ok(job_id);
        }

        let queue_name = keys::agent_queue(&record.target);
        let queue = self.queue(&queue_name);
        let depends_on = record.depends_on.clone();
        let target = record.target.clone();

        for dependency in &depends_on {
            if self
                .store
                .hget(&keys::job_index(), dependency)
                .await?
                .is_none()
            {
                return Err(ForemanError::JobNotFound(format!(
                    "dependency {} does not exist",
                    dependency
                )));
            }
        }

        let mut envelope = JobEnvelope::new(job_id.clone(), record, &self.tuning);
        if let Some(delay_ms) = delay_ms {
            envelope = envelope.delayed_until(Utc::now() + Duration::milliseconds(delay_ms as i64));
        }

        self.store
            .hset(&keys::job_index(), &job_id, &queue_name)
            .await?;
        if depends_on.is_empty() {
            queue.add(&envelope).await?;
        } else {
            self.flow
                .create_flow(&queue, &envelope, &depends_on, &target)
                .await?;
        }
        Ok(job_id)
    }

    /// Track a spawn that bypassed the queue (the direct spawn tool).
    /// The record lands in the envelope hash and indexes without ever
    /// entering the waiting list; its launch already happened.
    pub async fn track_external(&self, record: JobRecord) -> Result<()> {
        let job_id = record.job_id.clone();
        if self
            .store
            .hget(&keys::job_index(), &job_id)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let queue_name = keys::agent_queue(&record.target);
        let session_key = record.session_key.clone();
        let envelope = JobEnvelope::new(job_id.clone(), record, &self.tuning);
        self.queue(&queue_name).save(&envelope).await?;
        self.store
            .hset(&keys::job_index(), &job_id, &queue_name)
            .await?;
        if let Some(session_key) = session_key {
            self.index_session_key(&session_key, &job_id, &queue_name)
                .await?;
        }
        Ok(())
    }

    /// Index-first lookup with scan fallback. A hit found by scanning
    /// repairs the index.
    pub async fn locate(&self, job_id: &str) -> Result<Option<LocatedJob>> {
        if let Some(queue_name) = self.store.hget(&keys::job_index(), job_id).await? {
            if let Some(envelope) = self.queue(&queue_name).get(job_id).await? {
                return Ok(Some(LocatedJob {
                    queue_name,
                    envelope,
                }));
            }
        }
        for queue_name in self.registered_queues() {
            if let Some(envelope) = self.queue(&queue_name).get(job_id).await? {
                warn!(job_id, queue = %queue_name, "Job index miss repaired by scan");
                self.store
                    .hset(&keys::job_index(), job_id, &queue_name)
                    .await?;
                return Ok(Some(LocatedJob {
                    queue_name,
                    envelope,
                }));
            }
        }
        Ok(None)
    }

    pub async fn find_by_job_id(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.locate(job_id).await?.map(|l| l.envelope.payload))
    }

    pub async fn find_by_session_key(&self, session_key: &str) -> Result<Option<JobRecord>> {
        if let Some(raw) = self.store.hget(&keys::session_index(), session_key).await?
            && let Ok(entry) = serde_json::from_str::<SessionIndexEntry>(&raw)
            && let Some(envelope) = self.queue(&entry.queue_name).get(&entry.job_id).await?
        {
            return Ok(Some(envelope.payload));
        }
        // Scan fallback across every registered queue.
        for queue_name in self.registered_queues() {
            for envelope in self.queue(&queue_name).all_envelopes().await? {
                if envelope.payload.session_key.as_deref() == Some(session_key) {
                    warn!(session_key, job_id = %envelope.id,
                        "Session index miss repaired by scan");
                    self.index_session_key(session_key, &envelope.id, &queue_name)
                        .await?;
                    return Ok(Some(envelope.payload));
                }
            }
        }
        Ok(None)
    }

    /// Reverse index written once the worker learns the child session
    /// key.
    pub async fn index_session_key(
        &self,
        session_key: &str,
        job_id: &str,
        queue_name: &str,
    ) -> Result<()> {
        let entry = SessionIndexEntry {
            job_id: job_id.to_string(),
            queue_name: queue_name.to_string(),
        };
        self.store
            .hset(
                &keys::session_index(),
                session_key,
                &serde_json::to_string(&entry)?,
            )
            .await
    }

    /// Apply a record-level status transition plus extras. Same-status
    /// updates are idempotent; invalid transitions are rejected so
    /// observed statuses always form a valid path.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        patch: &RecordPatch,
    ) -> Result<JobRecord> {
        let Some(located) = self.locate(job_id).await? else {
            return Err(ForemanError::JobNotFound(job_id.to_string()));
        };
        let mut envelope = located.envelope;
        let current = envelope.payload.status;
        if current != status && !current.can_transition_to(status) {
            return Err(ForemanError::InvalidTransition {
                from: current.to_string(),
                to: status.to_string(),
            });
        }
        envelope.payload.status = status;
        patch.apply_to(&mut envelope.payload);
        self.queue(&located.queue_name).save(&envelope).await?;
        debug!(job_id, from = %current, to = %status, "Job status updated");
        Ok(envelope.payload)
    }

    /// Whether the job is still parked behind dependency gates.
    pub async fn waiting_for_dependencies(&self, job_id: &str) -> Result<bool> {
        match self.store.hget(&keys::job_index(), job_id).await? {
            Some(queue_name) => self.queue(&queue_name).is_gated(job_id).await,
            None => Ok(false),
        }
    }

    pub async fn queue_counts(&self, agent_id: &str) -> Result<QueueCounts> {
        self.agent_queue(agent_id).counts().await
    }

    /// Jobs dispatched by `dispatcher` whose child sessions are still
    /// running. The fan-out cap reads this.
    pub async fn count_active_children(&self, dispatcher: &str) -> Result<u64> {
        let mut count = 0;
        for queue_name in self.registered_queues() {
            for envelope in self.queue(&queue_name).all_envelopes().await? {
                if envelope.payload.dispatched_by == dispatcher
                    && envelope.payload.status == JobStatus::Active
                {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Every record on the registered queues. Listing tools filter this.
    pub async fn all_records(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        for queue_name in self.registered_queues() {
            if queue_name == keys::GATE_QUEUE {
                continue;
            }
            for envelope in self.queue(&queue_name).all_envelopes().await? {
                records.push(envelope.payload);
            }
        }
        Ok(records)
    }

    /// One-shot restart recovery: any record a restart interrupted is
    /// force-failed (fail-forward; the dispatcher may re-dispatch).
    pub async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for queue_name in self.registered_queues() {
            if queue_name == keys::GATE_QUEUE {
                continue;
            }
            let queue = self.queue(&queue_name);
            for mut envelope in queue.all_envelopes().await? {
                if !envelope.payload.status.is_interrupted_by_restart() {
                    continue;
                }
                envelope.payload.status = JobStatus::Failed;
                envelope.payload.error = Some(RESTART_ERROR.to_string());
                envelope.payload.completed_at = Some(Utc::now());
                queue.save(&envelope).await?;
                warn!(job_id = %envelope.id, queue = %queue_name,
                    "Recovered interrupted job as failed");
                recovered.push(envelope.id);
            }
        }
        Ok(recovered)
    }

    /// Remove index entries whose jobs are gone, in batches of
    /// `CLEANUP_BATCH` so no single store operation runs long.
    pub async fn cleanup_stale_index_entries(&self) -> Result<u64> {
        let mut removed = 0;

        let job_entries = self.store.hgetall(&keys::job_index()).await?;
        for chunk in job_entries.chunks(CLEANUP_BATCH) {
            for (job_id, queue_name) in chunk {
                if !self.queue(queue_name).exists(job_id).await? {
                    self.store.hdel(&keys::job_index(), job_id).await?;
                    removed += 1;
                }
            }
        }

        let session_entries = self.store.hgetall(&keys::session_index()).await?;
        for chunk in session_entries.chunks(CLEANUP_BATCH) {
            for (session_key, raw) in chunk {
                let stale = match serde_json::from_str::<SessionIndexEntry>(raw) {
                    Ok(entry) => !self.queue(&entry.queue_name).exists(&entry.job_id).await?,
                    Err(_) => true,
                };
                if stale {
                    self.store.hdel(&keys::session_index(), session_key).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "Pruned stale index entries");
        }
        Ok(removed)
    }
}
