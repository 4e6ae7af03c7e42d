//! Project-scoped learning index.
//!
//! Append-only knowledge entries keyed by project and job:
//! - `LearningEntry`: one recorded learning with tags
//! - `LearningIndex`: store-backed writes and newest-first queries
//!
//! Entries expire with a long TTL; nothing here is ever updated in
//! place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{Store, keys};

pub const MAX_LEARNING_CHARS: usize = 1_024;
pub const MAX_TAGS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningEntry {
    pub id: String,
    pub job_id: String,
    pub previous_job_id: Option<String>,
    pub project_id: String,
    pub phase: Option<String>,
    pub agent_id: String,
    pub learning: String,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLearning {
    pub project_id: String,
    pub job_id: String,
    pub previous_job_id: Option<String>,
    pub phase: Option<String>,
    pub agent_id: String,
    pub learning: String,
    pub tags: Vec<String>,
}

pub struct LearningIndex {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl LearningIndex {
    pub fn new(store: Arc<dyn Store>, ttl_days: u32) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(u64::from(ttl_days) * 86_400),
        }
    }

    /// Append one entry; indexes it per-project (timestamp order) and
    /// per-job (insertion order).
    pub async fn add(&self, new: NewLearning) -> Result<LearningEntry> {
        let entry = LearningEntry {
            id: Uuid::new_v4().to_string(),
            job_id: new.job_id,
            previous_job_id: new.previous_job_id,
            project_id: new.project_id,
            phase: new.phase,
            agent_id: new.agent_id,
            learning: new.learning,
            tags: new.tags,
            timestamp: Utc::now(),
        };
        self.store
            .set_ex(
                &keys::learning(&entry.id),
                &serde_json::to_string(&entry)?,
                self.ttl,
            )
            .await?;
        self.store
            .zadd(
                &keys::learnings_project(&entry.project_id),
                &entry.id,
                entry.timestamp.timestamp_millis() as f64,
            )
            .await?;
        self.store
            .expire(&keys::learnings_project(&entry.project_id), self.ttl)
            .await?;
        self.store
            .rpush(&keys::learnings_job(&entry.job_id), &entry.id)
            .await?;
        self.store
            .expire(&keys::learnings_job(&entry.job_id), self.ttl)
            .await?;
        Ok(entry)
    }

    /// Newest-first entries for a project, optionally filtered by tags
    /// (an entry matches when it carries every requested tag).
    pub async fn by_project(
        &self,
        project_id: &str,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<LearningEntry>> {
        let ids = self
            .store
            .zrevrange(&keys::learnings_project(project_id), 0, -1)
            .await?;
        self.collect(ids, tags, limit).await
    }

    /// Entries recorded against one job, newest first.
    pub async fn by_job(
        &self,
        job_id: &str,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<LearningEntry>> {
        let mut ids = self
            .store
            .lrange(&keys::learnings_job(job_id), 0, -1)
            .await?;
        ids.reverse();
        self.collect(ids, tags, limit).await
    }

    async fn collect(
        &self,
        ids: Vec<String>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<LearningEntry>> {
        let mut entries = Vec::new();
        for id in ids {
            if entries.len() >= limit {
                break;
            }
            let Some(raw) = self.store.get(&keys::learning(&id)).await? else {
                // Entry expired ahead of its index; skip.
                continue;
            };
            let entry: LearningEntry = serde_json::from_str(&raw)?;
            if tags.iter().all(|t| entry.tags.contains(t)) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
