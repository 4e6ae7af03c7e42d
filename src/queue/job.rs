use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::QueueTuning;

/// Link from a gate job back to the parent it unblocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub queue: String,
    pub job_id: String,
}

/// Queue-level envelope around a typed payload. Attempt accounting here
/// covers launch retries only; execution retries create new jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "T: Serialize + DeserializeOwned")]
pub struct JobEnvelope<T> {
    pub id: String,
    pub payload: T,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub stalled_count: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_reason: Option<String>,
}

impl<T: Serialize + DeserializeOwned> JobEnvelope<T> {
    pub fn new(id: impl Into<String>, payload: T, tuning: &QueueTuning) -> Self {
        Self {
            id: id.into(),
            payload,
            attempts_made: 0,
            max_attempts: tuning.launch_attempts,
            backoff_base_ms: tuning.launch_backoff_base_ms,
            stalled_count: 0,
            enqueued_at: Utc::now(),
            delay_until: None,
            parent: None,
            finished_at: None,
            failed_reason: None,
        }
    }

    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = Some(at);
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Delay before the next launch attempt, doubling per attempt.
    pub fn next_backoff_ms(&self) -> u64 {
        self.backoff_base_ms
            .saturating_mul(1u64 << self.attempts_made.saturating_sub(1).min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let tuning = QueueTuning::default();
        let envelope = JobEnvelope::new("j1", serde_json::json!({"k": "v"}), &tuning)
            .with_parent(ParentRef {
                queue: "agent-jarvis".to_string(),
                job_id: "p1".to_string(),
            });
        let json = serde_json::to_string(&envelope).unwrap();
        let back: JobEnvelope<serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "j1");
        assert_eq!(back.parent, envelope.parent);
        assert_eq!(back.max_attempts, 3);
    }

    #[test]
    fn test_attempt_accounting() {
        let tuning = QueueTuning::default();
        let mut envelope = JobEnvelope::new("j1", (), &tuning);
        assert!(!envelope.attempts_exhausted());
        envelope.attempts_made = 1;
        assert_eq!(envelope.next_backoff_ms(), 5_000);
        envelope.attempts_made = 3;
        assert!(envelope.attempts_exhausted());
        assert_eq!(envelope.next_backoff_ms(), 20_000);
    }
}
