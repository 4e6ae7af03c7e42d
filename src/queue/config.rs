use serde::{Deserialize, Serialize};

/// Lock duration for agent queues. A launch runs long; a shorter lock
/// produces false stalls and double-launches. Never configure below this.
pub const MIN_LOCK_DURATION_MS: u64 = 300_000;

/// Gate-queue lock. Strictly greater than the gate polling cap plus
/// buffer.
pub const GATE_LOCK_DURATION_MS: u64 = 35 * 60 * 1_000;

pub const GATE_CONCURRENCY: usize = 10;

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

/// Age/count retention for finished jobs; whichever bound hits first
/// wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Retention {
    pub max_age_ms: u64,
    pub max_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTuning {
    pub lock_duration_ms: u64,
    pub stall_interval_ms: u64,
    /// Stalls tolerated before the job dead-letters.
    pub max_stalled_count: u32,
    /// Launch-failure retry attempts (distinct from agent-level retry).
    pub launch_attempts: u32,
    pub launch_backoff_base_ms: u64,
    pub completed_retention: Retention,
    pub failed_retention: Retention,
    pub poll_interval_ms: u64,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            lock_duration_ms: MIN_LOCK_DURATION_MS,
            stall_interval_ms: 3 * 60 * 1_000,
            max_stalled_count: 2,
            launch_attempts: 3,
            launch_backoff_base_ms: 5_000,
            completed_retention: Retention {
                max_age_ms: 7 * DAY_MS,
                max_count: 1_000,
            },
            failed_retention: Retention {
                max_age_ms: 30 * DAY_MS,
                max_count: 5_000,
            },
            poll_interval_ms: 500,
        }
    }
}

impl QueueTuning {
    /// Tuning for the dependency-gate queue: the handler blocks for up to
    /// the polling cap, so its lock must outlast it.
    pub fn gate() -> Self {
        Self {
            lock_duration_ms: GATE_LOCK_DURATION_MS,
            ..Default::default()
        }
    }

    /// Exponential launch backoff for the given (1-based) attempt.
    pub fn launch_backoff_ms(&self, attempts_made: u32) -> u64 {
        self.launch_backoff_base_ms
            .saturating_mul(1u64 << attempts_made.saturating_sub(1).min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lock_is_five_minutes() {
        let tuning = QueueTuning::default();
        assert_eq!(tuning.lock_duration_ms, 300_000);
        assert!(tuning.lock_duration_ms >= MIN_LOCK_DURATION_MS);
    }

    #[test]
    fn test_gate_lock_exceeds_polling_cap() {
        let gate = QueueTuning::gate();
        let polling_cap_ms = 30 * 60 * 1_000;
        assert!(gate.lock_duration_ms > polling_cap_ms);
    }

    #[test]
    fn test_launch_backoff_doubles() {
        let tuning = QueueTuning::default();
        assert_eq!(tuning.launch_backoff_ms(1), 5_000);
        assert_eq!(tuning.launch_backoff_ms(2), 10_000);
        assert_eq!(tuning.launch_backoff_ms(3), 20_000);
    }
}
