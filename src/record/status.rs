use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Active,
    Announcing,
    Completed,
    Failed,
    FailedPermanent,
    Retrying,
    Stalled,
}

impl JobStatus {
    /// Transitions are one-way along queued -> active -> announcing ->
    /// completed. Failure is reachable from any non-terminal state; the
    /// only loop is failed -> retrying, which continues in a new record.
    pub fn allowed_transitions(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Queued => &[Active, Failed, Stalled],
            Active => &[Announcing, Completed, Failed, Stalled],
            Announcing => &[Completed, Failed],
            Stalled => &[Active, Queued, Failed],
            Failed => &[Retrying, FailedPermanent],
            Retrying => &[],
            Completed => &[],
            FailedPermanent => &[],
        }
    }

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::FailedPermanent | JobStatus::Retrying
        )
    }

    /// States a restart interrupts: the child session was running and its
    /// outcome is unknown.
    pub fn is_interrupted_by_restart(&self) -> bool {
        matches!(self, JobStatus::Active | JobStatus::Announcing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Announcing => "announcing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedPermanent => "failed_permanent",
            Self::Retrying => "retrying",
            Self::Stalled => "stalled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Active));
        assert!(JobStatus::Active.can_transition_to(JobStatus::Announcing));
        assert!(JobStatus::Announcing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Active.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_failure_reachable_from_non_terminal() {
        for status in [
            JobStatus::Queued,
            JobStatus::Active,
            JobStatus::Announcing,
            JobStatus::Stalled,
        ] {
            assert!(status.can_transition_to(JobStatus::Failed), "{}", status);
        }
    }

    #[test]
    fn test_retry_loop_goes_through_retrying() {
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Retrying));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::FailedPermanent));
        assert!(!JobStatus::Retrying.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::FailedPermanent.is_terminal());
        assert!(JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }

    #[test]
    fn test_no_transitions_out_of_terminal() {
        assert!(JobStatus::Completed.allowed_transitions().is_empty());
        assert!(JobStatus::FailedPermanent.allowed_transitions().is_empty());
    }

    #[test]
    fn test_restart_interruption_set() {
        assert!(JobStatus::Active.is_interrupted_by_restart());
        assert!(JobStatus::Announcing.is_interrupted_by_restart());
        assert!(!JobStatus::Queued.is_interrupted_by_restart());
        assert!(!JobStatus::Completed.is_interrupted_by_restart());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&JobStatus::FailedPermanent).unwrap();
        assert_eq!(json, "\"failed_permanent\"");
        let back: JobStatus = serde_json::from_str("\"announcing\"").unwrap();
        assert_eq!(back, JobStatus::Announcing);
    }
}
