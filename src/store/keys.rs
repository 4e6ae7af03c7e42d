//! Keyspace contract.
//!
//! Queue infrastructure lives under `bull:`, orchestrator-owned records
//! under `orch:`. The canonical per-agent queue name is `agent-{agentId}`
//! (hyphen form; the colon form is never read or written).

pub const GATE_QUEUE: &str = "dep-gates";

pub fn agent_queue(agent_id: &str) -> String {
    format!("agent-{}", agent_id)
}

/// Inverse of `agent_queue`. Returns `None` for non-agent queues.
pub fn agent_from_queue(queue_name: &str) -> Option<&str> {
    queue_name.strip_prefix("agent-")
}

// Queue key family.

pub fn queue_waiting(queue: &str) -> String {
    format!("bull:{}:waiting", queue)
}

pub fn queue_delayed(queue: &str) -> String {
    format!("bull:{}:delayed", queue)
}

pub fn queue_active(queue: &str) -> String {
    format!("bull:{}:active", queue)
}

pub fn queue_jobs(queue: &str) -> String {
    format!("bull:{}:jobs", queue)
}

pub fn queue_completed(queue: &str) -> String {
    format!("bull:{}:completed", queue)
}

pub fn queue_failed(queue: &str) -> String {
    format!("bull:{}:failed", queue)
}

pub fn queue_waiting_children(queue: &str) -> String {
    format!("bull:{}:waiting-children", queue)
}

pub fn queue_gate_counts(queue: &str) -> String {
    format!("bull:{}:gate-counts", queue)
}

// Shared indexes.

pub fn job_index() -> String {
    "bull:job-index".to_string()
}

pub fn session_index() -> String {
    "bull:session-index".to_string()
}

pub fn rate_limit_dispatch(caller_agent_id: &str) -> String {
    format!("bull:ratelimit:dispatch:{}", caller_agent_id)
}

// Orchestrator-owned records.

pub fn approval(id: &str) -> String {
    format!("orch:approval:{}", id)
}

pub fn approvals_pending() -> String {
    "orch:approvals:pending".to_string()
}

pub fn approvals_project(project: &str) -> String {
    format!("orch:approvals:project:{}", project)
}

pub fn approval_by_message(notification_message_id: &str) -> String {
    format!("orch:approvals:msg:{}", notification_message_id)
}

pub fn learning(id: &str) -> String {
    format!("orch:learning:{}", id)
}

pub fn learnings_project(project_id: &str) -> String {
    format!("orch:learnings:{}", project_id)
}

pub fn learnings_job(job_id: &str) -> String {
    format!("orch:learnings:job:{}", job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_queue_round_trip() {
        let queue = agent_queue("jarvis");
        assert_eq!(queue, "agent-jarvis");
        assert_eq!(agent_from_queue(&queue), Some("jarvis"));
        assert_eq!(agent_from_queue(GATE_QUEUE), None);
    }

    #[test]
    fn test_key_namespaces() {
        assert!(queue_waiting("agent-jarvis").starts_with("bull:"));
        assert!(approval("abc").starts_with("orch:"));
        assert_eq!(
            rate_limit_dispatch("iris"),
            "bull:ratelimit:dispatch:iris"
        );
    }
}
