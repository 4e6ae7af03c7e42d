//! Queue state-change events.
//!
//! In-process broadcast channel; the DLQ alerter subscribes to failed
//! events, operator tooling may subscribe to the rest. Lagging receivers
//! skip missed events rather than stalling the queues.

use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEventKind {
    Completed,
    Failed { reason: String },
    Stalled,
    Retrying { delay_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub queue: String,
    pub job_id: String,
    pub kind: QueueEventKind,
}

#[derive(Clone)]
pub struct QueueEvents {
    sender: broadcast::Sender<QueueEvent>,
}

impl QueueEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: QueueEvent) {
        // A send error only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

impl Default for QueueEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let events = QueueEvents::default();
        let mut rx = events.subscribe();
        events.emit(QueueEvent {
            queue: "agent-jarvis".to_string(),
            job_id: "j1".to_string(),
            kind: QueueEventKind::Failed {
                reason: "boom".to_string(),
            },
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, "j1");
        assert!(matches!(event.kind, QueueEventKind::Failed { .. }));
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let events = QueueEvents::default();
        events.emit(QueueEvent {
            queue: "agent-jarvis".to_string(),
            job_id: "j1".to_string(),
            kind: QueueEventKind::Completed,
        });
    }
}
