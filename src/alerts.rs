//! Redaction and dead-letter alerting.
//!
//! Any user-visible string derived from a job record passes through
//! redaction: base64 blobs, mention patterns, null bytes, and
//! bidirectional override characters never reach a chat channel.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::ForemanConfig;
use crate::host::MessageSender;
use crate::queue::{QueueEventKind, QueueEvents};
use crate::tracker::JobTracker;
use crate::utils::truncate_chars;

/// Character budget for DLQ alert bodies, applied after redaction.
pub const ALERT_MAX_CHARS: usize = 200;

/// Character budget for approval notifications, applied after
/// sanitization.
pub const NOTIFICATION_MAX_CHARS: usize = 500;

static BASE64_RUN: OnceLock<Regex> = OnceLock::new();
static BASE64_URI: OnceLock<Regex> = OnceLock::new();
static MENTION: OnceLock<Regex> = OnceLock::new();

fn base64_run() -> &'static Regex {
    BASE64_RUN.get_or_init(|| Regex::new(r"[A-Za-z0-9+/]{40,}={0,2}").unwrap())
}

fn base64_uri() -> &'static Regex {
    BASE64_URI.get_or_init(|| Regex::new(r"data:[\w.+/-]+;base64,[A-Za-z0-9+/=]+").unwrap())
}

fn mention() -> &'static Regex {
    MENTION.get_or_init(|| Regex::new(r"<[@#][!&]?\d+>|@everyone|@here").unwrap())
}

/// Strip control characters an attacker can hide payloads behind: null
/// bytes and the Unicode bidirectional override/isolate set.
fn strip_control(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '\0' && !('\u{202A}'..='\u{202E}').contains(c) && !('\u{2066}'..='\u{2069}').contains(c))
        .collect()
}

/// Sanitize text bound for a chat notification: control characters out,
/// mention patterns masked, code fences escaped. Truncation happens
/// after, never before, so a crafted prefix cannot smuggle a suffix past
/// the filters.
pub fn sanitize_notification(text: &str) -> String {
    let cleaned = strip_control(text);
    let cleaned = mention().replace_all(&cleaned, "[mention]");
    cleaned.replace("```", "\\`\\`\\`")
}

/// Redact failure content for alerts: everything sanitization covers plus
/// base64 payloads, then the alert budget.
pub fn redact_failure(text: &str) -> String {
    let cleaned = sanitize_notification(text);
    let cleaned = base64_uri().replace_all(&cleaned, "[base64]");
    let cleaned = base64_run().replace_all(&cleaned, "[base64]");
    truncate_chars(&cleaned, ALERT_MAX_CHARS)
}

/// Subscribes to queue failure events and posts redacted alerts to the
/// configured channel. Alert failures are logged and swallowed; alerting
/// never blocks the queues.
pub struct DlqAlerter {
    tracker: Arc<JobTracker>,
    sender: Arc<dyn MessageSender>,
    channel_id: String,
}

impl DlqAlerter {
    pub fn new(
        tracker: Arc<JobTracker>,
        sender: Arc<dyn MessageSender>,
        config: &ForemanConfig,
    ) -> Option<Self> {
        let channel_id = config.approval.discord_channel_id.clone();
        if channel_id.is_empty() {
            debug!("No alert channel configured, DLQ alerting disabled");
            return None;
        }
        Some(Self {
            tracker,
            sender,
            channel_id,
        })
    }

    pub async fn run(self, events: QueueEvents, mut shutdown: watch::Receiver<bool>) {
        let mut receiver = events.subscribe();
        loop {
            let event = tokio::select! {
                event = receiver.recv() => event,
                _ = shutdown.changed() => return,
            };
            match event {
                Ok(event) => {
                    if let QueueEventKind::Failed { reason } = event.kind {
                        self.alert(&event.queue, &event.job_id, &reason).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "DLQ alerter lagged behind queue events");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn alert(&self, queue: &str, job_id: &str, reason: &str) {
        let task_preview = match self.tracker.find_by_job_id(job_id).await {
            Ok(Some(record)) => redact_failure(&record.task),
            _ => String::new(),
        };
        let body = format!(
            "Job {} dead-lettered on {}: {}\n{}",
            job_id,
            queue,
            redact_failure(reason),
            task_preview
        );
        let idempotency_key = format!("dlq-{}", job_id);
        if let Err(e) = self
            .sender
            .send(&self.channel_id, "", body.trim_end(), &idempotency_key)
            .await
        {
            warn!(job_id, error = %e, "Failed to deliver DLQ alert");
        }
    }
}
