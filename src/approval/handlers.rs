//! Approval command and reaction handlers.
//!
//! Both run the same control flow through `ApprovalService`; only the
//! trigger differs. The command handler answers with text; the reaction
//! handler answers by adjusting reactions. Neither ever throws to the
//! platform.

use std::sync::Arc;

use tracing::{debug, warn};

use super::service::{ApprovalOutcome, ApprovalService};
use super::{APPROVE_EMOJI, REJECT_EMOJI};
use crate::config::ForemanConfig;
use crate::host::MessageSender;
use crate::utils::{format_relative, short_id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalCommand {
    Approve(String),
    Reject(String),
    Pending,
}

impl ApprovalCommand {
    /// Parse a slash-command line. Unknown commands are not ours.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().split_whitespace();
        match parts.next()? {
            "/approve" => Some(Self::Approve(parts.next()?.to_string())),
            "/reject" => Some(Self::Reject(parts.next()?.to_string())),
            "/pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

pub struct CommandHandler {
    service: Arc<ApprovalService>,
    config: Arc<ForemanConfig>,
}

impl CommandHandler {
    pub fn new(service: Arc<ApprovalService>, config: Arc<ForemanConfig>) -> Self {
        Self { service, config }
    }

    fn is_authorized(&self, caller_id: &str) -> bool {
        // An empty approver list authorizes nobody.
        self.config
            .approval
            .authorized_approvers
            .iter()
            .any(|a| a == caller_id)
    }

    /// Run one command and produce the user-facing reply.
    pub async fn handle(&self, caller_id: &str, command: ApprovalCommand) -> String {
        if !self.is_authorized(caller_id) {
            return "You are not authorized to approve or reject dispatches.".to_string();
        }
        match command {
            ApprovalCommand::Approve(input) => match self.service.approve(&input, caller_id).await
            {
                Ok(outcome) => describe_outcome(&outcome),
                Err(e) => {
                    warn!(error = %e, input, "Approve command failed");
                    format!("Approve failed: {}", e)
                }
            },
            ApprovalCommand::Reject(input) => match self.service.reject(&input, caller_id).await {
                Ok(outcome) => describe_outcome(&outcome),
                Err(e) => {
                    warn!(error = %e, input, "Reject command failed");
                    format!("Reject failed: {}", e)
                }
            },
            ApprovalCommand::Pending => match self.service.pending(20).await {
                Ok(records) if records.is_empty() => "No pending approvals.".to_string(),
                Ok(records) => {
                    let mut lines = vec![format!("{} pending approval(s):", records.len())];
                    for record in records {
                        lines.push(format!(
                            "  {} {} -> {} ({})",
                            short_id(&record.id),
                            record.caller,
                            record.target,
                            format_relative(record.created_at)
                        ));
                    }
                    lines.join("\n")
                }
                Err(e) => format!("Could not list approvals: {}", e),
            },
        }
    }
}

fn describe_outcome(outcome: &ApprovalOutcome) -> String {
    match outcome {
        ApprovalOutcome::Approved { id, run_id, .. } => {
            format!("Approved {}. Child session started (run {}).", short_id(id), run_id)
        }
        ApprovalOutcome::Rejected { id } => format!("Rejected {}.", short_id(id)),
        ApprovalOutcome::AlreadyInState { id, status } => {
            format!("Job {} is already {}", short_id(id), status)
        }
        ApprovalOutcome::Expired { id } => format!("Job {} has expired.", short_id(id)),
        ApprovalOutcome::SpawnFailed { id, error } => format!(
            "Approved {} but the spawn failed: {}. Approve again to retry.",
            short_id(id),
            error
        ),
        ApprovalOutcome::NotFound { input } => {
            format!("No pending approval matches '{}'.", input)
        }
        ApprovalOutcome::Ambiguous { input, matches } => format!(
            "'{}' matches {} pending approvals; use more of the id.",
            input, matches
        ),
    }
}

/// Platform reaction on an approval notification.
#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub channel_id: String,
    pub message_id: String,
    pub emoji: String,
    pub reactor_id: String,
    pub from_bot: bool,
}

pub struct ReactionHandler {
    service: Arc<ApprovalService>,
    config: Arc<ForemanConfig>,
    sender: Arc<dyn MessageSender>,
}

impl ReactionHandler {
    pub fn new(
        service: Arc<ApprovalService>,
        config: Arc<ForemanConfig>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            service,
            config,
            sender,
        }
    }

    /// Process one reaction. All failures are logged and swallowed; a
    /// reaction must never take the gateway down.
    pub async fn handle(&self, event: ReactionEvent) {
        if event.channel_id != self.config.approval.discord_channel_id || event.from_bot {
            return;
        }
        if event.emoji != APPROVE_EMOJI && event.emoji != REJECT_EMOJI {
            return;
        }

        let authorized = self
            .config
            .approval
            .authorized_approvers
            .iter()
            .any(|a| a == &event.reactor_id);
        if !authorized {
            // Silently remove the unauthorized reaction.
            if let Err(e) = self
                .sender
                .remove_reaction(
                    &event.channel_id,
                    &event.message_id,
                    &event.emoji,
                    Some(&event.reactor_id),
                )
                .await
            {
                debug!(error = %e, "Failed to remove unauthorized reaction");
            }
            return;
        }

        let approval_id = match self.service.lookup_by_message(&event.message_id).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(message_id = %event.message_id, "Reaction on unknown message");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Approval lookup by message failed");
                return;
            }
        };

        if event.emoji == APPROVE_EMOJI {
            match self.service.approve(&approval_id, &event.reactor_id).await {
                Ok(ApprovalOutcome::Approved { .. }) => {
                    self.remove_reaction(&event, REJECT_EMOJI, None).await;
                }
                Ok(ApprovalOutcome::SpawnFailed { .. }) => {
                    // Clear the approver's check so re-reacting retries.
                    self.remove_reaction(&event, APPROVE_EMOJI, Some(&event.reactor_id))
                        .await;
                }
                Ok(outcome) => debug!(?outcome, "Approve reaction had no effect"),
                Err(e) => warn!(error = %e, approval_id, "Approve reaction failed"),
            }
        } else {
            match self.service.reject(&approval_id, &event.reactor_id).await {
                Ok(ApprovalOutcome::Rejected { .. }) => {
                    self.remove_reaction(&event, APPROVE_EMOJI, None).await;
                }
                Ok(outcome) => debug!(?outcome, "Reject reaction had no effect"),
                Err(e) => warn!(error = %e, approval_id, "Reject reaction failed"),
            }
        }
    }

    async fn remove_reaction(&self, event: &ReactionEvent, emoji: &str, reactor: Option<&str>) {
        if let Err(e) = self
            .sender
            .remove_reaction(&event.channel_id, &event.message_id, emoji, reactor)
            .await
        {
            debug!(error = %e, emoji, "Failed to adjust reaction");
        }
    }
}
