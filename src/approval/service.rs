use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::record::{ApprovalRecord, ApprovalRequest, ApprovalStatus};
use crate::alerts::{NOTIFICATION_MAX_CHARS, sanitize_notification};
use crate::config::ForemanConfig;
use crate::error::{ForemanError, Result};
use crate::host::MessageSender;
use crate::spawn::{LaunchChecks, LaunchSpec, SessionLauncher};
use crate::store::{CasOutcome, Store, keys};
use crate::utils::{short_id, truncate_chars};

/// Full-UUID input length; anything shorter prefix-matches against the
/// pending set.
const FULL_UUID_LEN: usize = 36;

#[derive(Debug)]
pub enum ApprovalOutcome {
    Approved {
        id: String,
        run_id: String,
        session_key: String,
    },
    Rejected {
        id: String,
    },
    /// The record was already past the decision point; carries the
    /// status observed at the CAS.
    AlreadyInState {
        id: String,
        status: String,
    },
    Expired {
        id: String,
    },
    /// Approved, but the spawn failed; the record stays retry-eligible.
    SpawnFailed {
        id: String,
        error: String,
    },
    NotFound {
        input: String,
    },
    Ambiguous {
        input: String,
        matches: usize,
    },
}

pub struct ApprovalService {
    store: Arc<dyn Store>,
    config: Arc<ForemanConfig>,
    sender: Arc<dyn MessageSender>,
    launcher: Arc<SessionLauncher>,
}

impl ApprovalService {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ForemanConfig>,
        sender: Arc<dyn MessageSender>,
        launcher: Arc<SessionLauncher>,
    ) -> Self {
        Self {
            store,
            config,
            sender,
            launcher,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.approval.ttl_days) * 86_400)
    }

    /// Create a pending approval. The notification goes out first; a
    /// record is only persisted once its notification exists, so no
    /// orphan records accumulate.
    pub async fn create(&self, request: ApprovalRequest) -> Result<ApprovalRecord> {
        let channel = self.config.approval.discord_channel_id.clone();
        if channel.is_empty() {
            return Err(ForemanError::Config(
                "approval channel not configured".to_string(),
            ));
        }

        let mut record = ApprovalRecord::new(
            Uuid::new_v4().to_string(),
            request,
            self.config.approval.ttl_days,
        );

        let body = self.notification_body(&record);
        let sent = self
            .sender
            .send(&channel, "", &body, &format!("approval-{}", record.id))
            .await?;
        record.notification_message_id = Some(sent.message_id.clone());
        record.notification_channel_id = Some(channel);

        self.save(&record).await?;
        self.store
            .zadd(
                &keys::approvals_pending(),
                &record.id,
                record.created_at.timestamp_millis() as f64,
            )
            .await?;
        if let Some(project) = &record.project {
            self.store
                .zadd(
                    &keys::approvals_project(project),
                    &record.id,
                    record.created_at.timestamp_millis() as f64,
                )
                .await?;
        }
        self.store
            .set_ex(
                &keys::approval_by_message(&sent.message_id),
                &record.id,
                self.ttl(),
            )
            .await?;

        info!(approval_id = %record.id, caller = %record.caller, target = %record.target,
            "Approval requested");
        Ok(record)
    }

    fn notification_body(&self, record: &ApprovalRecord) -> String {
        let mut body = format!(
            "Approval requested: {} -> {}\n",
            record.caller, record.target
        );
        if let Some(reason) = &record.reason {
            body.push_str(&format!("Reason: {}\n", reason));
        }
        body.push_str(&format!("Task: {}\n", record.task));
        body.push_str(&format!(
            "Approve with /approve {} or react with ✅",
            short_id(&record.id)
        ));
        // Truncate after sanitizing so a crafted prefix cannot push the
        // payload past the filters.
        truncate_chars(&sanitize_notification(&body), NOTIFICATION_MAX_CHARS)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApprovalRecord>> {
        match self.store.get(&keys::approval(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &ApprovalRecord) -> Result<()> {
        let remaining = (record.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        self.store
            .set_ex(
                &keys::approval(&record.id),
                &serde_json::to_string(record)?,
                remaining,
            )
            .await
    }

    /// Resolve operator input: a full UUID goes straight through, a
    /// shorter string must prefix-match exactly one pending approval.
    async fn resolve_input(&self, input: &str) -> Result<ResolvedInput> {
        if input.len() == FULL_UUID_LEN && input.contains('-') {
            return Ok(ResolvedInput::Id(input.to_string()));
        }
        let pending = self.store.zrange(&keys::approvals_pending(), 0, -1).await?;
        let matches: Vec<&String> = pending.iter().filter(|id| id.starts_with(input)).collect();
        match matches.len() {
            0 => Ok(ResolvedInput::NotFound),
            1 => Ok(ResolvedInput::Id(matches[0].clone())),
            n => Ok(ResolvedInput::Ambiguous(n)),
        }
    }

    pub async fn approve(&self, input: &str, approver: &str) -> Result<ApprovalOutcome> {
        let id = match self.resolve_input(input).await? {
            ResolvedInput::Id(id) => id,
            ResolvedInput::NotFound => {
                return Ok(ApprovalOutcome::NotFound {
                    input: input.to_string(),
                });
            }
            ResolvedInput::Ambiguous(matches) => {
                return Ok(ApprovalOutcome::Ambiguous {
                    input: input.to_string(),
                    matches,
                });
            }
        };

        if let Some(outcome) = self.expire_if_needed(&id).await? {
            return Ok(outcome);
        }

        let cas = self
            .store
            .compare_and_swap_status(
                &keys::approval(&id),
                &[
                    ApprovalStatus::Pending.as_str(),
                    ApprovalStatus::ApprovedSpawnFailed.as_str(),
                ],
                ApprovalStatus::Approved.as_str(),
                "approvedAt",
                &Utc::now().to_rfc3339(),
            )
            .await?;

        match cas {
            CasOutcome::Swapped => {
                self.remove_from_indexes(&id).await?;
                let Some(mut record) = self.get(&id).await? else {
                    return Ok(ApprovalOutcome::NotFound { input: id });
                };
                match self.spawn_approved(&record, approver).await {
                    Ok((run_id, session_key)) => {
                        record.spawn_run_id = Some(run_id.clone());
                        record.spawn_session_key = Some(session_key.clone());
                        self.save(&record).await?;
                        info!(approval_id = %id, %approver, run_id, "Approval spawned");
                        Ok(ApprovalOutcome::Approved {
                            id,
                            run_id,
                            session_key,
                        })
                    }
                    Err(e) => {
                        record.status = ApprovalStatus::ApprovedSpawnFailed;
                        self.save(&record).await?;
                        warn!(approval_id = %id, error = %e, "Approved spawn failed");
                        Ok(ApprovalOutcome::SpawnFailed {
                            id,
                            error: e.to_string(),
                        })
                    }
                }
            }
            CasOutcome::Conflict(status) => Ok(ApprovalOutcome::AlreadyInState { id, status }),
            CasOutcome::Missing => Ok(ApprovalOutcome::NotFound { input: id }),
            CasOutcome::Malformed => Err(ForemanError::Store(format!(
                "approval record {} is malformed",
                id
            ))),
        }
    }

    /// Reject only takes `pending`; a near-simultaneous approve wins or
    /// loses at the CAS, never both.
    pub async fn reject(&self, input: &str, rejecter: &str) -> Result<ApprovalOutcome> {
        let id = match self.resolve_input(input).await? {
            ResolvedInput::Id(id) => id,
            ResolvedInput::NotFound => {
                return Ok(ApprovalOutcome::NotFound {
                    input: input.to_string(),
                });
            }
            ResolvedInput::Ambiguous(matches) => {
                return Ok(ApprovalOutcome::Ambiguous {
                    input: input.to_string(),
                    matches,
                });
            }
        };

        if let Some(outcome) = self.expire_if_needed(&id).await? {
            return Ok(outcome);
        }

        let cas = self
            .store
            .compare_and_swap_status(
                &keys::approval(&id),
                &[ApprovalStatus::Pending.as_str()],
                ApprovalStatus::Rejected.as_str(),
                "rejectedAt",
                &Utc::now().to_rfc3339(),
            )
            .await?;

        match cas {
            CasOutcome::Swapped => {
                self.remove_from_indexes(&id).await?;
                info!(approval_id = %id, %rejecter, "Approval rejected");
                Ok(ApprovalOutcome::Rejected { id })
            }
            CasOutcome::Conflict(status) => Ok(ApprovalOutcome::AlreadyInState { id, status }),
            CasOutcome::Missing => Ok(ApprovalOutcome::NotFound { input: id }),
            CasOutcome::Malformed => Err(ForemanError::Store(format!(
                "approval record {} is malformed",
                id
            ))),
        }
    }

    /// Pending approvals, oldest first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<ApprovalRecord>> {
        let ids = self
            .store
            .zrange(&keys::approvals_pending(), 0, limit.saturating_sub(1) as isize)
            .await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&id).await? {
                records.push(record);
            } else {
                // TTL beat the sorted set; prune the stale member.
                self.store.zrem(&keys::approvals_pending(), &id).await?;
            }
        }
        Ok(records)
    }

    pub async fn lookup_by_message(&self, message_id: &str) -> Result<Option<String>> {
        self.store.get(&keys::approval_by_message(message_id)).await
    }

    async fn expire_if_needed(&self, id: &str) -> Result<Option<ApprovalOutcome>> {
        let Some(mut record) = self.get(id).await? else {
            return Ok(Some(ApprovalOutcome::NotFound {
                input: id.to_string(),
            }));
        };
        if record.status == ApprovalStatus::Pending && record.is_expired_at(Utc::now()) {
            record.status = ApprovalStatus::Expired;
            record.expired_at = Some(Utc::now());
            self.save(&record).await?;
            self.remove_from_indexes(id).await?;
            debug!(approval_id = %id, "Approval expired before decision");
            return Ok(Some(ApprovalOutcome::Expired { id: id.to_string() }));
        }
        Ok(None)
    }

    async fn remove_from_indexes(&self, id: &str) -> Result<()> {
        self.store.zrem(&keys::approvals_pending(), id).await?;
        if let Some(record) = self.get(id).await?
            && let Some(project) = &record.project
        {
            self.store.zrem(&keys::approvals_project(project), id).await?;
        }
        Ok(())
    }

    /// Post-approval spawn: same launch routine as the worker, but with a
    /// human already in the loop the depth/fan-out/allowlist checks are
    /// off and the child runs at the top level. The dispatcher's original
    /// session stays the announce requester.
    async fn spawn_approved(
        &self,
        record: &ApprovalRecord,
        approver: &str,
    ) -> std::result::Result<(String, String), crate::queue::WorkerError> {
        let preamble = sanitize_notification(&format!(
            "{} has approved this dispatch.",
            approver
        ));
        let spec = LaunchSpec {
            target: record.target.clone(),
            task: format!("{}\n\n{}", preamble, record.task),
            label: record.label.clone(),
            model: record.model.clone(),
            thinking_level: record.thinking_level.clone(),
            system_prompt_addition: None,
            timeout_seconds: record.timeout_seconds,
            cleanup: record.cleanup,
            dispatcher_agent_id: record.caller.clone(),
            dispatcher_session_key: record.dispatcher_session_key.clone(),
            dispatcher_depth: None,
            origin: record.origin.clone(),
        };
        let outcome = self.launcher.launch(&spec, LaunchChecks::Approved).await?;
        Ok((outcome.run_id, outcome.session_key))
    }
}

enum ResolvedInput {
    Id(String),
    NotFound,
    Ambiguous(usize),
}
