//! Stub session host shared by in-crate spawn tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{ForemanError, HostError};
use crate::host::{
    HistoryMessage, MessageSender, SentMessage, SessionHost, SessionPatch, StartSessionRequest,
    StartedSession, SubagentRegistration,
};

#[derive(Default)]
pub struct StubHost {
    pub patches: Mutex<Vec<(String, SessionPatch)>>,
    pub starts: Mutex<Vec<StartSessionRequest>>,
    pub registrations: Mutex<Vec<SubagentRegistration>>,
    pub patch_calls: AtomicUsize,
    /// When set, the first patch carrying a model fails with this error.
    pub reject_model: Mutex<Option<HostError>>,
    pub fail_start: Mutex<Option<HostError>>,
    pub history: Mutex<Vec<HistoryMessage>>,
    pub session_messages: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SessionHost for StubHost {
    async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<StartedSession, HostError> {
        if let Some(e) = self.fail_start.lock().clone() {
            return Err(e);
        }
        self.starts.lock().push(request);
        Ok(StartedSession {
            run_id: format!("run-{}", Uuid::new_v4()),
        })
    }

    async fn patch_session(
        &self,
        session_key: &str,
        patch: SessionPatch,
    ) -> Result<(), HostError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        if patch.model.is_some()
            && let Some(e) = self.reject_model.lock().take()
        {
            return Err(e);
        }
        self.patches.lock().push((session_key.to_string(), patch));
        Ok(())
    }

    async fn send_to_session(&self, session_key: &str, message: &str) -> Result<(), HostError> {
        self.session_messages
            .lock()
            .push((session_key.to_string(), message.to_string()));
        Ok(())
    }

    async fn fetch_session_history(
        &self,
        _session_key: &str,
        _limit: usize,
    ) -> Result<Vec<HistoryMessage>, HostError> {
        Ok(self.history.lock().clone())
    }

    async fn register_subagent_run(
        &self,
        registration: SubagentRegistration,
    ) -> Result<(), HostError> {
        self.registrations.lock().push(registration);
        Ok(())
    }

    async fn session_depth(&self, _session_key: &str) -> Result<Option<u32>, HostError> {
        Ok(Some(0))
    }
}

pub fn host_ok() -> Arc<StubHost> {
    Arc::new(StubHost::default())
}

/// Stub message sender recording sends and reaction removals.
#[derive(Default)]
pub struct StubSender {
    pub sent: Mutex<Vec<(String, String, String)>>,
    pub removed_reactions: Mutex<Vec<(String, String, Option<String>)>>,
    pub fail_send: Mutex<Option<ForemanError>>,
    counter: AtomicUsize,
}

#[async_trait]
impl MessageSender for StubSender {
    async fn send(
        &self,
        channel: &str,
        _target: &str,
        content: &str,
        idempotency_key: &str,
    ) -> Result<SentMessage, ForemanError> {
        if let Some(e) = self.fail_send.lock().take() {
            return Err(e);
        }
        self.sent.lock().push((
            channel.to_string(),
            content.to_string(),
            idempotency_key.to_string(),
        ));
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(SentMessage {
            message_id: format!("msg-{}", n),
        })
    }

    async fn remove_reaction(
        &self,
        _channel: &str,
        message_id: &str,
        emoji: &str,
        reactor: Option<&str>,
    ) -> Result<(), ForemanError> {
        self.removed_reactions.lock().push((
            message_id.to_string(),
            emoji.to_string(),
            reactor.map(str::to_string),
        ));
        Ok(())
    }
}

pub fn sender_ok() -> Arc<StubSender> {
    Arc::new(StubSender::default())
}
