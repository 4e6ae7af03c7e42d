//! Mock session host and message sender for testing without a live
//! agent runtime or chat platform.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use foreman::error::{ForemanError, HostError};
use foreman::host::{
    HistoryMessage, MessageSender, SentMessage, SessionHost, SessionPatch, StartSessionRequest,
    StartedSession, SubagentRegistration,
};

#[derive(Default)]
pub struct MockSessionHost {
    starts: RwLock<Vec<StartSessionRequest>>,
    patches: RwLock<Vec<(String, SessionPatch)>>,
    registrations: RwLock<Vec<SubagentRegistration>>,
    session_messages: RwLock<Vec<(String, String)>>,
    history: RwLock<Vec<HistoryMessage>>,
    fail_start: RwLock<Option<HostError>>,
    run_counter: AtomicUsize,
}

impl MockSessionHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_count(&self) -> usize {
        self.starts.read().len()
    }

    pub fn started_session_keys(&self) -> Vec<String> {
        self.starts.read().iter().map(|r| r.session_key.clone()).collect()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn messages_to(&self, session_key: &str) -> Vec<String> {
        self.session_messages
            .read()
            .iter()
            .filter(|(key, _)| key == session_key)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn set_history(&self, messages: Vec<(&str, &str)>) {
        *self.history.write() = messages
            .into_iter()
            .map(|(role, content)| HistoryMessage {
                role: role.to_string(),
                content: content.to_string(),
            })
            .collect();
    }

    pub fn fail_next_start(&self, error: HostError) {
        *self.fail_start.write() = Some(error);
    }

    pub fn assert_started(&self, times: usize) {
        let count = self.start_count();
        assert_eq!(
            count, times,
            "Expected {} session starts, saw {}",
            times, count
        );
    }
}

#[async_trait]
impl SessionHost for MockSessionHost {
    async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<StartedSession, HostError> {
        if let Some(e) = self.fail_start.write().take() {
            return Err(e);
        }
        self.starts.write().push(request);
        let n = self.run_counter.fetch_add(1, Ordering::SeqCst);
        Ok(StartedSession {
            run_id: format!("run-{}", n),
        })
    }

    async fn patch_session(&self, session_key: &str, patch: SessionPatch) -> Result<(), HostError> {
        self.patches.write().push((session_key.to_string(), patch));
        Ok(())
    }

    async fn send_to_session(&self, session_key: &str, message: &str) -> Result<(), HostError> {
        self.session_messages
            .write()
            .push((session_key.to_string(), message.to_string()));
        Ok(())
    }

    async fn fetch_session_history(
        &self,
        _session_key: &str,
        _limit: usize,
    ) -> Result<Vec<HistoryMessage>, HostError> {
        Ok(self.history.read().clone())
    }

    async fn register_subagent_run(
        &self,
        registration: SubagentRegistration,
    ) -> Result<(), HostError> {
        self.registrations.write().push(registration);
        Ok(())
    }

    async fn session_depth(&self, _session_key: &str) -> Result<Option<u32>, HostError> {
        Ok(Some(0))
    }
}

#[derive(Default)]
pub struct MockSender {
    sent: RwLock<Vec<(String, String, String)>>,
    removed: RwLock<Vec<(String, String, Option<String>)>>,
    counter: AtomicUsize,
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_to(&self, channel: &str) -> Vec<String> {
        self.sent
            .read()
            .iter()
            .filter(|(c, _, _)| c == channel)
            .map(|(_, content, _)| content.clone())
            .collect()
    }

    pub fn removed_reactions(&self) -> Vec<(String, String, Option<String>)> {
        self.removed.read().clone()
    }
}

#[async_trait]
impl MessageSender for MockSender {
    async fn send(
        &self,
        channel: &str,
        _target: &str,
        content: &str,
        idempotency_key: &str,
    ) -> Result<SentMessage, ForemanError> {
        self.sent.write().push((
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
        self.removed.write().push((
            message_id.to_string(),
            emoji.to_string(),
            reactor.map(str::to_string),
        ));
        Ok(())
    }
}
