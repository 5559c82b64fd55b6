//! Per-conversation session state
//!
//! A session owns its conversation transcript, step history, working
//! context and cancellation token. Sessions live in memory only and are
//! garbage-collected after an idle TTL; a process restart discards them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::{HarveyError, Result};
use crate::llm::MessageRole;
use crate::pricing::context::ContextArena;

/// Conversation length bound; oldest messages are dropped first
const MAX_CONVERSATION_MESSAGES: usize = 64;

/// Cooperative cancellation handle, checked at every suspension point.
///
/// Cloning shares the underlying flag; cancelling wakes all waiters.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // Sender gone without cancelling; treat as never-cancelled
                // and park forever so select! arms don't spuriously fire.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One transcript message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One tool call requested within a step, arguments already canonicalised
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
}

/// Immutable record of one loop iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub index: usize,
    pub thought: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// One observation per tool call, in call-declaration order
    pub observations: Vec<Value>,
    pub duration_ms: u64,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Lifecycle of a session's current turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Answered,
    Failed,
    Cancelled,
    BudgetExhausted,
}

/// One conversation with its working set
pub struct Session {
    pub id: Uuid,
    pub conversation: Vec<Message>,
    pub steps: Vec<AgentStep>,
    pub context: ContextArena,
    pub status: SessionStatus,
    pub last_active: DateTime<Utc>,
    cancel: CancelToken,
}

impl Session {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            conversation: Vec::new(),
            steps: Vec::new(),
            context: ContextArena::new(),
            status: SessionStatus::Idle,
            last_active: Utc::now(),
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// Append a message, trimming the transcript to its bound.
    pub fn push_message(&mut self, role: MessageRole, content: impl Into<String>) {
        self.conversation.push(Message {
            role,
            content: content.into(),
            created_at: Utc::now(),
        });
        if self.conversation.len() > MAX_CONVERSATION_MESSAGES {
            let excess = self.conversation.len() - MAX_CONVERSATION_MESSAGES;
            self.conversation.drain(..excess);
        }
        self.touch();
    }

    /// Append a step; indices must be contiguous from zero.
    pub fn push_step(&mut self, step: AgentStep) -> Result<()> {
        if step.index != self.steps.len() {
            return Err(HarveyError::internal(format!(
                "step index {} does not follow {} recorded steps",
                step.index,
                self.steps.len()
            )));
        }
        self.steps.push(step);
        self.touch();
        Ok(())
    }
}

/// In-memory session registry with idle GC
pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, Arc<Mutex<Session>>>>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_ttl,
        }
    }

    pub async fn create(&self) -> (Uuid, Arc<Mutex<Session>>) {
        let id = Uuid::new_v4();
        let session = Arc::new(Mutex::new(Session::new(id)));
        self.sessions.lock().await.insert(id, session.clone());
        debug!(session_id = %id, "session created");
        (id, session)
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| HarveyError::SessionNotFound {
                session_id: id.to_string(),
            })
    }

    /// Cancel a session's current work.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let session = self.get(id).await?;
        let mut session = session.lock().await;
        session.cancel_token().cancel();
        session.status = SessionStatus::Cancelled;
        Ok(())
    }

    /// Drop sessions idle past the TTL; returns how many were collected.
    pub async fn gc_idle(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.idle_ttl).unwrap_or(chrono::Duration::minutes(30));
        let mut sessions = self.sessions.lock().await;
        let mut collected = Vec::new();
        for (id, session) in sessions.iter() {
            if let Ok(session) = session.try_lock() {
                if session.last_active < cutoff {
                    collected.push(*id);
                }
            }
        }
        for id in &collected {
            sessions.remove(id);
            debug!(session_id = %id, "session garbage-collected");
        }
        collected.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize) -> AgentStep {
        AgentStep {
            index,
            thought: String::new(),
            tool_calls: Vec::new(),
            observations: Vec::new(),
            duration_ms: 1,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    #[test]
    fn step_indices_must_be_contiguous_from_zero() {
        let mut session = Session::new(Uuid::new_v4());
        assert!(session.push_step(step(0)).is_ok());
        assert!(session.push_step(step(1)).is_ok());
        assert!(session.push_step(step(3)).is_err());
        assert!(session.push_step(step(1)).is_err());
        assert!(session.push_step(step(2)).is_ok());
        assert_eq!(session.steps.len(), 3);
    }

    #[test]
    fn conversation_is_bounded() {
        let mut session = Session::new(Uuid::new_v4());
        for n in 0..(MAX_CONVERSATION_MESSAGES + 10) {
            session.push_message(MessageRole::User, format!("message {n}"));
        }
        assert_eq!(session.conversation.len(), MAX_CONVERSATION_MESSAGES);
        assert_eq!(session.conversation[0].content, "message 10");
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn store_creates_gets_and_cancels() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (id, _session) = store.create().await;
        assert_eq!(store.len().await, 1);

        let fetched = store.get(id).await.unwrap();
        let token = fetched.lock().await.cancel_token();
        store.cancel(id).await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(fetched.lock().await.status, SessionStatus::Cancelled);

        assert!(store.get(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn idle_sessions_are_collected() {
        let store = SessionStore::new(Duration::from_millis(20));
        let (id, session) = store.create().await;
        {
            // Backdate the session past the idle TTL.
            let mut session = session.lock().await;
            session.last_active = Utc::now() - chrono::Duration::seconds(60);
        }
        assert_eq!(store.gc_idle().await, 1);
        assert!(store.get(id).await.is_err());
    }
}
