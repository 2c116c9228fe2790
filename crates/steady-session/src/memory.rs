//! In-process session store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use steady_core::{Message, Session};

use crate::store::{Result, SessionStore};

/// Mutex-guarded map from session id to [`Session`].
///
/// Every operation takes the same lock, so calls against one session are
/// applied in call order.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a session including metadata and timestamps.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Set a metadata entry, creating the session if needed.
    pub fn set_metadata(&self, session_id: &str, key: impl Into<String>, value: Value) {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id))
            .set_metadata(key, value);
    }

    /// Known session ids in ascending order.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Drop every session.
    pub fn clear(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// Apply `update` only if the session already exists.
    pub(crate) fn update_existing(&self, session_id: &str, update: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.lock().get_mut(session_id) {
            Some(session) => {
                update(session);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_history(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .sessions
            .lock()
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default())
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id))
            .add_message(message.clone());
        Ok(())
    }

    async fn set_history(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id))
            .set_messages(messages.to_vec());
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }
}
