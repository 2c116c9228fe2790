//! Session types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// A conversation history keyed by an opaque identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session identifier
    pub id: String,
    /// Messages in insertion order
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty session.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: vec![],
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a message to the end of the history.
    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Replace the whole history.
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.updated_at = Utc::now();
    }

    /// Set a metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_message_preserves_order() {
        let mut session = Session::new("s1");
        session.add_message(Message::user("first"));
        session.add_message(Message::assistant("second"));

        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "first");
        assert_eq!(session.messages[1].content, "second");
        assert!(session.updated_at >= session.created_at);
    }
}
