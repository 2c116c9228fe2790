//! Message and conversation primitives.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message (instructions)
    System,
    /// User message
    User,
    /// Assistant response
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(Error::Validation(format!("unknown role '{}'", other))),
        }
    }
}

/// A message in a conversation.
///
/// Content is always present; an empty string is a valid message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier assigned by an external system, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Message role
    pub role: Role,
    /// Message text
    #[serde(default)]
    pub content: String,
    /// Creation time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with the given role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Attach an external identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a freshly generated identifier.
    pub fn with_generated_id(self) -> Self {
        self.with_id(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn test_unknown_role_rejected_on_deserialize() {
        let result: std::result::Result<Message, _> =
            serde_json::from_str(r#"{"role": "tool", "content": "x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_content_is_empty() {
        let msg: Message = serde_json::from_str(r#"{"role": "assistant"}"#).unwrap();
        assert_eq!(msg.content, "");
        assert!(msg.id.is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let msg = Message::user("hi").with_id("ext-1");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["id"], "ext-1");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = Message::user("a").with_generated_id();
        let b = Message::user("b").with_generated_id();
        assert!(a.id.is_some());
        assert_ne!(a.id, b.id);
    }
}
