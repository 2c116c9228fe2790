//! Session storage abstraction.

use async_trait::async_trait;
use thiserror::Error;

use steady_core::{Error, Message, RequestError};

/// Errors that can occur during session storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Request failed: {0}")]
    Request(#[from] RequestError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Request(e) => Error::Request(e),
            StoreError::Serialization(e) => Error::Json(e),
            StoreError::Unavailable(msg) => Error::BackendUnavailable(msg),
            StoreError::InvalidResponse(msg) => Error::Decode(msg),
            StoreError::InvalidUrl(msg) => Error::Config(msg),
        }
    }
}

/// Keyed conversation storage.
///
/// Implementations must keep sessions isolated: writes to one id are never
/// observable through another.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Messages of a session in insertion order; empty if it does not exist.
    async fn get_history(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Append one message, creating the session if needed.
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()>;

    /// Replace the whole history, creating the session if needed.
    async fn set_history(&self, session_id: &str, messages: &[Message]) -> Result<()>;

    /// Remove the session and all its messages.
    async fn clear_session(&self, session_id: &str) -> Result<()>;
}
