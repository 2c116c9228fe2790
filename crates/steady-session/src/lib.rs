//! # steady-session
//!
//! Session persistence for Steady.
//!
//! This crate provides:
//! - The [`SessionStore`] capability with in-process and remote backends
//! - [`SessionContinuityManager`], which retries the primary store and
//!   degrades to a local fallback cache instead of failing the caller
//! - Capture of streamed responses into the session history

pub mod continuity;
pub mod memory;
pub mod remote;
pub mod store;

pub use continuity::{
    text_delta, AppendMessage, ClearSession, GetHistory, SessionContinuityManager, SetHistory, StoreOperation,
};
pub use memory::InMemorySessionStore;
pub use remote::RemoteSessionStore;
pub use store::{SessionStore, StoreError};
