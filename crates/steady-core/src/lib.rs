//! # steady-core
//!
//! Core types and abstractions for Steady, a resilience layer in front of a
//! rate-limited JSON/HTTP query service.
//!
//! This crate provides:
//! - Message and session primitives
//! - The request / session error taxonomy
//! - Configuration system

pub mod config;
pub mod error;
pub mod message;
pub mod session;

pub use config::Config;
pub use error::{Error, RequestError, Result};
pub use message::{Message, Role};
pub use session::Session;
