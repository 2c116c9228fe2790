//! Retry-then-fallback session continuity.
//!
//! [`SessionContinuityManager`] wraps a primary [`SessionStore`]. Each call is
//! tried against the primary up to `max_retries` times with exponential
//! backoff (`base_delay * 2^attempt`). If every attempt fails, the same
//! operation runs against an in-process fallback cache, and if that fails
//! too the operation's safe default is returned. Callers never see an error.
//!
//! Fallback entries are only created while the primary is failing. A later
//! primary success overwrites an entry that already exists but never creates
//! one. Nothing is replayed into the primary once it recovers: fallback data
//! is best-effort and can go stale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use steady_client::{EventStream, RequestExecutor, Sleeper, StreamEvent, TokioSleeper};
use steady_core::config::{SessionBackend, SessionConfig};
use steady_core::{Config, Message};

use crate::memory::InMemorySessionStore;
use crate::remote::RemoteSessionStore;
use crate::store::{self, SessionStore};

/// A session operation that can run against any [`SessionStore`].
///
/// The same operation value is applied to the primary store and, on
/// exhaustion, to the fallback store.
#[async_trait]
pub trait StoreOperation: Send + Sync {
    type Output: Send;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn session_id(&self) -> &str;

    async fn apply(&self, store: &dyn SessionStore) -> store::Result<Self::Output>;

    /// Mirror a primary success into the fallback cache, touching only
    /// sessions the cache already holds.
    fn refresh(&self, cache: &InMemorySessionStore, output: &Self::Output);

    /// Returned when neither store could serve the operation.
    fn safe_default(&self) -> Self::Output;
}

/// Read a session's history.
#[derive(Debug, Clone)]
pub struct GetHistory {
    pub session_id: String,
}

#[async_trait]
impl StoreOperation for GetHistory {
    type Output = Vec<Message>;

    fn name(&self) -> &'static str {
        "get_history"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn apply(&self, store: &dyn SessionStore) -> store::Result<Vec<Message>> {
        store.get_history(&self.session_id).await
    }

    fn refresh(&self, cache: &InMemorySessionStore, output: &Vec<Message>) {
        cache.update_existing(&self.session_id, |s| s.set_messages(output.clone()));
    }

    fn safe_default(&self) -> Vec<Message> {
        Vec::new()
    }
}

/// Append one message to a session.
#[derive(Debug, Clone)]
pub struct AppendMessage {
    pub session_id: String,
    pub message: Message,
}

#[async_trait]
impl StoreOperation for AppendMessage {
    type Output = ();

    fn name(&self) -> &'static str {
        "append_message"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn apply(&self, store: &dyn SessionStore) -> store::Result<()> {
        store.append_message(&self.session_id, &self.message).await
    }

    fn refresh(&self, cache: &InMemorySessionStore, _: &()) {
        cache.update_existing(&self.session_id, |s| s.add_message(self.message.clone()));
    }

    fn safe_default(&self) {}
}

/// Replace a session's history.
#[derive(Debug, Clone)]
pub struct SetHistory {
    pub session_id: String,
    pub messages: Vec<Message>,
}

#[async_trait]
impl StoreOperation for SetHistory {
    type Output = ();

    fn name(&self) -> &'static str {
        "set_history"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn apply(&self, store: &dyn SessionStore) -> store::Result<()> {
        store.set_history(&self.session_id, &self.messages).await
    }

    fn refresh(&self, cache: &InMemorySessionStore, _: &()) {
        cache.update_existing(&self.session_id, |s| s.set_messages(self.messages.clone()));
    }

    fn safe_default(&self) {}
}

/// Remove a session.
#[derive(Debug, Clone)]
pub struct ClearSession {
    pub session_id: String,
}

#[async_trait]
impl StoreOperation for ClearSession {
    type Output = ();

    fn name(&self) -> &'static str {
        "clear_session"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn apply(&self, store: &dyn SessionStore) -> store::Result<()> {
        store.clear_session(&self.session_id).await
    }

    fn refresh(&self, cache: &InMemorySessionStore, _: &()) {
        cache.remove(&self.session_id);
    }

    fn safe_default(&self) {}
}

/// Session access that survives backend outages.
///
/// Cloning is cheap; clones share the primary store, the fallback cache and
/// the degraded flag.
#[derive(Clone)]
pub struct SessionContinuityManager {
    primary: Arc<dyn SessionStore>,
    fallback: Arc<InMemorySessionStore>,
    max_retries: u32,
    base_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
    degraded: Arc<AtomicBool>,
}

impl SessionContinuityManager {
    pub fn new(primary: Arc<dyn SessionStore>) -> Self {
        Self {
            primary,
            fallback: Arc::new(InMemorySessionStore::new()),
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            sleeper: Arc::new(TokioSleeper),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build the configured primary store and wrap it.
    ///
    /// The remote backend shares `executor`, so its calls are rate limited
    /// per session id.
    pub fn from_config(config: &Config, executor: Arc<RequestExecutor>) -> store::Result<Self> {
        let primary: Arc<dyn SessionStore> = match config.session.backend {
            SessionBackend::Memory => Arc::new(InMemorySessionStore::new()),
            SessionBackend::Remote => Arc::new(RemoteSessionStore::from_config(executor, &config.session)?),
        };
        Ok(Self::new(primary).with_session_config(&config.session))
    }

    pub fn with_session_config(self, config: &SessionConfig) -> Self {
        self.with_max_retries(config.max_retries)
            .with_base_delay(config.base_delay())
    }

    /// Attempts against the primary before falling back (at least one).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn primary(&self) -> &Arc<dyn SessionStore> {
        &self.primary
    }

    /// The local fallback cache.
    pub fn fallback(&self) -> &InMemorySessionStore {
        &self.fallback
    }

    /// Drop every fallback entry. Returns how many sessions were removed.
    pub fn clear_fallback(&self) -> usize {
        let removed = self.fallback.clear();
        if removed > 0 {
            info!(removed, "Cleared session fallback cache");
        }
        removed
    }

    /// True after the primary exhausted its retries, until it next succeeds.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub async fn get_history(&self, session_id: &str) -> Vec<Message> {
        let op = GetHistory {
            session_id: session_id.to_string(),
        };
        self.run_with_fallback(&op, Some(self.fallback_store())).await
    }

    pub async fn append_message(&self, session_id: &str, message: Message) {
        let op = AppendMessage {
            session_id: session_id.to_string(),
            message,
        };
        self.run_with_fallback(&op, Some(self.fallback_store())).await
    }

    pub async fn set_history(&self, session_id: &str, messages: Vec<Message>) {
        let op = SetHistory {
            session_id: session_id.to_string(),
            messages,
        };
        self.run_with_fallback(&op, Some(self.fallback_store())).await
    }

    pub async fn clear_session(&self, session_id: &str) {
        let op = ClearSession {
            session_id: session_id.to_string(),
        };
        self.run_with_fallback(&op, Some(self.fallback_store())).await
    }

    /// Run `op` against the primary with retries, then against `fallback`,
    /// then return the operation's safe default.
    pub async fn run_with_fallback<O: StoreOperation>(
        &self,
        op: &O,
        fallback: Option<&dyn SessionStore>,
    ) -> O::Output {
        let attempts = self.max_retries.max(1);
        let operation = op.name();
        let session_id = op.session_id();

        for attempt in 0..attempts {
            match op.apply(self.primary.as_ref()).await {
                Ok(output) => {
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        info!(operation, session_id, attempt, "Primary session store recovered");
                    } else if attempt > 0 {
                        debug!(operation, session_id, attempt, "Primary session store succeeded after retry");
                    }
                    op.refresh(&self.fallback, &output);
                    return output;
                }
                Err(e) if attempt + 1 < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        session_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Session store call failed, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        operation,
                        session_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Session store retries exhausted"
                    );
                }
            }
        }

        self.degraded.store(true, Ordering::Relaxed);

        let Some(fallback) = fallback else {
            warn!(operation, session_id, attempts, "No fallback available, returning default");
            return op.safe_default();
        };

        warn!(operation, session_id, attempts, "Serving from fallback store");
        match op.apply(fallback).await {
            Ok(output) => output,
            Err(e) => {
                warn!(operation, session_id, error = %e, "Fallback store failed, returning default");
                op.safe_default()
            }
        }
    }

    /// Pass `events` through and, once the stream ends, append the streamed
    /// text to the session as one assistant message.
    ///
    /// Nothing is appended when the stream produced no text, when it ended
    /// with a rate-limit sentinel, transport error or cancellation, or when
    /// the consumer stops polling before the end.
    pub fn capture_stream(&self, session_id: impl Into<String>, events: EventStream) -> EventStream {
        struct Capture {
            events: Option<EventStream>,
            text: String,
            interrupted: bool,
            manager: SessionContinuityManager,
            session_id: String,
        }

        let state = Capture {
            events: Some(events),
            text: String::new(),
            interrupted: false,
            manager: self.clone(),
            session_id: session_id.into(),
        };

        Box::pin(stream::unfold(state, |mut state| async move {
            let events = state.events.as_mut()?;
            match events.next().await {
                Some(event) => {
                    match &event {
                        StreamEvent::Data(value) => {
                            if let Some(delta) = text_delta(value) {
                                state.text.push_str(delta);
                            }
                        }
                        StreamEvent::RateLimited { .. } | StreamEvent::Error(_) | StreamEvent::Cancelled => {
                            state.interrupted = true
                        }
                        StreamEvent::DecodeFailure { .. } => {}
                    }
                    Some((event, state))
                }
                None => {
                    state.events = None;
                    if state.interrupted {
                        debug!(session_id = %state.session_id, "Stream interrupted, nothing captured");
                    } else if !state.text.is_empty() {
                        let message = Message::assistant(std::mem::take(&mut state.text));
                        state.manager.append_message(&state.session_id, message).await;
                    }
                    None
                }
            }
        }))
    }

    fn fallback_store(&self) -> &dyn SessionStore {
        self.fallback.as_ref()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Text carried by one streamed event, if any.
///
/// Recognizes `text`, `delta.text`, `choices[0].delta.content` and a string
/// `content` field, in that order.
pub fn text_delta(value: &Value) -> Option<&str> {
    value
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/delta/text").and_then(Value::as_str))
        .or_else(|| value.pointer("/choices/0/delta/content").and_then(Value::as_str))
        .or_else(|| value.get("content").and_then(Value::as_str))
}
