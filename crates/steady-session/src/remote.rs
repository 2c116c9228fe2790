//! Remote session store.
//!
//! Each session maps to one keyed resource on the storage service:
//!
//! | Operation        | Request                              |
//! |------------------|--------------------------------------|
//! | `get_history`    | `GET  {base}/sessions/{id}/history`  |
//! | `append_message` | `POST {base}/sessions/{id}/messages` |
//! | `set_history`    | `POST {base}/sessions/{id}/history`  |
//! | `clear_session`  | `POST {base}/sessions/{id}/clear`    |
//!
//! Histories travel as `{"messages": [...]}`. Every request is rate limited
//! under the session id. The client holds no lock across calls, so concurrent
//! writers to one session are ordered by the service, not by the callers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use steady_client::{HttpMethod, HttpRequest, RequestExecutor};
use steady_core::config::SessionConfig;
use steady_core::{Message, RequestError};

use crate::store::{Result, SessionStore, StoreError};

#[derive(Debug, Serialize, Deserialize)]
struct HistoryBody {
    #[serde(default)]
    messages: Vec<Message>,
}

/// [`SessionStore`] backed by a keyed storage service.
pub struct RemoteSessionStore {
    executor: Arc<RequestExecutor>,
    base_url: Url,
    timeout: Option<Duration>,
}

impl RemoteSessionStore {
    pub fn new(executor: Arc<RequestExecutor>, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| StoreError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            executor,
            base_url,
            timeout: None,
        })
    }

    /// Build from the `[session]` configuration section.
    pub fn from_config(executor: Arc<RequestExecutor>, config: &SessionConfig) -> Result<Self> {
        let url = config
            .remote_url
            .as_deref()
            .ok_or_else(|| StoreError::InvalidUrl("session.remote_url is not set".to_string()))?;
        Ok(Self::new(executor, url)?.with_timeout(config.timeout()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, session_id: &str, action: &str) -> Result<String> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["sessions", session_id, action]);
        Ok(url.into())
    }

    fn request(&self, mut request: HttpRequest, session_id: &str) -> HttpRequest {
        request = request.with_rate_key(session_id);
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }
        request
    }
}

fn is_not_found(e: &RequestError) -> bool {
    e.status() == Some(404)
}

#[async_trait]
impl SessionStore for RemoteSessionStore {
    #[instrument(skip(self))]
    async fn get_history(&self, session_id: &str) -> Result<Vec<Message>> {
        let url = self.endpoint(session_id, "history")?;
        let response = match self.executor.execute(&self.request(HttpRequest::get(url), session_id)).await {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => {
                debug!("Session not found on remote store");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match response.body {
            Value::Null => Ok(Vec::new()),
            Value::Array(_) => Ok(serde_json::from_value(response.body)?),
            body @ Value::Object(_) => {
                let history: HistoryBody = serde_json::from_value(body)?;
                Ok(history.messages)
            }
            other => Err(StoreError::InvalidResponse(format!(
                "expected a history object, got {}",
                other
            ))),
        }
    }

    #[instrument(skip(self, message))]
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let url = self.endpoint(session_id, "messages")?;
        let body = serde_json::to_value(message)?;
        self.executor
            .execute(&self.request(HttpRequest::post(url, body), session_id))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn set_history(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let url = self.endpoint(session_id, "history")?;
        let body = serde_json::to_value(HistoryBody {
            messages: messages.to_vec(),
        })?;
        self.executor
            .execute(&self.request(HttpRequest::post(url, body), session_id))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_session(&self, session_id: &str) -> Result<()> {
        let url = self.endpoint(session_id, "clear")?;
        match self
            .executor
            .execute(&self.request(HttpRequest::new(HttpMethod::Post, url), session_id))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steady_client::{RecordingSleeper, RetryPolicy};
    use steady_core::Role;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> RemoteSessionStore {
        let executor = RequestExecutor::new(RetryPolicy::no_retry()).with_sleeper(Arc::new(RecordingSleeper::new()));
        RemoteSessionStore::new(Arc::new(executor), &server.uri()).unwrap()
    }

    #[tokio::test]
    async fn test_get_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/s1/history"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [
                    {"role": "user", "content": "hello"},
                    {"role": "assistant", "content": "hi", "id": "m2"}
                ]
            })))
            .mount(&server)
            .await;

        let history = store(&server).get_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].id.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_missing_session_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(store(&server).get_history("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_posts_message() {
        let server = MockServer::start().await;
        let message = Message::user("question");
        Mock::given(method("POST"))
            .and(path("/sessions/s1/messages"))
            .and(body_json(serde_json::to_value(&message).unwrap()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).append_message("s1", &message).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_history_posts_messages() {
        let server = MockServer::start().await;
        let messages = vec![Message::system("be brief"), Message::user("q")];
        Mock::given(method("POST"))
            .and(path("/sessions/s1/history"))
            .and(body_json(json!({"messages": serde_json::to_value(&messages).unwrap()})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).set_history("s1", &messages).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_id_is_path_escaped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/a%2Fb/clear"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).clear_session("a/b").await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = store(&server).get_history("s1").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Request(RequestError::ServerTransient { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn test_unexpected_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!("nope")))
            .mount(&server)
            .await;

        let err = store(&server).get_history("s1").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidResponse(_)));
    }

    #[test]
    fn test_endpoint_respects_base_path() {
        let executor = Arc::new(RequestExecutor::new(RetryPolicy::no_retry()));
        let store = RemoteSessionStore::new(executor, "http://store.local/api/").unwrap();
        assert_eq!(
            store.endpoint("s1", "history").unwrap(),
            "http://store.local/api/sessions/s1/history"
        );
    }

    #[test]
    fn test_rejects_invalid_url() {
        let executor = Arc::new(RequestExecutor::new(RetryPolicy::no_retry()));
        assert!(matches!(
            RemoteSessionStore::new(executor, "not a url"),
            Err(StoreError::InvalidUrl(_))
        ));
    }
}
