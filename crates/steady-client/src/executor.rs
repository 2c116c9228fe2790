//! Retrying request execution.
//!
//! [`RequestExecutor`] issues one logical request to the remote service:
//!
//! 1. If the request carries a rate key and a limiter is configured, wait
//!    for admission (sleeping the limiter's `retry_after` between checks).
//! 2. Send. A 429 is retried after the `Retry-After` delay, or after
//!    `base * 2^attempt * jitter` when the header is absent or not numeric.
//! 3. Every other failure is returned immediately; exhausted retries return
//!    the final [`RequestError::RateLimited`].
//!
//! Time spent sleeping in steps 1 and 2 counts against the request timeout.
//! A wait that would overrun it fails the call with
//! [`RequestError::RateLimited`] without sleeping.
//!
//! Each network attempt made under a rate key is reported back to the
//! limiter so adaptive limits follow backend health.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use steady_core::{Config, Error, RequestError};

use crate::backoff::{parse_retry_after, RetryPolicy};
use crate::clock::{Sleeper, TokioSleeper};
use crate::decoder::{decode_stream, Framing};
use crate::rate_limit::{self, RateLimit};

pub use crate::decoder::EventStream;

const STREAM_ACCEPT: &str = "text/event-stream, application/x-ndjson, application/json";

/// HTTP methods the remote service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        }
    }
}

/// Request descriptor handed to the executor.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Overrides the executor's default timeout
    pub timeout: Option<Duration>,
    /// Identifier the limiter is consulted with (e.g. a session id)
    pub rate_key: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            rate_key: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rate_key(mut self, key: impl Into<String>) -> Self {
        self.rate_key = Some(key.into());
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

/// A fully materialized response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Decoded JSON body; `Null` when the body is empty
    pub body: Value,
}

/// Raw body chunks of an established stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, RequestError>> + Send>>;

/// Handle to an established streaming response.
pub struct StreamingResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub framing: Framing,
    chunks: ChunkStream,
}

impl StreamingResponse {
    /// The undecoded byte feed.
    pub fn into_chunks(self) -> ChunkStream {
        self.chunks
    }

    /// Decode the feed into events, optionally stoppable by `cancel`.
    pub fn into_events(self, cancel: Option<CancellationToken>) -> EventStream {
        decode_stream(self.chunks, self.framing, cancel)
    }
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("framing", &self.framing)
            .finish()
    }
}

/// Sleep allowance for one logical request.
///
/// Admission waits and rate-limit backoff draw from the request timeout, so
/// a long `Retry-After` fails the call instead of stalling it.
#[derive(Debug)]
struct WaitBudget {
    remaining: Option<Duration>,
}

impl WaitBudget {
    fn new(limit: Option<Duration>) -> Self {
        Self { remaining: limit }
    }

    /// Reserve `delay`; false when it does not fit in what is left.
    fn take(&mut self, delay: Duration) -> bool {
        match self.remaining {
            None => true,
            Some(remaining) => match remaining.checked_sub(delay) {
                Some(left) => {
                    self.remaining = Some(left);
                    true
                }
                None => false,
            },
        }
    }
}

/// Issues requests with admission control and rate-limit retries.
pub struct RequestExecutor {
    client: Client,
    policy: RetryPolicy,
    limiter: Option<Arc<dyn RateLimit>>,
    sleeper: Arc<dyn Sleeper>,
    default_timeout: Option<Duration>,
}

impl RequestExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            policy,
            limiter: None,
            sleeper: Arc::new(TokioSleeper),
            default_timeout: None,
        }
    }

    /// Build an executor, limiter and HTTP client from configuration.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let client = Client::builder()
            .user_agent(config.http.user_agent.as_str())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::new(RetryPolicy::from_config(&config.retry))
            .with_client(client)
            .with_limiter(rate_limit::from_config(&config.rate_limit))
            .with_default_timeout(config.http.timeout()))
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimit>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> Option<&Arc<dyn RateLimit>> {
        self.limiter.as_ref()
    }

    /// Execute a request and decode its JSON body.
    #[instrument(skip(self, request), fields(method = ?request.method, url = %request.url))]
    pub async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, RequestError> {
        let response = self.send_with_retry(request, false).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();

        let text = response.text().await.map_err(|e| self.map_transport_error(e, request))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| RequestError::Decode {
                message: e.to_string(),
            })?
        };

        Ok(HttpResponse { status, headers, body })
    }

    /// Execute a request and hand back the unbuffered response feed.
    ///
    /// The timeout bounds stream establishment only; an established stream
    /// runs until the server closes it or the consumer stops polling.
    #[instrument(skip(self, request), fields(method = ?request.method, url = %request.url))]
    pub async fn execute_streaming(&self, request: &HttpRequest) -> Result<StreamingResponse, RequestError> {
        let response = self.send_with_retry(request, true).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let framing = Framing::from_content_type(
            headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        );
        debug!(?framing, "Stream established");

        let chunks = response.bytes_stream().map(|chunk| {
            chunk.map(|bytes| bytes.to_vec()).map_err(|e| RequestError::Stream {
                message: e.to_string(),
            })
        });

        Ok(StreamingResponse {
            status,
            headers,
            framing,
            chunks: Box::pin(chunks),
        })
    }

    /// Execute a streaming request and decode it into events.
    pub async fn query_stream(
        &self,
        request: &HttpRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<EventStream, RequestError> {
        Ok(self.execute_streaming(request).await?.into_events(cancel))
    }

    /// Streaming request whose decoding stops once `cancel` fires.
    ///
    /// The token is checked between chunks; on cancellation the response is
    /// dropped, which closes the connection.
    pub async fn execute_streaming_with_cancel(
        &self,
        request: &HttpRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, RequestError> {
        self.query_stream(request, Some(cancel)).await
    }

    async fn send_with_retry(&self, request: &HttpRequest, streaming: bool) -> Result<Response, RequestError> {
        let mut budget = WaitBudget::new(request.timeout.or(self.default_timeout));
        let mut attempt: u32 = 0;

        loop {
            self.wait_for_admission(request, &mut budget).await?;

            debug!(attempt, "Sending request");
            let response = match self.send_once(request, streaming).await {
                Ok(response) => response,
                Err(e) => {
                    self.record(request, false, None);
                    return Err(e);
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                self.record(request, true, Some(status));
                return Ok(response);
            }
            self.record(request, false, Some(status));

            let retry_after = parse_retry_after(response.headers());
            let message = response.text().await.unwrap_or_default();
            let err = RequestError::from_status(status, message, retry_after);
            if !err.is_retryable() {
                debug!(status, "Request failed without retry");
                return Err(err);
            }
            if attempt >= self.policy.max_retries {
                error!(attempts = attempt + 1, "Rate limit retries exhausted");
                return Err(err);
            }

            let delay = retry_after.unwrap_or_else(|| self.policy.jittered_delay(attempt));
            if !budget.take(delay) {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limit delay exceeds request timeout, giving up"
                );
                return Err(err);
            }
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                from_header = retry_after.is_some(),
                "Rate limited, backing off"
            );
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }

    async fn wait_for_admission(&self, request: &HttpRequest, budget: &mut WaitBudget) -> Result<(), RequestError> {
        let (Some(limiter), Some(key)) = (&self.limiter, &request.rate_key) else {
            return Ok(());
        };

        let mut waits: u32 = 0;
        loop {
            let admission = limiter.admit(key);
            if admission.allowed {
                return Ok(());
            }
            let delay = admission.retry_after.unwrap_or_else(|| limiter.cooldown());
            if waits >= self.policy.max_retries {
                warn!(rate_key = %key, "Local rate limit not cleared within retry budget");
                return Err(RequestError::RateLimited {
                    retry_after: admission.retry_after,
                });
            }
            if !budget.take(delay) {
                warn!(
                    rate_key = %key,
                    delay_ms = delay.as_millis() as u64,
                    "Local rate limit wait exceeds request timeout"
                );
                return Err(RequestError::RateLimited {
                    retry_after: admission.retry_after,
                });
            }

            debug!(
                rate_key = %key,
                reason = ?admission.reason,
                delay_ms = delay.as_millis() as u64,
                "Waiting for local admission"
            );
            self.sleeper.sleep(delay).await;
            waits += 1;
        }
    }

    async fn send_once(&self, request: &HttpRequest, streaming: bool) -> Result<Response, RequestError> {
        let mut builder = self.client.request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if streaming && !request.has_header("accept") {
            builder = builder.header(ACCEPT, STREAM_ACCEPT);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let timeout = request.timeout.or(self.default_timeout);
        match (timeout, streaming) {
            (Some(timeout), false) => builder
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| self.map_transport_error(e, request)),
            (Some(timeout), true) => match tokio::time::timeout(timeout, builder.send()).await {
                Ok(result) => result.map_err(|e| self.map_transport_error(e, request)),
                Err(_) => Err(RequestError::Timeout {
                    seconds: timeout.as_secs(),
                }),
            },
            (None, _) => builder.send().await.map_err(|e| self.map_transport_error(e, request)),
        }
    }

    fn map_transport_error(&self, e: reqwest::Error, request: &HttpRequest) -> RequestError {
        if e.is_timeout() {
            let seconds = request
                .timeout
                .or(self.default_timeout)
                .map(|t| t.as_secs())
                .unwrap_or_default();
            RequestError::Timeout { seconds }
        } else {
            RequestError::Network {
                message: e.to_string(),
            }
        }
    }

    fn record(&self, request: &HttpRequest, success: bool, status: Option<u16>) {
        if let (Some(limiter), Some(key)) = (&self.limiter, &request.rate_key) {
            limiter.record_outcome(key, success, status);
        }
    }
}
