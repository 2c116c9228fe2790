//! # steady-client
//!
//! Transport layer for Steady.
//!
//! This crate provides:
//! - Per-identifier sliding-window admission control, with an adaptive
//!   variant driven by observed backend health
//! - A request executor that retries rate-limited calls with backoff
//! - Incremental decoding of streamed JSON (concatenated, NDJSON or SSE framed)
//! - Injectable clock and sleep seams for deterministic tests

pub mod backoff;
pub mod clock;
pub mod decoder;
pub mod executor;
pub mod rate_limit;
pub mod sse;

pub use backoff::RetryPolicy;
pub use clock::{Clock, ManualClock, RecordingSleeper, Sleeper, SystemClock, TokioSleeper};
pub use decoder::{Framing, StreamDecoder, StreamEvent};
pub use executor::{ChunkStream, EventStream, HttpMethod, HttpRequest, HttpResponse, RequestExecutor, StreamingResponse};
pub use rate_limit::{AdaptiveRateLimiter, Admission, RateLimit, RateLimitStatus, RateLimiter};
