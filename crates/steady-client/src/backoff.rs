//! Retry policy and backoff arithmetic.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use steady_core::config::RetryConfig;

/// Immutable retry configuration shared across requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Width of the jitter band: the multiplier is drawn from
    /// `[1 - jitter/2, 1 + jitter/2]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            jitter_factor: 0.4,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs_f64(config.base_delay_seconds.max(0.0)),
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// `base_delay * 2^attempt`, no jitter. `attempt` is zero-based.
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * factor)
    }

    /// Exponential delay scaled by a jitter sample in `[0, 1)`.
    ///
    /// With the default factor of 0.4 this is
    /// `base * 2^attempt * (0.8 + 0.4 * sample)`.
    pub fn jittered_delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let sample = sample.clamp(0.0, 1.0);
        let multiplier = 1.0 - self.jitter_factor / 2.0 + self.jitter_factor * sample;
        Duration::from_secs_f64(self.exponential_delay(attempt).as_secs_f64() * multiplier)
    }

    /// Exponential delay with a random jitter sample.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.jittered_delay_with(attempt, rand::random::<f64>())
    }
}

/// Parse a numeric `Retry-After` header (seconds, fractional allowed).
///
/// HTTP-date values and negative or non-finite numbers yield `None`.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}
