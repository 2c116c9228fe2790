//! Per-identifier admission control.
//!
//! Each identifier owns two sliding windows (60s and 3600s) stored as ordered
//! timestamp queues, plus a burst counter. Expired timestamps are purged
//! lazily on every call. State is created on first use and lives until
//! [`RateLimit::reset`] or [`RateLimiter::prune_idle`] removes it.
//!
//! [`AdaptiveRateLimiter`] scales both window limits by a per-identifier
//! multiplier that is fed by [`RateLimit::record_outcome`]:
//!
//! | outcome        | multiplier change          |
//! |----------------|----------------------------|
//! | 10th success   | `* 1.1`, capped at 2.0     |
//! | HTTP 429       | `* 0.5`                    |
//! | HTTP 5xx       | `* 0.7`                    |
//! | other failure  | `* 0.8`, floored at 0.1    |

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use steady_core::config::RateLimitConfig;

use crate::clock::{Clock, SystemClock};

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);

pub const MIN_MULTIPLIER: f64 = 0.1;
pub const MAX_MULTIPLIER: f64 = 2.0;
const SUCCESS_STREAK_FOR_INCREASE: u32 = 10;

/// Which rule caused a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    MinuteWindow,
    HourWindow,
    Burst,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// How long until the violated rule would admit again.
    pub retry_after: Option<Duration>,
    pub reason: Option<DenyReason>,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            reason: None,
        }
    }

    fn denied(reason: DenyReason, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
            reason: Some(reason),
        }
    }
}

/// Snapshot of an identifier's limiter state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub identifier: String,
    pub minute_count: usize,
    pub minute_limit: usize,
    pub hour_count: usize,
    pub hour_limit: usize,
    pub burst_count: u32,
    pub burst_limit: u32,
    pub multiplier: f64,
    pub seconds_since_last_request: Option<f64>,
}

/// Admission control seam used by the request executor.
pub trait RateLimit: Send + Sync {
    /// Decide whether a request for `identifier` may proceed now.
    fn admit(&self, identifier: &str) -> Admission;

    /// Report the result of a network attempt made for `identifier`.
    fn record_outcome(&self, _identifier: &str, _success: bool, _status: Option<u16>) {}

    fn status(&self, identifier: &str) -> RateLimitStatus;

    /// Forget everything known about `identifier`.
    fn reset(&self, identifier: &str);

    /// Gap that ends a burst; used as the wait when no better hint exists.
    fn cooldown(&self) -> Duration;
}

#[derive(Debug)]
struct RateLimitState {
    minute: VecDeque<Duration>,
    hour: VecDeque<Duration>,
    last_request: Option<Duration>,
    burst_count: u32,
    multiplier: f64,
    success_streak: u32,
}

impl RateLimitState {
    fn new() -> Self {
        Self {
            minute: VecDeque::new(),
            hour: VecDeque::new(),
            last_request: None,
            burst_count: 0,
            multiplier: 1.0,
            success_streak: 0,
        }
    }

    fn purge(&mut self, now: Duration) {
        purge_window(&mut self.minute, now, MINUTE_WINDOW);
        purge_window(&mut self.hour, now, HOUR_WINDOW);
    }

    fn apply_outcome(&mut self, success: bool, status: Option<u16>) {
        if success {
            self.success_streak += 1;
            if self.success_streak % SUCCESS_STREAK_FOR_INCREASE == 0 {
                self.multiplier = (self.multiplier * 1.1).min(MAX_MULTIPLIER);
            }
            return;
        }

        self.success_streak = 0;
        let factor = match status {
            Some(429) => 0.5,
            Some(500..=599) => 0.7,
            _ => 0.8,
        };
        self.multiplier = (self.multiplier * factor).max(MIN_MULTIPLIER);
    }
}

fn purge_window(window: &mut VecDeque<Duration>, now: Duration, span: Duration) {
    while let Some(&oldest) = window.front() {
        if now.saturating_sub(oldest) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn scaled_limit(limit: u32, multiplier: f64) -> usize {
    ((limit as f64 * multiplier).floor() as usize).max(1)
}

/// Sliding-window limiter with fixed limits.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, Arc<Mutex<RateLimitState>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Number of identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.states.lock().len()
    }

    /// Drop identifiers with empty windows whose last request is older than
    /// `idle_for`. Returns how many were removed.
    pub fn prune_idle(&self, idle_for: Duration) -> usize {
        let now = self.clock.now();
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, entry| {
            let mut state = entry.lock();
            state.purge(now);
            let idle = state
                .last_request
                .map(|last| now.saturating_sub(last) >= idle_for)
                .unwrap_or(true);
            !(idle && state.minute.is_empty() && state.hour.is_empty())
        });
        let removed = before - states.len();
        if removed > 0 {
            debug!(removed, "Pruned idle rate limit state");
        }
        removed
    }

    fn entry(&self, identifier: &str) -> Arc<Mutex<RateLimitState>> {
        self.states
            .lock()
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateLimitState::new())))
            .clone()
    }

    fn check(&self, identifier: &str, adaptive: bool) -> Admission {
        let entry = self.entry(identifier);
        let mut state = entry.lock();
        let now = self.clock.now();
        state.purge(now);

        let multiplier = if adaptive { state.multiplier } else { 1.0 };
        let minute_limit = scaled_limit(self.config.requests_per_minute, multiplier);
        let hour_limit = scaled_limit(self.config.requests_per_hour, multiplier);

        if state.minute.len() >= minute_limit {
            let wait = window_wait(&state.minute, now, MINUTE_WINDOW);
            debug!(identifier, limit = minute_limit, ?wait, "Denied: minute window full");
            return Admission::denied(DenyReason::MinuteWindow, wait);
        }

        if state.hour.len() >= hour_limit {
            let wait = window_wait(&state.hour, now, HOUR_WINDOW);
            debug!(identifier, limit = hour_limit, ?wait, "Denied: hour window full");
            return Admission::denied(DenyReason::HourWindow, wait);
        }

        let cooldown = self.config.cooldown();
        let burst = match state.last_request {
            Some(last) if now.saturating_sub(last) < cooldown => state.burst_count + 1,
            _ => 1,
        };
        if burst > self.config.burst_limit {
            debug!(identifier, burst, "Denied: burst limit exceeded");
            return Admission::denied(DenyReason::Burst, cooldown);
        }

        state.burst_count = burst;
        state.minute.push_back(now);
        state.hour.push_back(now);
        state.last_request = Some(now);
        Admission::allowed()
    }

    /// Unknown identifiers report a fresh state and are not inserted.
    fn snapshot(&self, identifier: &str, adaptive: bool) -> RateLimitStatus {
        let entry = self.states.lock().get(identifier).cloned();
        let mut fresh = RateLimitState::new();
        let mut guard = entry.as_ref().map(|entry| entry.lock());
        let state = match guard.as_deref_mut() {
            Some(state) => state,
            None => &mut fresh,
        };
        let now = self.clock.now();
        state.purge(now);

        let multiplier = if adaptive { state.multiplier } else { 1.0 };
        RateLimitStatus {
            identifier: identifier.to_string(),
            minute_count: state.minute.len(),
            minute_limit: scaled_limit(self.config.requests_per_minute, multiplier),
            hour_count: state.hour.len(),
            hour_limit: scaled_limit(self.config.requests_per_hour, multiplier),
            burst_count: state.burst_count,
            burst_limit: self.config.burst_limit,
            multiplier,
            seconds_since_last_request: state
                .last_request
                .map(|last| now.saturating_sub(last).as_secs_f64()),
        }
    }

    fn remove(&self, identifier: &str) {
        if self.states.lock().remove(identifier).is_some() {
            info!(identifier, "Rate limit state reset");
        }
    }
}

fn window_wait(window: &VecDeque<Duration>, now: Duration, span: Duration) -> Duration {
    window
        .front()
        .map(|oldest| (*oldest + span).saturating_sub(now))
        .unwrap_or(Duration::ZERO)
}

impl RateLimit for RateLimiter {
    fn admit(&self, identifier: &str) -> Admission {
        self.check(identifier, false)
    }

    fn status(&self, identifier: &str) -> RateLimitStatus {
        self.snapshot(identifier, false)
    }

    fn reset(&self, identifier: &str) {
        self.remove(identifier);
    }

    fn cooldown(&self) -> Duration {
        self.config.cooldown()
    }
}

/// Sliding-window limiter whose limits follow observed backend health.
pub struct AdaptiveRateLimiter {
    inner: RateLimiter,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: RateLimiter::new(config),
        }
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RateLimiter::with_clock(config, clock),
        }
    }

    /// Current multiplier for `identifier` (1.0 when untracked).
    pub fn multiplier(&self, identifier: &str) -> f64 {
        self.inner
            .states
            .lock()
            .get(identifier)
            .map(|entry| entry.lock().multiplier)
            .unwrap_or(1.0)
    }

    pub fn prune_idle(&self, idle_for: Duration) -> usize {
        self.inner.prune_idle(idle_for)
    }

    pub fn tracked(&self) -> usize {
        self.inner.tracked()
    }
}

impl RateLimit for AdaptiveRateLimiter {
    fn admit(&self, identifier: &str) -> Admission {
        self.inner.check(identifier, true)
    }

    fn record_outcome(&self, identifier: &str, success: bool, status: Option<u16>) {
        let entry = self.inner.entry(identifier);
        let mut state = entry.lock();
        let before = state.multiplier;
        state.apply_outcome(success, status);
        if state.multiplier != before {
            debug!(
                identifier,
                from = before,
                to = state.multiplier,
                ?status,
                "Adaptive multiplier changed"
            );
        }
    }

    fn status(&self, identifier: &str) -> RateLimitStatus {
        self.inner.snapshot(identifier, true)
    }

    fn reset(&self, identifier: &str) {
        self.inner.remove(identifier);
    }

    fn cooldown(&self) -> Duration {
        self.inner.config.cooldown()
    }
}

/// Build the limiter selected by configuration.
pub fn from_config(config: &RateLimitConfig) -> Arc<dyn RateLimit> {
    if config.adaptive {
        Arc::new(AdaptiveRateLimiter::new(config.clone()))
    } else {
        Arc::new(RateLimiter::new(config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn config(per_minute: u32, per_hour: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            burst_limit: burst,
            cooldown_seconds: 1.0,
            adaptive: false,
        }
    }

    fn limiter(cfg: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (RateLimiter::with_clock(cfg, clock.clone()), clock)
    }

    #[test]
    fn test_admits_exactly_limit_then_denies() {
        let (limiter, _clock) = limiter(config(5, 1000, 100));

        for i in 0..5 {
            assert!(limiter.admit("user").allowed, "request {} should be admitted", i);
        }
        let denied = limiter.admit("user");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::MinuteWindow));
    }

    #[test]
    fn test_window_slides() {
        let (limiter, clock) = limiter(config(3, 1000, 100));

        for _ in 0..3 {
            assert!(limiter.admit("user").allowed);
        }
        clock.advance(Duration::from_secs(10));
        let denied = limiter.admit("user");
        assert_eq!(denied.retry_after, Some(Duration::from_secs(50)));

        clock.advance(Duration::from_secs(49));
        assert!(!limiter.admit("user").allowed);

        clock.advance(Duration::from_secs(1));
        assert!(limiter.admit("user").allowed);
    }

    #[test]
    fn test_expired_timestamps_are_not_counted() {
        let (limiter, clock) = limiter(config(10, 1000, 100));

        limiter.admit("user");
        clock.advance(Duration::from_secs(30));
        limiter.admit("user");
        clock.advance(Duration::from_secs(31));

        let status = limiter.status("user");
        assert_eq!(status.minute_count, 1);
        assert_eq!(status.hour_count, 2);
    }

    #[test]
    fn test_hour_window_denial_reports_hour_wait() {
        let (limiter, clock) = limiter(config(100, 3, 100));

        for _ in 0..3 {
            assert!(limiter.admit("user").allowed);
            clock.advance(Duration::from_secs(100));
        }
        let denied = limiter.admit("user");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::HourWindow));
        assert_eq!(denied.retry_after, Some(Duration::from_secs(3300)));
    }

    #[test]
    fn test_burst_limit_and_cooldown_reset() {
        let (limiter, clock) = limiter(config(100, 1000, 3));

        for _ in 0..3 {
            assert!(limiter.admit("user").allowed);
        }
        let denied = limiter.admit("user");
        assert_eq!(denied.reason, Some(DenyReason::Burst));
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert!(limiter.admit("user").allowed);
        assert_eq!(limiter.status("user").burst_count, 1);
    }

    #[test]
    fn test_spaced_requests_never_burst() {
        let (limiter, clock) = limiter(config(100, 1000, 2));

        for _ in 0..10 {
            assert!(limiter.admit("user").allowed);
            clock.advance(Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (limiter, _clock) = limiter(config(2, 1000, 100));

        assert!(limiter.admit("a").allowed);
        assert!(limiter.admit("a").allowed);
        assert!(!limiter.admit("a").allowed);
        assert!(limiter.admit("b").allowed);
    }

    #[test]
    fn test_reset_clears_state() {
        let (limiter, _clock) = limiter(config(1, 1000, 100));

        assert!(limiter.admit("user").allowed);
        assert!(!limiter.admit("user").allowed);
        limiter.reset("user");
        assert!(limiter.admit("user").allowed);
    }

    #[test]
    fn test_status_reports_time_since_last() {
        let (limiter, clock) = limiter(config(10, 100, 10));

        assert_eq!(limiter.status("user").seconds_since_last_request, None);
        limiter.admit("user");
        clock.advance(Duration::from_secs(4));
        let status = limiter.status("user");
        assert_eq!(status.seconds_since_last_request, Some(4.0));
        assert_eq!(status.minute_limit, 10);
        assert_eq!(status.hour_limit, 100);
    }

    #[test]
    fn test_status_does_not_track_unknown_identifier() {
        let (limiter, _clock) = limiter(config(10, 100, 10));

        let status = limiter.status("nobody");
        assert_eq!(status.minute_count, 0);
        assert_eq!(status.hour_count, 0);
        assert_eq!(status.multiplier, 1.0);
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_prune_idle() {
        let (limiter, clock) = limiter(config(10, 100, 10));

        limiter.admit("old");
        clock.advance(Duration::from_secs(3600));
        limiter.admit("fresh");

        assert_eq!(limiter.prune_idle(Duration::from_secs(600)), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    fn adaptive(cfg: RateLimitConfig) -> (AdaptiveRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (AdaptiveRateLimiter::with_clock(cfg, clock.clone()), clock)
    }

    #[test]
    fn test_rate_limited_outcome_halves_limits() {
        let (limiter, _clock) = adaptive(config(10, 1000, 100));

        limiter.record_outcome("user", false, Some(429));
        assert!((limiter.multiplier("user") - 0.5).abs() < 1e-9);

        for _ in 0..5 {
            assert!(limiter.admit("user").allowed);
        }
        assert!(!limiter.admit("user").allowed);
        assert_eq!(limiter.status("user").minute_limit, 5);
    }

    #[test]
    fn test_failure_factors() {
        let (limiter, _clock) = adaptive(config(10, 1000, 100));

        limiter.record_outcome("a", false, Some(503));
        assert!((limiter.multiplier("a") - 0.7).abs() < 1e-9);

        limiter.record_outcome("b", false, Some(400));
        assert!((limiter.multiplier("b") - 0.8).abs() < 1e-9);

        limiter.record_outcome("c", false, None);
        assert!((limiter.multiplier("c") - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_ten_successes_raise_multiplier() {
        let (limiter, _clock) = adaptive(config(10, 1000, 100));

        for _ in 0..9 {
            limiter.record_outcome("user", true, Some(200));
        }
        assert_eq!(limiter.multiplier("user"), 1.0);

        limiter.record_outcome("user", true, Some(200));
        assert!((limiter.multiplier("user") - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_failure_breaks_success_streak() {
        let (limiter, _clock) = adaptive(config(10, 1000, 100));

        for _ in 0..9 {
            limiter.record_outcome("user", true, Some(200));
        }
        limiter.record_outcome("user", false, Some(500));
        limiter.record_outcome("user", true, Some(200));
        assert!((limiter.multiplier("user") - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_multiplier_stays_in_bounds() {
        let (limiter, _clock) = adaptive(config(10, 1000, 100));

        for _ in 0..50 {
            limiter.record_outcome("down", false, Some(429));
        }
        assert!((limiter.multiplier("down") - MIN_MULTIPLIER).abs() < 1e-9);

        for _ in 0..1000 {
            limiter.record_outcome("up", true, Some(200));
        }
        assert!((limiter.multiplier("up") - MAX_MULTIPLIER).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_identifier_keeps_one_slot() {
        let (limiter, _clock) = adaptive(config(5, 1000, 100));

        for _ in 0..10 {
            limiter.record_outcome("user", false, Some(429));
        }
        assert!(limiter.admit("user").allowed);
        assert!(!limiter.admit("user").allowed);
    }

    #[test]
    fn test_static_limiter_ignores_outcomes() {
        let (limiter, _clock) = limiter(config(2, 1000, 100));

        limiter.record_outcome("user", false, Some(429));
        assert!(limiter.admit("user").allowed);
        assert!(limiter.admit("user").allowed);
        assert_eq!(limiter.status("user").multiplier, 1.0);
    }
}
