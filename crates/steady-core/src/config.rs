//! Configuration system for Steady.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Main configuration struct for Steady.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admission control
    pub rate_limit: RateLimitConfig,
    /// Transport retry policy
    pub retry: RetryConfig,
    /// Session backend and continuity settings
    pub session: SessionConfig,
    /// HTTP client settings
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per identifier in a 60s window
    pub requests_per_minute: u32,
    /// Requests allowed per identifier in a 3600s window
    pub requests_per_hour: u32,
    /// Consecutive rapid requests allowed before cooldown applies
    pub burst_limit: u32,
    /// Minimum gap (seconds) that ends a burst
    pub cooldown_seconds: f64,
    /// Scale limits by observed backend health
    pub adaptive: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            burst_limit: 10,
            cooldown_seconds: 1.0,
            adaptive: true,
        }
    }
}

impl RateLimitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds.max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay for exponential backoff (seconds)
    pub base_delay_seconds: f64,
    /// Width of the random jitter band around the computed delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_seconds: 1.0,
            jitter_factor: 0.4,
        }
    }
}

/// Which session backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    Memory,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend kind
    pub backend: SessionBackend,
    /// Base URL of the keyed storage endpoint (remote backend only)
    pub remote_url: Option<String>,
    /// Attempts against the primary store before falling back
    pub max_retries: u32,
    /// Base delay between attempts (milliseconds)
    pub base_delay_ms: u64,
    /// Per-call timeout for the remote store (seconds)
    pub timeout_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Memory,
            remote_url: None,
            max_retries: 3,
            base_delay_ms: 100,
            timeout_seconds: 10,
        }
    }
}

impl SessionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Default request timeout (seconds)
    pub timeout_seconds: u64,
    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: concat!("steady/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// Field path (e.g., "rate_limit.burst_limit")
    pub field: String,
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Later sources win: defaults, user config, project config, project
    /// local config, then `STEADY_<SECTION>__<KEY>` environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Self::base_figment()
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            .merge(Toml::file(".steady/config.toml"))
            .merge(Toml::file(".steady/config.local.toml"))
            .merge(Env::prefixed("STEADY_").split("__"))
            .extract()
    }

    /// Load configuration from a single file layered over the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::base_figment().merge(Toml::file(path.as_ref())).extract()
    }

    fn base_figment() -> Figment {
        Figment::new().merge(Serialized::defaults(Config::default()))
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        config.validated()
    }

    /// Fail on validation errors, logging warnings.
    pub fn validated(self) -> Result<Self, Error> {
        let result = self.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        let limits = &self.rate_limit;

        if limits.requests_per_minute == 0 {
            result.add_error("rate_limit.requests_per_minute", "must be greater than 0");
        }
        if limits.requests_per_hour == 0 {
            result.add_error("rate_limit.requests_per_hour", "must be greater than 0");
        }
        if limits.requests_per_hour < limits.requests_per_minute {
            result.add_warning(
                "rate_limit.requests_per_hour",
                "hourly limit is below the per-minute limit; the minute window will never fill",
            );
        }
        if limits.burst_limit == 0 {
            result.add_error("rate_limit.burst_limit", "must be greater than 0");
        }
        if !limits.cooldown_seconds.is_finite() || limits.cooldown_seconds < 0.0 {
            result.add_error("rate_limit.cooldown_seconds", "cannot be negative");
        }

        if !self.retry.base_delay_seconds.is_finite() || self.retry.base_delay_seconds < 0.0 {
            result.add_error("retry.base_delay_seconds", "cannot be negative");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            result.add_error("retry.jitter_factor", "must be between 0.0 and 1.0");
        }
        if self.retry.max_retries > 20 {
            result.add_warning("retry.max_retries", "more than 20 retries may stall callers for minutes");
        }

        if self.session.max_retries == 0 {
            result.add_error("session.max_retries", "must be at least 1");
        }
        match (&self.session.backend, &self.session.remote_url) {
            (SessionBackend::Remote, None) => {
                result.add_error("session.remote_url", "required when session.backend = \"remote\"");
            }
            (_, Some(url)) if !url.starts_with("http://") && !url.starts_with("https://") => {
                result.add_error("session.remote_url", "must start with http:// or https://");
            }
            _ => {}
        }

        if self.http.timeout_seconds == 0 {
            result.add_error("http.timeout_seconds", "must be greater than 0");
        }

        result
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("steady"))
            .unwrap_or_else(|| PathBuf::from("~/.config/steady"))
    }

    /// Render as TOML for display.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
