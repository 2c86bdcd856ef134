//! Executor configuration.
//!
//! Values come from (in increasing precedence): defaults, a deserialized
//! build config section, environment variables, then explicit builder calls.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Default in-flight limit when nothing else is configured.
pub const DEFAULT_LIMIT: NonZeroUsize = NonZeroUsize::new(8).unwrap();

pub const ENV_CONCURRENCY: &str = "KILN_CONCURRENCY";
pub const ENV_ERROR_MODE: &str = "KILN_ERROR_MODE";
pub const ENV_FAIL_FAST: &str = "KILN_FAIL_FAST";

/// How failures are reported once one has been observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Return the first observed failure immediately. Remaining operations
    /// are detached and keep running.
    #[default]
    First,
    /// Stop admitting, join every in-flight operation, report all failures.
    Collect,
}

/// When a failure is allowed to stop admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// Failures are only seen at checkpoints (reap, race, final join).
    #[default]
    Deferred,
    /// A failing operation raises a shared flag that is checked before
    /// every new operation is started.
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("concurrency limit must be at least 1")]
    ZeroLimit,
    #[error("invalid concurrency limit '{0}'")]
    InvalidLimit(String),
    #[error("invalid error mode '{0}', expected 'first' or 'collect'")]
    InvalidErrorMode(String),
    #[error("invalid fail-fast flag '{0}', expected '1', 'true', '0' or 'false'")]
    InvalidFailFast(String),
}

/// Configuration for a single [`Executor`](crate::Executor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub limit: NonZeroUsize,
    pub errors: ErrorMode,
    pub admission: Admission,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            errors: ErrorMode::default(),
            admission: Admission::default(),
        }
    }
}

impl ExecutorConfig {
    /// Build a config with the given limit. Zero is rejected rather than clamped.
    pub fn with_limit(limit: usize) -> Result<Self, ConfigError> {
        let limit = NonZeroUsize::new(limit).ok_or(ConfigError::ZeroLimit)?;
        Ok(Self {
            limit,
            ..Self::default()
        })
    }

    pub fn errors(mut self, errors: ErrorMode) -> Self {
        self.errors = errors;
        self
    }

    pub fn admission(mut self, admission: Admission) -> Self {
        self.admission = admission;
        self
    }

    /// Apply `KILN_CONCURRENCY`, `KILN_ERROR_MODE` and `KILN_FAIL_FAST` on top of `self`.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_lookup(|key| std::env::var(key).ok())
    }

    fn apply_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(ENV_CONCURRENCY) {
            self.limit = parse_limit(&raw)?;
        }

        if let Some(raw) = lookup(ENV_ERROR_MODE) {
            self.errors = match raw.trim().to_ascii_lowercase().as_str() {
                "first" => ErrorMode::First,
                "collect" => ErrorMode::Collect,
                _ => return Err(ConfigError::InvalidErrorMode(raw)),
            };
        }

        if let Some(raw) = lookup(ENV_FAIL_FAST) {
            self.admission = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" => Admission::FailFast,
                "0" | "false" | "" => Admission::Deferred,
                _ => return Err(ConfigError::InvalidFailFast(raw)),
            };
        }

        Ok(self)
    }
}

/// Parse a user-supplied limit, e.g. from a CLI flag.
pub fn parse_limit(raw: &str) -> Result<NonZeroUsize, ConfigError> {
    let n: usize = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidLimit(raw.to_string()))?;
    NonZeroUsize::new(n).ok_or(ConfigError::ZeroLimit)
}
