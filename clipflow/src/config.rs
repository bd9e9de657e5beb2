//! Orchestrator configuration.
//!
//! Values come from `CLIPFLOW_*` environment variables. Parsing goes through
//! [`OrchestratorConfig::from_env_map`] so it can be tested without touching
//! the process environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

const ENV_MAX_GENERATION_JOBS: &str = "CLIPFLOW_MAX_GENERATION_JOBS";
const ENV_GENERATION_TIMEOUT_SECS: &str = "CLIPFLOW_GENERATION_TIMEOUT_SECS";
const ENV_STAGE_TIMEOUT_SECS: &str = "CLIPFLOW_STAGE_TIMEOUT_SECS";
const ENV_MAX_QA_ATTEMPTS: &str = "CLIPFLOW_MAX_QA_ATTEMPTS";
const ENV_ESCALATION_WAIT_SECS: &str = "CLIPFLOW_ESCALATION_WAIT_SECS";
const ENV_POLL_ACTIVE_SECS: &str = "CLIPFLOW_POLL_ACTIVE_SECS";
const ENV_POLL_IDLE_SECS: &str = "CLIPFLOW_POLL_IDLE_SECS";
const ENV_POLL_IDLE_AFTER: &str = "CLIPFLOW_POLL_IDLE_AFTER";
const ENV_MAX_CLIP_SECS: &str = "CLIPFLOW_MAX_CLIP_SECS";
const ENV_STATE_DIR: &str = "CLIPFLOW_STATE_DIR";
const ENV_RETRY_BASE_DELAY_MS: &str = "CLIPFLOW_RETRY_BASE_DELAY_MS";
const ENV_RETRY_MAX_DELAY_MS: &str = "CLIPFLOW_RETRY_MAX_DELAY_MS";

const ALL_KEYS: [&str; 12] = [
    ENV_MAX_GENERATION_JOBS,
    ENV_GENERATION_TIMEOUT_SECS,
    ENV_STAGE_TIMEOUT_SECS,
    ENV_MAX_QA_ATTEMPTS,
    ENV_ESCALATION_WAIT_SECS,
    ENV_POLL_ACTIVE_SECS,
    ENV_POLL_IDLE_SECS,
    ENV_POLL_IDLE_AFTER,
    ENV_MAX_CLIP_SECS,
    ENV_STATE_DIR,
    ENV_RETRY_BASE_DELAY_MS,
    ENV_RETRY_MAX_DELAY_MS,
];

/// Configuration consumed by the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Cap on generation requests fired per run.
    #[serde(default = "default_max_generation_jobs")]
    pub max_generation_jobs: usize,
    /// Absolute await-gate timeout in seconds.
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    /// Per-stage execution timeout in seconds.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    /// Maximum QA attempts per gate.
    #[serde(default = "default_max_qa_attempts")]
    pub max_qa_attempts: u32,
    /// Escalation wait in seconds.
    #[serde(default = "default_escalation_wait")]
    pub escalation_wait_secs: u64,
    /// Poll interval while jobs are changing, in seconds.
    #[serde(default = "default_poll_active")]
    pub poll_active_secs: u64,
    /// Poll interval once jobs have gone quiet, in seconds.
    #[serde(default = "default_poll_idle")]
    pub poll_idle_secs: u64,
    /// Consecutive polls without a status change before backing off.
    #[serde(default = "default_poll_idle_after")]
    pub poll_idle_after: u32,
    /// Upper bound on a clip's duration, enforced when widening.
    #[serde(default = "default_max_clip_secs")]
    pub max_clip_secs: f64,
    /// Root directory of the file store.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Base delay before re-running a stage whose executor errored.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Cap on that delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_generation_jobs() -> usize {
    3
}

fn default_generation_timeout() -> u64 {
    180
}

fn default_stage_timeout() -> u64 {
    600
}

fn default_max_qa_attempts() -> u32 {
    3
}

fn default_escalation_wait() -> u64 {
    300
}

fn default_poll_active() -> u64 {
    5
}

fn default_poll_idle() -> u64 {
    20
}

fn default_poll_idle_after() -> u32 {
    3
}

fn default_max_clip_secs() -> f64 {
    90.0
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./clipflow-state")
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_generation_jobs: default_max_generation_jobs(),
            generation_timeout_secs: default_generation_timeout(),
            stage_timeout_secs: default_stage_timeout(),
            max_qa_attempts: default_max_qa_attempts(),
            escalation_wait_secs: default_escalation_wait(),
            poll_active_secs: default_poll_active(),
            poll_idle_secs: default_poll_idle(),
            poll_idle_after: default_poll_idle_after(),
            max_clip_secs: default_max_clip_secs(),
            state_dir: default_state_dir(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `CLIPFLOW_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut envs = HashMap::new();
        for key in ALL_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    /// Builds a configuration from a map of variables, defaults filling gaps.
    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_generation_jobs: parse_or(envs, ENV_MAX_GENERATION_JOBS, defaults.max_generation_jobs)?,
            generation_timeout_secs: parse_or(
                envs,
                ENV_GENERATION_TIMEOUT_SECS,
                defaults.generation_timeout_secs,
            )?,
            stage_timeout_secs: parse_or(envs, ENV_STAGE_TIMEOUT_SECS, defaults.stage_timeout_secs)?,
            max_qa_attempts: parse_or(envs, ENV_MAX_QA_ATTEMPTS, defaults.max_qa_attempts)?,
            escalation_wait_secs: parse_or(
                envs,
                ENV_ESCALATION_WAIT_SECS,
                defaults.escalation_wait_secs,
            )?,
            poll_active_secs: parse_or(envs, ENV_POLL_ACTIVE_SECS, defaults.poll_active_secs)?,
            poll_idle_secs: parse_or(envs, ENV_POLL_IDLE_SECS, defaults.poll_idle_secs)?,
            poll_idle_after: parse_or(envs, ENV_POLL_IDLE_AFTER, defaults.poll_idle_after)?,
            max_clip_secs: parse_or(envs, ENV_MAX_CLIP_SECS, defaults.max_clip_secs)?,
            state_dir: envs
                .get(ENV_STATE_DIR)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map_or(defaults.state_dir, PathBuf::from),
            retry_base_delay_ms: parse_or(
                envs,
                ENV_RETRY_BASE_DELAY_MS,
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: parse_or(envs, ENV_RETRY_MAX_DELAY_MS, defaults.retry_max_delay_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that caps and timeouts are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_qa_attempts < 1 {
            return Err(ConfigError::OutOfRange(
                "max_qa_attempts must be >= 1".to_string(),
            ));
        }
        if self.max_generation_jobs == 0 {
            return Err(ConfigError::OutOfRange(
                "max_generation_jobs must be >= 1".to_string(),
            ));
        }
        if self.generation_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange(
                "generation_timeout_secs must be positive".to_string(),
            ));
        }
        if self.stage_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange(
                "stage_timeout_secs must be positive".to_string(),
            ));
        }
        if self.escalation_wait_secs == 0 {
            return Err(ConfigError::OutOfRange(
                "escalation_wait_secs must be positive".to_string(),
            ));
        }
        if self.poll_active_secs == 0 || self.poll_idle_secs < self.poll_active_secs {
            return Err(ConfigError::OutOfRange(
                "poll intervals must be positive and idle >= active".to_string(),
            ));
        }
        if !(self.max_clip_secs.is_finite() && self.max_clip_secs > 0.0) {
            return Err(ConfigError::OutOfRange(
                "max_clip_secs must be a positive number".to_string(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::OutOfRange(
                "retry_max_delay_ms must be >= retry_base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the generation job cap.
    #[must_use]
    pub fn with_max_generation_jobs(mut self, jobs: usize) -> Self {
        self.max_generation_jobs = jobs;
        self
    }

    /// Sets the await-gate timeout.
    #[must_use]
    pub fn with_generation_timeout_secs(mut self, secs: u64) -> Self {
        self.generation_timeout_secs = secs;
        self
    }

    /// Sets the per-stage timeout.
    #[must_use]
    pub fn with_stage_timeout_secs(mut self, secs: u64) -> Self {
        self.stage_timeout_secs = secs;
        self
    }

    /// Sets the QA attempt cap.
    #[must_use]
    pub fn with_max_qa_attempts(mut self, attempts: u32) -> Self {
        self.max_qa_attempts = attempts;
        self
    }

    /// Sets the escalation wait.
    #[must_use]
    pub fn with_escalation_wait_secs(mut self, secs: u64) -> Self {
        self.escalation_wait_secs = secs;
        self
    }

    /// Sets the poll intervals.
    #[must_use]
    pub fn with_poll_intervals(mut self, active_secs: u64, idle_secs: u64, idle_after: u32) -> Self {
        self.poll_active_secs = active_secs;
        self.poll_idle_secs = idle_secs;
        self.poll_idle_after = idle_after;
        self
    }

    /// Sets the maximum clip duration.
    #[must_use]
    pub fn with_max_clip_secs(mut self, secs: f64) -> Self {
        self.max_clip_secs = secs;
        self
    }

    /// Sets the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Sets the executor retry delays.
    #[must_use]
    pub fn with_retry_delays_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry_base_delay_ms = base_ms;
        self.retry_max_delay_ms = max_ms;
        self
    }

    /// Await-gate timeout as a `Duration`.
    #[must_use]
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    /// Stage timeout as a `Duration`.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Escalation wait as a `Duration`.
    #[must_use]
    pub fn escalation_wait(&self) -> Duration {
        Duration::from_secs(self.escalation_wait_secs)
    }
}

fn parse_or<T>(envs: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match envs.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::from_env_map(&HashMap::new()).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.max_qa_attempts, 3);
        assert_eq!(config.escalation_wait(), Duration::from_secs(300));
        assert_eq!(config.generation_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn test_overrides_from_env_map() {
        let config = OrchestratorConfig::from_env_map(&envs(&[
            ("CLIPFLOW_MAX_GENERATION_JOBS", "5"),
            ("CLIPFLOW_GENERATION_TIMEOUT_SECS", " 240 "),
            ("CLIPFLOW_STATE_DIR", "/var/lib/clipflow"),
        ]))
        .unwrap();

        assert_eq!(config.max_generation_jobs, 5);
        assert_eq!(config.generation_timeout_secs, 240);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/clipflow"));
    }

    #[test]
    fn test_unparseable_value_is_config_error() {
        let err = OrchestratorConfig::from_env_map(&envs(&[("CLIPFLOW_MAX_QA_ATTEMPTS", "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "CLIPFLOW_MAX_QA_ATTEMPTS"));
    }

    #[test]
    fn test_zero_cap_rejected() {
        let err = OrchestratorConfig::from_env_map(&envs(&[("CLIPFLOW_MAX_QA_ATTEMPTS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange(_)));

        assert!(OrchestratorConfig::new()
            .with_poll_intervals(10, 5, 3)
            .validate()
            .is_err());
    }
}
