//! Orchestrator configuration.
//!
//! Defaults: a one hour retention window, a sweep every ten minutes, a
//! heartbeat after 90 seconds of stream idleness, streams that stay open
//! across the checkpoint, and history listings capped at 100 rows.
//!
//! [`OrchestratorConfig::from_env`] overrides any of these from
//! `JOBLINE_*` environment variables.

use std::env;
use std::time::Duration;

use crate::{JoblineError, Result};

const DEFAULT_RETENTION_SECS: u64 = 3600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 600;
const DEFAULT_HEARTBEAT_SECS: u64 = 90;
const DEFAULT_HISTORY_LIST_LIMIT: usize = 100;

/// Runtime settings for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Minimum age before a terminal job may be evicted.
    pub retention_window: Duration,
    /// How often the retention sweeper runs.
    pub sweep_interval: Duration,
    /// Stream idleness before a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Whether streams end once a job pauses for confirmation.
    pub close_stream_on_checkpoint: bool,
    /// Upper bound on history listing size.
    pub history_list_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retention_window: Duration::from_secs(DEFAULT_RETENTION_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            close_stream_on_checkpoint: false,
            history_list_limit: DEFAULT_HISTORY_LIST_LIMIT,
        }
    }
}

impl OrchestratorConfig {
    /// Sets the retention window.
    pub fn with_retention_window(mut self, window: Duration) -> Self {
        self.retention_window = window;
        self
    }

    /// Sets the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Ends streams at the checkpoint.
    pub fn with_close_stream_on_checkpoint(mut self, enabled: bool) -> Self {
        self.close_stream_on_checkpoint = enabled;
        self
    }

    /// Sets the history listing cap.
    pub fn with_history_list_limit(mut self, limit: usize) -> Self {
        self.history_list_limit = limit;
        self
    }

    /// Reads overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`JoblineError::Config`] if a variable is set but malformed,
    /// or if an interval is zero.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads overrides through `lookup`; unset names keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            retention_window: parse_duration_secs(
                &lookup,
                "JOBLINE_RETENTION_SECS",
                DEFAULT_RETENTION_SECS,
            )?,
            sweep_interval: parse_duration_secs(
                &lookup,
                "JOBLINE_SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            )?,
            heartbeat_interval: parse_duration_secs(
                &lookup,
                "JOBLINE_HEARTBEAT_SECS",
                DEFAULT_HEARTBEAT_SECS,
            )?,
            close_stream_on_checkpoint: parse_bool(
                &lookup,
                "JOBLINE_CLOSE_STREAM_ON_CHECKPOINT",
                false,
            )?,
            history_list_limit: parse_usize(
                &lookup,
                "JOBLINE_HISTORY_LIST_LIMIT",
                DEFAULT_HISTORY_LIST_LIMIT,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(JoblineError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(JoblineError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_duration_secs<F>(lookup: &F, name: &str, default_secs: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(Duration::from_secs(default_secs));
    };
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| JoblineError::Config(format!("invalid value for {name}: {e}")))
}

fn parse_usize<F>(lookup: &F, name: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|e| JoblineError::Config(format!("invalid value for {name}: {e}"))),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(JoblineError::Config(format!(
            "invalid boolean value for {name}: {raw}"
        ))),
    }
}
