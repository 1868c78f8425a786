use std::time::Duration;

use crate::config::helpers::{parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Timing knobs for readiness, teardown and orphan sweeps.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval between readiness polls.
    pub probe_interval: Duration,
    /// Absolute readiness timeout.
    pub probe_timeout: Duration,
    /// Grace period given to `stop` before the engine kills the instance.
    pub stop_grace: Duration,
    /// How long a sweep may wait for prefixed containers to disappear.
    pub cleanup_timeout: Duration,
    /// Interval between sweep convergence checks.
    pub cleanup_poll_interval: Duration,
    /// Skip image pulls (useful offline when images are already present).
    pub skip_pull: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(60),
            cleanup_poll_interval: Duration::from_secs(1),
            skip_pull: false,
        }
    }
}

impl LifecycleConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let probe_interval_ms = parse_optional_env(
            "TEMPCONTAINERS_PROBE_INTERVAL_MS",
            defaults.probe_interval.as_millis() as u64,
        )?;
        if probe_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TEMPCONTAINERS_PROBE_INTERVAL_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            probe_interval: Duration::from_millis(probe_interval_ms),
            probe_timeout: Duration::from_secs(parse_optional_env(
                "TEMPCONTAINERS_PROBE_TIMEOUT_SECS",
                defaults.probe_timeout.as_secs(),
            )?),
            stop_grace: Duration::from_secs(parse_optional_env(
                "TEMPCONTAINERS_STOP_GRACE_SECS",
                defaults.stop_grace.as_secs(),
            )?),
            cleanup_timeout: Duration::from_secs(parse_optional_env(
                "TEMPCONTAINERS_CLEANUP_TIMEOUT_SECS",
                defaults.cleanup_timeout.as_secs(),
            )?),
            cleanup_poll_interval: defaults.cleanup_poll_interval,
            skip_pull: parse_bool_env("TEMPCONTAINERS_SKIP_PULL", defaults.skip_pull)?,
        })
    }
}
