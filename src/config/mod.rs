//! Configuration resolved from environment variables.
//!
//! Every knob has a default, so `Config::default()` is a working
//! configuration for the native engine API. `Config::from_env()` overlays
//! `TEMPCONTAINERS_*` variables on top of those defaults.

mod helpers;
mod lifecycle;
mod runtime;

pub use lifecycle::LifecycleConfig;
pub use runtime::{Backend, DEFAULT_PREFIX, RuntimeConfig};
pub(crate) use runtime::validate_prefix;

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            runtime: RuntimeConfig::resolve()?,
            lifecycle: LifecycleConfig::resolve()?,
        })
    }

    /// Select a backend, keeping everything else.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.runtime.backend = backend;
        self
    }

    /// Override the reserved prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.runtime.prefix = prefix.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::helpers::{parse_bool_env, parse_optional_env};
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime.backend, Backend::Api);
        assert_eq!(config.runtime.cli_binary, "docker");
        assert_eq!(config.runtime.prefix, DEFAULT_PREFIX);
        assert_eq!(config.lifecycle.probe_interval, Duration::from_secs(1));
        assert_eq!(config.lifecycle.probe_timeout, Duration::from_secs(60));
        assert_eq!(config.lifecycle.cleanup_timeout, Duration::from_secs(60));
        assert!(!config.lifecycle.skip_pull);
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("api".parse::<Backend>().unwrap(), Backend::Api);
        assert_eq!("CLI".parse::<Backend>().unwrap(), Backend::Cli);
        assert_eq!(" subprocess ".parse::<Backend>().unwrap(), Backend::Cli);
        assert!("podman-remote".parse::<Backend>().is_err());
    }

    #[test]
    fn test_prefix_validation() {
        assert!(validate_prefix("tempcontainers-").is_ok());
        assert!(validate_prefix("ci_run.1-").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("-leading").is_err());
        assert!(validate_prefix("has space").is_err());
        assert!(validate_prefix("slash/").is_err());
    }

    #[test]
    fn test_parse_helpers() {
        // Keys are unique to this test so parallel tests never race on them.
        unsafe {
            std::env::set_var("TEMPCONTAINERS_TEST_HELPER_NUM", " 42 ");
            std::env::set_var("TEMPCONTAINERS_TEST_HELPER_BAD", "forty-two");
            std::env::set_var("TEMPCONTAINERS_TEST_HELPER_BOOL", "TRUE");
            std::env::set_var("TEMPCONTAINERS_TEST_HELPER_EMPTY", "");
        }

        assert_eq!(
            parse_optional_env("TEMPCONTAINERS_TEST_HELPER_NUM", 7u64).unwrap(),
            42
        );
        assert_eq!(
            parse_optional_env("TEMPCONTAINERS_TEST_HELPER_EMPTY", 7u64).unwrap(),
            7
        );
        assert_eq!(
            parse_optional_env("TEMPCONTAINERS_TEST_HELPER_UNSET", 7u64).unwrap(),
            7
        );
        let err = parse_optional_env("TEMPCONTAINERS_TEST_HELPER_BAD", 7u64).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "TEMPCONTAINERS_TEST_HELPER_BAD"));
        assert!(parse_bool_env("TEMPCONTAINERS_TEST_HELPER_BOOL", false).unwrap());
        assert!(parse_bool_env("TEMPCONTAINERS_TEST_HELPER_BAD", false).is_err());
    }

    #[test]
    fn test_builders() {
        let config = Config::default()
            .with_backend(Backend::Cli)
            .with_prefix("ci-");
        assert_eq!(config.runtime.backend, Backend::Cli);
        assert_eq!(config.runtime.prefix, "ci-");
    }
}
