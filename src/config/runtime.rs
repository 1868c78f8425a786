use std::fmt;
use std::str::FromStr;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Default reserved prefix carried by every instance name.
pub const DEFAULT_PREFIX: &str = "tempcontainers-";

/// Which container engine backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// The engine's native control API (socket / named pipe).
    #[default]
    Api,
    /// The engine's command-line client, spawned as a subprocess.
    Cli,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Api => "api",
            Backend::Cli => "cli",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" | "native" => Ok(Backend::Api),
            "cli" | "subprocess" => Ok(Backend::Cli),
            other => Err(format!("unknown backend '{other}', expected 'api' or 'cli'")),
        }
    }
}

/// Container engine connection settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Backend selected at construction time.
    pub backend: Backend,
    /// CLI binary used by the subprocess backend.
    pub cli_binary: String,
    /// Reserved prefix for instance names.
    pub prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            cli_binary: "docker".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let prefix = optional_env("TEMPCONTAINERS_PREFIX")?.unwrap_or(defaults.prefix);
        validate_prefix(&prefix).map_err(|message| ConfigError::InvalidValue {
            key: "TEMPCONTAINERS_PREFIX".to_string(),
            message,
        })?;

        Ok(Self {
            backend: parse_optional_env("TEMPCONTAINERS_BACKEND", defaults.backend)?,
            cli_binary: optional_env("TEMPCONTAINERS_CLI_BINARY")?.unwrap_or(defaults.cli_binary),
            prefix,
        })
    }
}

/// Engine container names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub(crate) fn validate_prefix(prefix: &str) -> Result<(), String> {
    let mut chars = prefix.chars();
    match chars.next() {
        None => return Err("prefix must not be empty".to_string()),
        Some(c) if !c.is_ascii_alphanumeric() => {
            return Err(format!("prefix must start with a letter or digit, got '{c}'"));
        }
        Some(_) => {}
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || "_.-".contains(*c))) {
        return Err(format!("prefix contains invalid character '{bad}'"));
    }
    Ok(())
}
