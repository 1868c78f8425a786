//! Engine detection with platform-specific guidance.
//!
//! Checks whether the container engine is installed (client binary on
//! PATH) and running (daemon answering), and gives install or startup
//! instructions when it is not. Used by `tempcontainers doctor` and by
//! tests that want to skip cleanly on machines without an engine.
//!
//! With the API backend a reachable socket is enough, even when no client
//! binary is installed. With the CLI backend the binary is required.

use std::process::Stdio;

use crate::config::{Backend, RuntimeConfig};
use crate::runtime::{ApiRuntime, CliRuntime, ContainerRuntime};

/// Engine availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Engine reachable through the configured backend.
    Available,
    /// Client binary not found and no daemon reachable.
    NotInstalled,
    /// Client found but daemon not responding.
    NotRunning,
}

impl EngineStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, EngineStatus::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Available => "available",
            EngineStatus::NotInstalled => "not installed",
            EngineStatus::NotRunning => "not running",
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host platform for install guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOS,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/mac-install/"
            }
            Platform::Linux => "Install Docker Engine: https://docs.docker.com/engine/install/",
            Platform::Windows => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/windows-install/"
            }
        }
    }

    pub fn start_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => "Start Docker Desktop from Applications, or run: open -a Docker",
            Platform::Linux => "Start the Docker daemon: sudo systemctl start docker",
            Platform::Windows => "Start Docker Desktop from the Start menu",
        }
    }
}

/// Result of an engine detection check.
#[derive(Debug, Clone)]
pub struct EngineDetection {
    pub status: EngineStatus,
    pub platform: Platform,
    pub backend: Backend,
}

impl EngineDetection {
    /// What the user should do next, if anything.
    pub fn hint(&self) -> Option<&'static str> {
        match self.status {
            EngineStatus::Available => None,
            EngineStatus::NotInstalled => Some(self.platform.install_hint()),
            EngineStatus::NotRunning => Some(self.platform.start_hint()),
        }
    }
}

/// Check whether the engine selected by `config` is installed and running.
pub async fn check_runtime(config: &RuntimeConfig) -> EngineDetection {
    let platform = Platform::current();
    let detection = |status| EngineDetection {
        status,
        platform,
        backend: config.backend,
    };

    let reachable = match config.backend {
        Backend::Api => ApiRuntime::connect().await.is_ok(),
        Backend::Cli => {
            if !binary_exists(&config.cli_binary).await {
                return detection(EngineStatus::NotInstalled);
            }
            CliRuntime::new(&config.cli_binary).ping().await.is_ok()
        }
    };

    if reachable {
        detection(EngineStatus::Available)
    } else if binary_exists(&config.cli_binary).await {
        detection(EngineStatus::NotRunning)
    } else {
        detection(EngineStatus::NotInstalled)
    }
}

/// Check if `binary` resolves on PATH (or exists, when given as a path).
async fn binary_exists(binary: &str) -> bool {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        return std::path::Path::new(binary).is_file();
    }

    let finder = if cfg!(windows) { "where" } else { "which" };
    tokio::process::Command::new(finder)
        .arg(binary)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_hint_not_empty() {
        for platform in [Platform::MacOS, Platform::Linux, Platform::Windows] {
            assert!(!platform.install_hint().is_empty());
            assert!(!platform.start_hint().is_empty());
        }
    }

    #[test]
    fn test_engine_status_display() {
        assert_eq!(EngineStatus::Available.to_string(), "available");
        assert_eq!(EngineStatus::NotInstalled.as_str(), "not installed");
        assert_eq!(EngineStatus::NotRunning.as_str(), "not running");
        assert!(EngineStatus::Available.is_ok());
        assert!(!EngineStatus::NotRunning.is_ok());
    }

    #[test]
    fn test_hint_follows_status() {
        let mut detection = EngineDetection {
            status: EngineStatus::Available,
            platform: Platform::Linux,
            backend: Backend::Cli,
        };
        assert!(detection.hint().is_none());
        detection.status = EngineStatus::NotRunning;
        assert_eq!(detection.hint(), Some(Platform::Linux.start_hint()));
    }

    #[tokio::test]
    async fn test_missing_cli_binary_is_not_installed() {
        let config = RuntimeConfig {
            backend: Backend::Cli,
            cli_binary: "tempcontainers-no-such-binary".to_string(),
            ..Default::default()
        };
        let detection = check_runtime(&config).await;
        assert_eq!(detection.status, EngineStatus::NotInstalled);
    }
}
