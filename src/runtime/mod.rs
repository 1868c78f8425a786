//! Container engine abstraction.
//!
//! [`ContainerRuntime`] is the full capability set the lifecycle engine
//! needs from a container engine. Two backends implement it:
//!
//! - [`ApiRuntime`] talks to the engine's control API through bollard.
//! - [`CliRuntime`] spawns the engine's command-line client.
//!
//! The backend is picked once by [`connect_runtime`]; everything above this
//! module only sees `Arc<dyn ContainerRuntime>`.

pub mod api;
pub mod cli;
pub mod detect;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use api::ApiRuntime;
pub use cli::CliRuntime;
pub use detect::{EngineDetection, EngineStatus, Platform, check_runtime};

use crate::archive::ArchiveStream;
use crate::config::{Backend, RuntimeConfig};
use crate::error::Result;

/// A host port published to a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    /// Host interface to bind on.
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
}

impl PortBinding {
    /// Bind `container_port` to `host_port` on the loopback interface.
    pub fn loopback(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            host_port,
            container_port,
        }
    }
}

/// Health check executed by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeHealthCheck {
    /// Shell command, run as `CMD-SHELL`. Exit 0 means healthy.
    pub command: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

impl NativeHealthCheck {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            retries: 3,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub ports: Vec<PortBinding>,
    /// Overrides the image's default command.
    pub cmd: Option<Vec<String>>,
    pub health_check: Option<NativeHealthCheck>,
    pub tty: bool,
    /// Bind mounts as `host:container[:options]`.
    pub binds: Vec<String>,
    pub labels: Vec<(String, String)>,
}

impl ContainerSpec {
    pub(crate) fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Health as reported by the engine's native health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No health check configured.
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::None => "none",
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "starting" => HealthStatus::Starting,
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::None,
        }
    }
}

/// Native health status plus the output of its most recent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub last_output: Option<String>,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub restarting: bool,
    pub exit_code: Option<i64>,
    pub health: Option<HealthReport>,
}

impl ContainerStatus {
    /// The main process is gone and the engine is not bringing it back.
    pub fn is_dead(&self) -> bool {
        !self.running && !self.restarting
    }
}

/// Whether `exec` waits for the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Wait for completion and capture combined output.
    Attached,
    /// Return once the command has been dispatched.
    Detached,
}

/// Output of an attached command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` for detached commands.
    pub exit_code: Option<i64>,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Capability set over a container engine.
///
/// Implementations must be safe for concurrent use from many instances.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Backend name, for diagnostics only.
    fn name(&self) -> &'static str;

    /// Check the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Make `reference` available locally.
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Stop, giving the main process `grace` before it is killed.
    /// Stopping an already stopped or missing container succeeds.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Remove a container. Removing a missing container succeeds.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerStatus>;

    /// Ids of all containers (running or not) whose name starts with `prefix`.
    async fn list_by_name_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Extract a tar stream at `dest` inside the container.
    async fn copy_archive_into(&self, id: &str, dest: &str, archive: ArchiveStream) -> Result<()>;

    /// Run `argv` inside the container.
    ///
    /// In attached mode a non-zero exit code is returned as
    /// [`Error::ExecFailed`](crate::Error::ExecFailed) carrying the output.
    async fn exec(&self, id: &str, argv: &[String], mode: ExecMode) -> Result<ExecOutput>;
}

/// Connect to the backend selected in `config`.
pub async fn connect_runtime(config: &RuntimeConfig) -> Result<Arc<dyn ContainerRuntime>> {
    let runtime: Arc<dyn ContainerRuntime> = match config.backend {
        Backend::Api => Arc::new(ApiRuntime::connect().await?),
        Backend::Cli => Arc::new(CliRuntime::new(&config.cli_binary)),
    };

    runtime.ping().await?;
    tracing::debug!(backend = runtime.name(), "connected to container runtime");
    Ok(runtime)
}

/// Names reported by engines may carry a leading slash.
pub(crate) fn name_has_prefix(name: &str, prefix: &str) -> bool {
    name.trim_start_matches('/').starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_has_prefix() {
        assert!(name_has_prefix("/tempcontainers-redis-a", "tempcontainers-"));
        assert!(name_has_prefix("tempcontainers-redis-a", "tempcontainers-"));
        // Engine name filters match substrings; we must not.
        assert!(!name_has_prefix("/other-tempcontainers-redis", "tempcontainers-"));
    }

    #[test]
    fn test_status_is_dead() {
        let mut status = ContainerStatus {
            running: false,
            restarting: true,
            exit_code: None,
            health: None,
        };
        assert!(!status.is_dead());
        status.restarting = false;
        assert!(status.is_dead());
        status.running = true;
        assert!(!status.is_dead());
    }

    #[test]
    fn test_health_status_parse() {
        assert_eq!(HealthStatus::parse("healthy"), HealthStatus::Healthy);
        assert_eq!(HealthStatus::parse("starting"), HealthStatus::Starting);
        assert_eq!(HealthStatus::parse("unhealthy"), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::parse(""), HealthStatus::None);
    }

    #[test]
    fn test_env_strings() {
        let spec = ContainerSpec {
            env: vec![("A".into(), "1".into()), ("B".into(), "x=y".into())],
            ..Default::default()
        };
        assert_eq!(spec.env_strings(), vec!["A=1", "B=x=y"]);
    }
}
