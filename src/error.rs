//! Error types for instance provisioning.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for tempcontainers operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// A variable contained non-unicode data.
    #[error("Environment variable {key} is not valid unicode")]
    NotUnicode {
        /// Variable name.
        key: String,
    },
}

/// Errors that can occur while provisioning, using or tearing down an instance.
#[derive(Debug, Error)]
pub enum Error {
    /// No fresh host port could be found.
    #[error("No free port available after {attempts} attempts")]
    PortExhausted {
        /// Number of bind attempts made.
        attempts: usize,
    },

    /// The container engine could not be reached.
    #[error("Container runtime not available: {reason}")]
    RuntimeUnavailable {
        /// Reason why the engine is unavailable.
        reason: String,
    },

    /// Failed to pull the image.
    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed {
        /// Image reference.
        image: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to create the container.
    #[error("Failed to create container '{name}': {reason}")]
    CreateFailed {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to start the container.
    #[error("Failed to start container '{name}': {reason}")]
    StartFailed {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// The readiness probe never succeeded within the timeout.
    #[error(
        "Timed out after {timeout:?} waiting for '{name}' to be healthy, the last probe error was: {detail}"
    )]
    ProbeTimedOut {
        /// Instance name.
        name: String,
        /// Configured timeout.
        timeout: Duration,
        /// Most recent probe failure output.
        detail: String,
    },

    /// The instance's process exited before it became healthy.
    #[error("Instance '{name}' stopped running before it became healthy: {detail}")]
    InstanceDied {
        /// Instance name.
        name: String,
        /// Exit status and last probe output.
        detail: String,
    },

    /// An attached command exited non-zero.
    #[error("Command {command:?} in '{container}' failed (exit code {exit_code:?}): {output}")]
    ExecFailed {
        /// Container id or name.
        container: String,
        /// The argv that was run.
        command: Vec<String>,
        /// Exit code, if the engine reported one.
        exit_code: Option<i64>,
        /// Combined stdout and stderr.
        output: String,
    },

    /// The archive for a payload could not be built.
    #[error("Failed to build archive from '{}': {reason}", path.display())]
    ArchiveBuildFailed {
        /// Source path.
        path: PathBuf,
        /// Reason for failure.
        reason: String,
    },

    /// The engine rejected an archive upload.
    #[error("Failed to copy archive into '{container}:{dest}': {reason}")]
    CopyFailed {
        /// Container id or name.
        container: String,
        /// Destination path inside the container.
        dest: String,
        /// Reason for failure.
        reason: String,
    },

    /// Orphaned instances could not be cleared.
    #[error("Cleanup failed with {remaining} instance(s) remaining: {reason}")]
    CleanupFailed {
        /// Number of prefixed containers still present.
        remaining: usize,
        /// Reason for failure.
        reason: String,
    },

    /// The engine has no container with this id.
    #[error("No such container: {id}")]
    ContainerNotFound {
        /// Container id or name.
        id: String,
    },

    /// Any other engine operation failed (stop, remove, inspect, list).
    #[error("Container runtime {operation} failed: {reason}")]
    Runtime {
        /// Operation that failed.
        operation: &'static str,
        /// Reason for failure.
        reason: String,
    },

    /// A concurrent initialization task panicked or was cancelled.
    #[error("Initialization task failed: {reason}")]
    TaskFailed {
        /// Join error description.
        reason: String,
    },

    /// The caller's callback returned an error.
    #[error(transparent)]
    Callback(#[from] anyhow::Error),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn runtime(operation: &'static str, reason: impl ToString) -> Self {
        Self::Runtime {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Output captured from a failed command, if this error carries one.
    pub fn exec_output(&self) -> Option<&str> {
        match self {
            Self::ExecFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}
