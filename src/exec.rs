//! Running commands inside a live instance.

use std::sync::Arc;

use crate::error::Result;
use crate::runtime::{ContainerRuntime, ExecMode, ExecOutput};

/// Runs commands inside containers through the configured runtime.
#[derive(Clone)]
pub struct CommandExecutor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl CommandExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Run `argv` and wait for it.
    ///
    /// A non-zero exit becomes [`Error::ExecFailed`](crate::Error::ExecFailed)
    /// with the combined output attached.
    pub async fn run<S: AsRef<str>>(&self, id: &str, argv: &[S]) -> Result<ExecOutput> {
        let argv = to_argv(argv);
        tracing::debug!(container = %id, command = ?argv, "exec");
        self.runtime.exec(id, &argv, ExecMode::Attached).await
    }

    /// Launch `argv` in the background. The outcome is not observed.
    pub async fn start<S: AsRef<str>>(&self, id: &str, argv: &[S]) -> Result<()> {
        let argv = to_argv(argv);
        tracing::debug!(container = %id, command = ?argv, "exec (detached)");
        self.runtime.exec(id, &argv, ExecMode::Detached).await?;
        Ok(())
    }

    /// Run a shell snippet with `sh -c`.
    pub async fn shell(&self, id: &str, script: &str) -> Result<ExecOutput> {
        self.run(id, &["sh", "-c", script]).await
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

fn to_argv<S: AsRef<str>>(argv: &[S]) -> Vec<String> {
    argv.iter().map(|s| s.as_ref().to_string()).collect()
}
