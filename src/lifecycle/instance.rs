//! The caller's view of a running instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::archive::ArchiveTransfer;
use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::initializer::ConcurrentInitializer;
use crate::lifecycle::spec::{Payload, PayloadSource, SetupStep};
use crate::runtime::{ContainerRuntime, ExecOutput};

/// Where an instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AcquiringPorts,
    Pulling,
    Creating,
    Starting,
    Injecting,
    SettingUp,
    AwaitingReady,
    AfterReady,
    TearingDown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AcquiringPorts => "acquiring ports",
            Phase::Pulling => "pulling image",
            Phase::Creating => "creating",
            Phase::Starting => "starting",
            Phase::Injecting => "injecting payloads",
            Phase::SettingUp => "setting up",
            Phase::AwaitingReady => "awaiting readiness",
            Phase::AfterReady => "running after-ready steps",
            Phase::TearingDown => "tearing down",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published port as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceEndpoint {
    pub port: u16,
    pub container_port: u16,
}

impl InstanceEndpoint {
    pub const HOST: &'static str = "127.0.0.1";

    /// `scheme://127.0.0.1:port`.
    pub fn url(&self, scheme: &str) -> String {
        format!("{scheme}://{}:{}", Self::HOST, self.port)
    }
}

impl fmt::Display for InstanceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Self::HOST, self.port)
    }
}

/// Cheap, clonable handle to a live instance.
///
/// Valid only inside the `with_instance` callback that received it; the
/// instance is removed as soon as that callback returns.
#[derive(Clone)]
pub struct InstanceHandle {
    name: String,
    id: String,
    ports: Arc<HashMap<u16, u16>>,
    runtime: Arc<dyn ContainerRuntime>,
    executor: CommandExecutor,
}

impl InstanceHandle {
    pub(crate) fn new(
        name: String,
        id: String,
        ports: HashMap<u16, u16>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            name,
            id,
            ports: Arc::new(ports),
            executor: CommandExecutor::new(runtime.clone()),
            runtime,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host port published for `container_port`.
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }

    pub fn endpoint(&self, container_port: u16) -> Option<InstanceEndpoint> {
        self.host_port(container_port).map(|port| InstanceEndpoint {
            port,
            container_port,
        })
    }

    /// Container port to host port.
    pub fn ports(&self) -> &HashMap<u16, u16> {
        &self.ports
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Run a command and wait for it.
    pub async fn exec<S: AsRef<str>>(&self, argv: &[S]) -> Result<ExecOutput> {
        self.executor.run(&self.id, argv).await
    }

    /// Run `sh -c script` and wait for it.
    pub async fn shell(&self, script: &str) -> Result<ExecOutput> {
        self.executor.shell(&self.id, script).await
    }

    /// Launch a command in the background.
    pub async fn spawn<S: AsRef<str>>(&self, argv: &[S]) -> Result<()> {
        self.executor.start(&self.id, argv).await
    }

    /// Create `payload.dest` and extract the payload into it.
    pub async fn inject(&self, payload: &Payload) -> Result<()> {
        tracing::debug!(instance = %self.name, dest = %payload.dest, "injecting payload");
        self.exec(&["mkdir", "-p", payload.dest.as_str()]).await?;

        let transfer = ArchiveTransfer::new().with_compression(payload.compression);
        let archive = match &payload.source {
            PayloadSource::Path(path) => transfer.build(path)?,
            PayloadSource::Entries(entries) => transfer.from_entries(entries.clone()),
        };
        self.runtime
            .copy_archive_into(&self.id, &payload.dest, archive)
            .await
    }

    /// Execute one setup step.
    pub async fn run_step(&self, step: &SetupStep) -> Result<()> {
        match step {
            SetupStep::Run(argv) => {
                self.exec(argv).await?;
            }
            SetupStep::Start(argv) => self.spawn(argv).await?,
            SetupStep::Parallel(commands) => {
                let mut init = ConcurrentInitializer::new();
                for argv in commands {
                    let handle = self.clone();
                    let argv = argv.clone();
                    init.add(argv.join(" "), async move {
                        handle.exec(&argv).await.map(|_| ())
                    });
                }
                init.run().await?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}
