//! `Environment` and the `with_instance` sequence.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::cleanup::CleanupRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lifecycle::instance::{InstanceHandle, Phase};
use crate::lifecycle::spec::InstanceSpec;
use crate::ports::{MAX_ATTEMPTS, PortAllocator};
use crate::readiness::{ReadinessHandle, ReadinessMonitor, ReadinessState};
use crate::runtime::{ContainerRuntime, ContainerSpec, PortBinding, connect_runtime};

/// Shared state for one test run: the engine connection, the port
/// allocator and the orphan registry.
pub struct Environment {
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    cleanup: Arc<CleanupRegistry>,
    config: Config,
}

impl Environment {
    /// Connect to the configured engine and sweep orphans from earlier runs.
    pub async fn init(config: Config) -> Result<Self> {
        let runtime = connect_runtime(&config.runtime).await?;
        Self::with_runtime(runtime, config).await
    }

    /// Use an already constructed runtime. Sweeps orphans like [`init`](Self::init).
    pub async fn with_runtime(runtime: Arc<dyn ContainerRuntime>, config: Config) -> Result<Self> {
        let cleanup = Arc::new(CleanupRegistry::new(
            runtime.clone(),
            config.runtime.prefix.clone(),
            &config.lifecycle,
        ));

        let swept = cleanup.sweep().await?;
        if swept > 0 {
            tracing::info!(count = swept, "Removed orphaned instances from a previous run");
        }

        Ok(Self {
            runtime,
            ports: PortAllocator::new(),
            cleanup,
            config,
        })
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn cleanup(&self) -> &Arc<CleanupRegistry> {
        &self.cleanup
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn prefix(&self) -> &str {
        &self.config.runtime.prefix
    }

    /// Sweep and exit on SIGINT/SIGTERM.
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        self.cleanup.clone().install_signal_handlers()
    }

    /// Provision an instance, hand it to `f`, and tear it down afterwards.
    ///
    /// Teardown runs exactly once whether provisioning fails, `f` returns
    /// an error, or `f` panics (the panic is resumed after teardown). The
    /// callback's error wins over teardown errors, which are only logged.
    /// If this future is dropped mid-flight, removal is spawned on the
    /// current runtime.
    pub async fn with_instance<F, Fut, T>(&self, spec: InstanceSpec, f: F) -> Result<T>
    where
        F: FnOnce(InstanceHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let name = spec.instance_name(self.prefix());
        let mut guard = TeardownGuard::new(
            self.runtime.clone(),
            self.cleanup.clone(),
            name.clone(),
            self.config.lifecycle.stop_grace,
        );
        let mut monitor = None;
        let mut phase = Phase::AcquiringPorts;

        tracing::info!(instance = %name, image = %spec.image, "Starting instance");

        let outcome = match self
            .provision(&spec, &name, &mut guard, &mut monitor, &mut phase)
            .await
        {
            Ok(handle) => {
                tracing::info!(instance = %name, ports = ?handle.ports(), "Instance ready");
                AssertUnwindSafe(f(handle))
                    .catch_unwind()
                    .await
                    .map(|result| result.map_err(Error::Callback))
            }
            Err(e) => {
                tracing::warn!(instance = %name, phase = %phase, "Provisioning failed: {}", e);
                Ok(Err(e))
            }
        };

        if let Some(mut monitor) = monitor.take() {
            monitor.stop().await;
        }
        guard.teardown().await;

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    async fn provision(
        &self,
        spec: &InstanceSpec,
        name: &str,
        guard: &mut TeardownGuard,
        monitor: &mut Option<ReadinessHandle>,
        phase: &mut Phase,
    ) -> Result<InstanceHandle> {
        let lifecycle = &self.config.lifecycle;

        *phase = Phase::AcquiringPorts;
        let (bindings, port_map) = self.bind_ports(spec)?;

        if !lifecycle.skip_pull {
            *phase = Phase::Pulling;
            self.runtime.pull_image(&spec.image).await?;
        }

        *phase = Phase::Creating;
        let container = ContainerSpec {
            name: name.to_string(),
            image: spec.image.clone(),
            env: spec.env.clone(),
            ports: bindings,
            cmd: spec.cmd.clone(),
            health_check: spec
                .readiness
                .as_ref()
                .and_then(|check| check.native_health_check().cloned()),
            tty: spec.tty,
            binds: spec.binds.clone(),
            labels: vec![("tempcontainers.kind".to_string(), spec.kind.clone())],
        };
        let id = self.runtime.create(&container).await?;
        guard.arm(id.clone());
        tracing::debug!(instance = %name, id = %id, "created");

        *phase = Phase::Starting;
        self.runtime.start(&id).await?;

        if let Some(check) = &spec.readiness {
            *monitor = Some(ReadinessMonitor::spawn(
                self.runtime.clone(),
                &id,
                name,
                check.probe.clone(),
                check.interval_or(lifecycle),
                check.timeout_or(lifecycle),
            ));
        }

        let handle = InstanceHandle::new(name.to_string(), id, port_map, self.runtime.clone());

        if let Err(e) = prepare(&handle, spec, phase).await {
            // A dead instance explains a failed setup step better than the step does.
            if let Some(m) = monitor.as_mut()
                && matches!(m.state(), ReadinessState::Died { .. })
            {
                m.wait().await?;
            }
            return Err(e);
        }

        if let Some(m) = monitor.as_mut() {
            *phase = Phase::AwaitingReady;
            m.wait().await?;
            m.stop().await;
        }

        *phase = Phase::AfterReady;
        for step in &spec.after_ready {
            handle.run_step(step).await?;
        }

        Ok(handle)
    }

    fn bind_ports(&self, spec: &InstanceSpec) -> Result<(Vec<PortBinding>, HashMap<u16, u16>)> {
        let wanted = spec.ports.iter().filter(|p| p.host_port.is_none()).count();
        let mut leases = self.ports.acquire_many(wanted)?.into_iter();

        let mut bindings = Vec::with_capacity(spec.ports.len());
        let mut port_map = HashMap::with_capacity(spec.ports.len());
        for request in &spec.ports {
            let host_port = match request.host_port {
                Some(port) => port,
                None => match leases.next() {
                    Some(lease) => lease.port,
                    None => {
                        return Err(Error::PortExhausted {
                            attempts: MAX_ATTEMPTS,
                        });
                    }
                },
            };
            bindings.push(PortBinding::loopback(host_port, request.container_port));
            port_map.insert(request.container_port, host_port);
        }
        Ok((bindings, port_map))
    }

    /// Remove every prefixed instance that is still around.
    pub async fn shutdown(self) -> Result<usize> {
        let live = self.cleanup.live_count();
        if live > 0 {
            tracing::warn!(live, "Shutting down with live instances");
        }
        self.cleanup.sweep().await
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("backend", &self.runtime.name())
            .field("prefix", &self.config.runtime.prefix)
            .field("ports_leased", &self.ports.allocated_count())
            .finish_non_exhaustive()
    }
}

/// Payload injection and setup steps.
async fn prepare(handle: &InstanceHandle, spec: &InstanceSpec, phase: &mut Phase) -> Result<()> {
    *phase = Phase::Injecting;
    for payload in &spec.payloads {
        handle.inject(payload).await?;
    }

    *phase = Phase::SettingUp;
    for step in &spec.setup {
        handle.run_step(step).await?;
    }
    Ok(())
}

/// Stops and removes the instance exactly once.
struct TeardownGuard {
    runtime: Arc<dyn ContainerRuntime>,
    cleanup: Arc<CleanupRegistry>,
    name: String,
    grace: Duration,
    id: Option<String>,
}

impl TeardownGuard {
    fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cleanup: Arc<CleanupRegistry>,
        name: String,
        grace: Duration,
    ) -> Self {
        Self {
            runtime,
            cleanup,
            name,
            grace,
            id: None,
        }
    }

    fn arm(&mut self, id: String) {
        self.cleanup.register(&id);
        self.id = Some(id);
    }

    async fn teardown(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        tracing::info!(instance = %self.name, phase = %Phase::TearingDown, "Stopping instance");

        if let Err(e) = self.runtime.stop(&id, self.grace).await {
            tracing::warn!(instance = %self.name, "Failed to stop instance: {}", e);
        }
        match self.runtime.remove(&id, true).await {
            Ok(()) => {
                self.cleanup.unregister(&id);
                tracing::debug!(instance = %self.name, "removed");
            }
            Err(e) => tracing::warn!(instance = %self.name, "Failed to remove instance: {}", e),
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                instance = %self.name,
                "Instance dropped outside a tokio runtime, it will be removed by the next sweep"
            );
            return;
        };

        tracing::warn!(instance = %self.name, "Instance dropped mid-flight, removing in background");
        let runtime = self.runtime.clone();
        let cleanup = self.cleanup.clone();
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            match runtime.remove(&id, true).await {
                Ok(()) => {
                    cleanup.unregister(&id);
                }
                Err(e) => tracing::warn!(instance = %name, "Failed to remove instance: {}", e),
            }
        });
    }
}
