//! Orphan sweeping and termination handling.
//!
//! Instances from a crashed or killed test run keep their prefixed names,
//! so a sweep by name prefix finds everything this tool ever created on the
//! host, whichever process created it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;

/// Termination signal received by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl TerminationSignal {
    /// Conventional `128 + signo` exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationSignal::Interrupt => 130,
            TerminationSignal::Terminate => 143,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
        }
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl-C only on non-unix platforms).
pub async fn termination_signal() -> TerminationSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => TerminationSignal::Interrupt,
                    _ = sigterm.recv() => TerminationSignal::Terminate,
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                TerminationSignal::Interrupt
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        TerminationSignal::Interrupt
    }
}

/// Tracks live instances and removes orphans by name prefix.
pub struct CleanupRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    prefix: String,
    timeout: Duration,
    poll_interval: Duration,
    live: Mutex<HashSet<String>>,
}

impl CleanupRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, prefix: impl Into<String>, config: &LifecycleConfig) -> Self {
        Self {
            runtime,
            prefix: prefix.into(),
            timeout: config.cleanup_timeout,
            poll_interval: config.cleanup_poll_interval,
            live: Mutex::new(HashSet::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Record a container created by this process.
    pub fn register(&self, id: &str) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    /// Forget a container once it has been torn down.
    pub fn unregister(&self, id: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Number of containers created by this process and not yet torn down.
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn live_ids(&self) -> Vec<String> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Force-remove every prefixed container and wait until none remain.
    ///
    /// Returns how many containers were found.
    pub async fn sweep(&self) -> Result<usize> {
        let mut ids = self.runtime.list_by_name_prefix(&self.prefix).await?;
        for id in self.live_ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        if ids.is_empty() {
            tracing::debug!(prefix = %self.prefix, "no orphaned instances");
            return Ok(0);
        }

        tracing::info!(prefix = %self.prefix, count = ids.len(), "Removing orphaned instances");

        let removals = ids.iter().map(|id| async move {
            if let Err(e) = self.runtime.remove(id, true).await {
                tracing::warn!(container = %id, "Failed to remove instance: {}", e);
            }
        });
        join_all(removals).await;

        self.wait_until_clear().await?;
        self.live.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(ids.len())
    }

    /// Poll until no prefixed container exists, bounded by the cleanup timeout.
    pub async fn wait_until_clear(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = self.runtime.list_by_name_prefix(&self.prefix).await?.len();
            if remaining == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::CleanupFailed {
                    remaining,
                    reason: format!("instances still present after {:?}", self.timeout),
                });
            }
            tracing::debug!(remaining, "waiting for instances to be removed");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Sweep and exit the process when SIGINT or SIGTERM arrives.
    pub fn install_signal_handlers(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let signal = termination_signal().await;
            let code = self.on_signal(signal).await;
            std::process::exit(code);
        })
    }

    /// Best-effort sweep after `signal`. Returns the exit status to use.
    pub async fn on_signal(&self, signal: TerminationSignal) -> i32 {
        tracing::warn!(signal = signal.as_str(), "Received termination signal, removing instances");

        if let Err(e) = self.sweep().await {
            tracing::warn!("Cleanup on {} failed: {}", signal.as_str(), e);
        }
        signal.exit_code()
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubRuntime;

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            cleanup_timeout: Duration::from_millis(100),
            cleanup_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_prefixed() {
        let stub = Arc::new(StubRuntime::new());
        stub.spawn_running("tempcontainers-postgres-old-1");
        stub.spawn_running("tempcontainers-redis-old-2");
        stub.spawn_running("someone-elses-db");

        let registry = CleanupRegistry::new(stub.clone(), "tempcontainers-", &fast_config());
        assert_eq!(registry.sweep().await.unwrap(), 2);
        assert_eq!(stub.container_names(), vec!["someone-elses-db".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_on_clean_host() {
        let stub = Arc::new(StubRuntime::new());
        let registry = CleanupRegistry::new(stub.clone(), "tempcontainers-", &fast_config());
        assert_eq!(registry.sweep().await.unwrap(), 0);
        assert_eq!(stub.remove_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_fails_when_instance_survives() {
        let stub = Arc::new(StubRuntime::new());
        let id = stub.spawn_running("tempcontainers-stuck");
        stub.make_unremovable(&id);

        let registry = CleanupRegistry::new(stub.clone(), "tempcontainers-", &fast_config());
        let err = registry.sweep().await.unwrap_err();
        assert!(matches!(err, Error::CleanupFailed { remaining: 1, .. }));
    }

    #[tokio::test]
    async fn test_live_tracking() {
        let stub = Arc::new(StubRuntime::new());
        let registry = CleanupRegistry::new(stub, "tempcontainers-", &fast_config());
        registry.register("abc");
        registry.register("def");
        assert_eq!(registry.live_count(), 2);
        assert!(registry.unregister("abc"));
        assert!(!registry.unregister("abc"));
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_signal_sweeps_live_and_orphaned() {
        let stub = Arc::new(StubRuntime::new());
        stub.spawn_running("tempcontainers-redis-old");
        let live = stub.spawn_running("tempcontainers-pg-live");
        stub.spawn_running("someone-elses-db");

        let registry = CleanupRegistry::new(stub.clone(), "tempcontainers-", &fast_config());
        registry.register(&live);

        let code = registry.on_signal(TerminationSignal::Terminate).await;
        assert_eq!(code, 143);
        assert_eq!(stub.container_names(), vec!["someone-elses-db".to_string()]);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_exit_code_survives_failed_sweep() {
        let stub = Arc::new(StubRuntime::new());
        let id = stub.spawn_running("tempcontainers-stuck");
        stub.make_unremovable(&id);

        let registry = CleanupRegistry::new(stub.clone(), "tempcontainers-", &fast_config());
        assert_eq!(registry.on_signal(TerminationSignal::Interrupt).await, 130);
        assert_eq!(stub.container_names(), vec!["tempcontainers-stuck".to_string()]);
    }

    #[test]
    fn test_signal_exit_codes() {
        assert_eq!(TerminationSignal::Interrupt.exit_code(), 130);
        assert_eq!(TerminationSignal::Terminate.exit_code(), 143);
    }
}
