//! Polling an instance until it is healthy, dead or out of time.
//!
//! ```text
//!   Starting ──► Probing ──┬──► Healthy
//!       │                  ├──► Died
//!       └──────────────────┴──► TimedOut
//! ```
//!
//! Each instance gets one monitor task. The task publishes every state
//! change through a `watch` channel, so the poller never blocks on a slow
//! or absent reader, and it exits on the first terminal state or when its
//! cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ExecMode, HealthStatus, NativeHealthCheck};

/// How readiness is decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The engine runs the health check; the monitor reads its verdict.
    Native(NativeHealthCheck),
    /// The monitor execs this argv; exit code 0 means healthy.
    Command(Vec<String>),
}

/// A probe plus its timing.
///
/// Unset timings fall back to the environment's [`LifecycleConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub probe: Probe,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl ReadinessCheck {
    pub fn native(check: NativeHealthCheck) -> Self {
        Self {
            probe: Probe::Native(check),
            interval: None,
            timeout: None,
        }
    }

    pub fn command<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        Self {
            probe: Probe::Command(argv.into_iter().map(Into::into).collect()),
            interval: None,
            timeout: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The engine-side health check to install at create time, if any.
    pub fn native_health_check(&self) -> Option<&NativeHealthCheck> {
        match &self.probe {
            Probe::Native(check) => Some(check),
            Probe::Command(_) => None,
        }
    }

    pub(crate) fn interval_or(&self, config: &LifecycleConfig) -> Duration {
        self.interval.unwrap_or(config.probe_interval)
    }

    pub(crate) fn timeout_or(&self, config: &LifecycleConfig) -> Duration {
        self.timeout.unwrap_or(config.probe_timeout)
    }
}

/// Observed readiness. Only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    /// No poll has completed yet.
    Starting,
    /// Polled at least once, not healthy yet.
    Probing {
        status: HealthStatus,
        last_failure: Option<String>,
    },
    Healthy,
    /// The main process exited before becoming healthy.
    Died {
        exit_code: Option<i64>,
        detail: String,
    },
    /// The deadline passed without a healthy poll.
    TimedOut { detail: String },
}

impl ReadinessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReadinessState::Healthy | ReadinessState::Died { .. } | ReadinessState::TimedOut { .. }
        )
    }
}

/// Spawns readiness monitor tasks.
pub struct ReadinessMonitor;

impl ReadinessMonitor {
    /// Start polling container `id`. `name` is used in logs and errors.
    ///
    /// The first poll happens immediately. `interval` and `timeout` must
    /// already be resolved; see [`ReadinessCheck::with_interval`].
    pub fn spawn(
        runtime: Arc<dyn ContainerRuntime>,
        id: &str,
        name: &str,
        probe: Probe,
        interval: Duration,
        timeout: Duration,
    ) -> ReadinessHandle {
        let (tx, rx) = watch::channel(ReadinessState::Starting);
        let cancel = CancellationToken::new();

        let poller = Poller {
            runtime,
            id: id.to_string(),
            name: name.to_string(),
            probe,
            interval,
            timeout,
            tx,
        };
        let task = tokio::spawn(poller.run(cancel.clone()));

        ReadinessHandle {
            name: name.to_string(),
            timeout,
            rx,
            cancel,
            task: Some(task),
        }
    }
}

/// Handle to a running monitor. Dropping it cancels the task.
pub struct ReadinessHandle {
    name: String,
    timeout: Duration,
    rx: watch::Receiver<ReadinessState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReadinessHandle {
    /// Current state.
    pub fn state(&self) -> ReadinessState {
        self.rx.borrow().clone()
    }

    /// A receiver that observes every published state.
    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.rx.clone()
    }

    /// Whether the monitor task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the first terminal state.
    pub async fn wait(&mut self) -> Result<()> {
        let state = match self.rx.wait_for(ReadinessState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => {
                return Err(Error::TaskFailed {
                    reason: format!("readiness monitor for '{}' stopped early", self.name),
                });
            }
        };

        match state {
            ReadinessState::Healthy => Ok(()),
            ReadinessState::Died { exit_code, detail } => Err(Error::InstanceDied {
                name: self.name.clone(),
                detail: match exit_code {
                    Some(code) => format!("exit code {code}; {detail}"),
                    None => detail,
                },
            }),
            ReadinessState::TimedOut { detail } => Err(Error::ProbeTimedOut {
                name: self.name.clone(),
                timeout: self.timeout,
                detail,
            }),
            // wait_for only yields terminal states
            ReadinessState::Starting | ReadinessState::Probing { .. } => Ok(()),
        }
    }

    /// Cancel the task and wait until it has exited.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
            && e.is_panic()
        {
            tracing::warn!(instance = %self.name, "readiness monitor panicked: {}", e);
        }
    }
}

impl Drop for ReadinessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum PollOutcome {
    Status {
        status: HealthStatus,
        failure: Option<String>,
    },
    Died {
        exit_code: Option<i64>,
    },
    Gone,
}

struct Poller {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    name: String,
    probe: Probe,
    interval: Duration,
    timeout: Duration,
    tx: watch::Sender<ReadinessState>,
}

impl Poller {
    async fn run(self, cancel: CancellationToken) {
        let deadline = Instant::now() + self.timeout;
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_status: Option<HealthStatus> = None;
        let mut last_failure: Option<String> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = time::sleep_until(deadline) => return self.timed_out(last_failure),
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = time::sleep_until(deadline) => return self.timed_out(last_failure),
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                PollOutcome::Gone => {
                    tracing::info!(instance = %self.name, "instance removed during startup");
                    let detail = match last_failure {
                        Some(failure) => {
                            format!("container no longer exists; last probe output: {failure}")
                        }
                        None => "container no longer exists".to_string(),
                    };
                    self.tx.send_replace(ReadinessState::Died {
                        exit_code: None,
                        detail,
                    });
                    return;
                }
                PollOutcome::Died { exit_code } => {
                    tracing::info!(instance = %self.name, ?exit_code, "instance died during startup");
                    let detail = match last_failure {
                        Some(failure) => format!("last probe output: {failure}"),
                        None => "no probe output".to_string(),
                    };
                    self.tx.send_replace(ReadinessState::Died { exit_code, detail });
                    return;
                }
                PollOutcome::Status { status, failure } => {
                    if last_status != Some(status) {
                        tracing::info!(
                            instance = %self.name,
                            "Health status changed from {} to {}",
                            last_status.map_or("none", |s| s.as_str()),
                            status.as_str()
                        );
                        last_status = Some(status);
                    }

                    if status == HealthStatus::Healthy {
                        self.tx.send_replace(ReadinessState::Healthy);
                        return;
                    }

                    if failure.is_some() {
                        last_failure = failure;
                    }
                    let next = ReadinessState::Probing {
                        status,
                        last_failure: last_failure.clone(),
                    };
                    self.tx.send_if_modified(|current| {
                        if *current == next {
                            false
                        } else {
                            *current = next;
                            true
                        }
                    });
                }
            }
        }
    }

    fn timed_out(&self, last_failure: Option<String>) {
        let detail = last_failure.unwrap_or_else(|| "no probe completed".to_string());
        tracing::info!(instance = %self.name, timeout = ?self.timeout, "readiness timed out");
        self.tx.send_replace(ReadinessState::TimedOut { detail });
    }

    async fn poll_once(&self) -> PollOutcome {
        let status = match self.runtime.inspect(&self.id).await {
            Ok(status) => status,
            // Removed behind our back counts as dead.
            Err(Error::ContainerNotFound { .. }) => return PollOutcome::Gone,
            Err(e) => {
                return PollOutcome::Status {
                    status: HealthStatus::Starting,
                    failure: Some(e.to_string()),
                };
            }
        };

        if status.is_dead() {
            return PollOutcome::Died {
                exit_code: status.exit_code,
            };
        }

        match &self.probe {
            Probe::Native(_) => match status.health {
                Some(report) => PollOutcome::Status {
                    status: report.status,
                    failure: report.last_output,
                },
                None => PollOutcome::Status {
                    status: HealthStatus::None,
                    failure: Some("engine reports no health check".to_string()),
                },
            },
            Probe::Command(argv) => {
                match self.runtime.exec(&self.id, argv, ExecMode::Attached).await {
                    Ok(_) => PollOutcome::Status {
                        status: HealthStatus::Healthy,
                        failure: None,
                    },
                    Err(e) => PollOutcome::Status {
                        status: HealthStatus::Starting,
                        failure: Some(e.exec_output().map_or_else(|| e.to_string(), str::to_string)),
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubRuntime;

    const FAST: Duration = Duration::from_millis(10);

    fn probe() -> Probe {
        Probe::Command(vec!["pg_isready".to_string()])
    }

    #[tokio::test]
    async fn test_fail_twice_then_healthy() {
        let stub = Arc::new(StubRuntime::new());
        let id = stub.spawn_running("tempcontainers-pg-a");
        stub.fail_then_succeed("pg_isready", 2, "no response");

        let mut handle =
            ReadinessMonitor::spawn(stub.clone(), &id, "pg-a", probe(), FAST, Duration::from_secs(5));
        handle.wait().await.unwrap();
        handle.stop().await;

        assert_eq!(handle.state(), ReadinessState::Healthy);
        assert!(handle.is_finished());
        assert_eq!(stub.exec_count(), 3);

        // No further probes once stopped.
        tokio::time::sleep(FAST * 5).await;
        assert_eq!(stub.exec_count(), 3);
    }

    #[tokio::test]
    async fn test_timeout_reports_last_failure() {
        let stub = Arc::new(StubRuntime::new());
        let id = stub.spawn_running("tempcontainers-pg-b");
        stub.respond_to("pg_isready", 1, "connection refused");

        let mut handle = ReadinessMonitor::spawn(
            stub.clone(),
            &id,
            "pg-b",
            probe(),
            FAST,
            Duration::from_millis(100),
        );
        let err = handle.wait().await.unwrap_err();
        match err {
            Error::ProbeTimedOut { name, detail, .. } => {
                assert_eq!(name, "pg-b");
                assert_eq!(detail, "connection refused");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_death_short_circuits() {
        let stub = Arc::new(StubRuntime::new());
        let id = stub.spawn_running("tempcontainers-pg-c");
        stub.respond_to("pg_isready", 1, "starting up");
        stub.die_after_inspects(2, 3);

        let started = std::time::Instant::now();
        let mut handle =
            ReadinessMonitor::spawn(stub.clone(), &id, "pg-c", probe(), FAST, Duration::from_secs(30));
        let err = handle.wait().await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            Error::InstanceDied { name, detail } => {
                assert_eq!(name, "pg-c");
                assert!(detail.contains("exit code 3"), "{detail}");
                assert!(detail.contains("starting up"), "{detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_removed_container_counts_as_dead() {
        let stub = Arc::new(StubRuntime::new());
        let id = stub.spawn_running("tempcontainers-pg-d");
        stub.respond_to("pg_isready", 1, "starting up");

        let started = std::time::Instant::now();
        let mut handle =
            ReadinessMonitor::spawn(stub.clone(), &id, "pg-d", probe(), FAST, Duration::from_secs(30));
        tokio::time::sleep(FAST * 3).await;
        stub.remove(&id, true).await.unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        match err {
            Error::InstanceDied { name, detail } => {
                assert_eq!(name, "pg-d");
                assert!(detail.contains("no longer exists"), "{detail}");
                assert!(detail.contains("starting up"), "{detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            handle.state(),
            ReadinessState::Died { exit_code: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_native_probe_reads_engine_health() {
        let stub = Arc::new(StubRuntime::new());
        let id = stub.spawn_running("tempcontainers-rabbit");
        stub.script_native_health(vec![
            (HealthStatus::Starting, "booting"),
            (HealthStatus::Unhealthy, "not yet"),
            (HealthStatus::Healthy, ""),
        ]);

        let mut rx;
        {
            let mut handle = ReadinessMonitor::spawn(
                stub.clone(),
                &id,
                "rabbit",
                Probe::Native(NativeHealthCheck::shell("true")),
                FAST,
                Duration::from_secs(5),
            );
            rx = handle.subscribe();
            handle.wait().await.unwrap();
        }
        assert_eq!(*rx.borrow_and_update(), ReadinessState::Healthy);
        assert_eq!(stub.exec_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_terminal() {
        let stub = Arc::new(StubRuntime::new());
        let id = stub.spawn_running("tempcontainers-slow");
        stub.respond_to("pg_isready", 1, "nope");

        let mut handle =
            ReadinessMonitor::spawn(stub.clone(), &id, "slow", probe(), FAST, Duration::from_secs(30));
        tokio::time::sleep(FAST * 3).await;
        handle.stop().await;
        assert!(handle.is_finished());
        assert!(matches!(handle.state(), ReadinessState::Probing { .. }));

        let polls = stub.exec_count();
        tokio::time::sleep(FAST * 5).await;
        assert_eq!(stub.exec_count(), polls);
    }

    #[test]
    fn test_check_defaults_from_config() {
        let config = LifecycleConfig::default();
        let check = ReadinessCheck::command(["redis-cli", "ping"]);
        assert_eq!(check.interval_or(&config), config.probe_interval);
        assert_eq!(check.timeout_or(&config), config.probe_timeout);
        assert!(check.native_health_check().is_none());

        let check = check.with_timeout(Duration::from_secs(5));
        assert_eq!(check.timeout_or(&config), Duration::from_secs(5));
    }
}
