//! In-memory container engine for tests.
//!
//! Provides [`StubRuntime`], a scriptable [`ContainerRuntime`] that keeps
//! containers in a map, counts every call and lets a test decide how
//! probes, health checks and process deaths play out.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tempcontainers::testing::StubRuntime;
//! use tempcontainers::{Config, Environment};
//!
//! # async fn demo() -> tempcontainers::Result<()> {
//! let stub = Arc::new(StubRuntime::new());
//! stub.fail_then_succeed("pg_isready", 2, "no response");
//! let env = Environment::with_runtime(stub.clone(), Config::default()).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::archive::ArchiveStream;
use crate::error::{Error, Result};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecMode, ExecOutput, HealthReport,
    HealthStatus, name_has_prefix,
};

/// A container held by [`StubRuntime`].
#[derive(Debug, Clone)]
pub struct StubContainer {
    pub id: String,
    pub name: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub exit_code: Option<i64>,
    inspects: u32,
    unremovable: bool,
}

/// An archive received through `copy_archive_into`.
#[derive(Debug, Clone)]
pub struct RecordedCopy {
    pub container: String,
    pub dest: String,
    pub archive: Bytes,
}

#[derive(Debug, Clone)]
struct ExecResponse {
    /// `None` means the response never changes.
    failures_left: Option<u32>,
    exit_code: i64,
    output: String,
}

#[derive(Debug, Default)]
struct Counters {
    pulls: u32,
    creates: u32,
    starts: u32,
    stops: u32,
    removes: u32,
    inspects: u32,
    execs: u32,
}

#[derive(Debug, Default)]
struct StubState {
    containers: BTreeMap<String, StubContainer>,
    next_id: u64,
    responses: HashMap<String, ExecResponse>,
    native_health: VecDeque<(HealthStatus, String)>,
    die_after: Option<(u32, i64)>,
    fail_pull: Option<String>,
    fail_create: Option<String>,
    fail_start: Option<String>,
    unreachable: bool,
    exec_delay: Option<Duration>,
    exec_log: Vec<Vec<String>>,
    copies: Vec<RecordedCopy>,
    removed: Vec<String>,
    counters: Counters,
}

/// A scriptable in-memory engine.
///
/// Unscripted commands succeed with empty output. Containers created with a
/// native health check report healthy unless a health script is set.
#[derive(Debug, Default)]
pub struct StubRuntime {
    state: Mutex<StubState>,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a running container directly, bypassing create/start.
    pub fn spawn_running(&self, name: &str) -> String {
        let mut state = self.state();
        let id = state.allocate_id();
        state.containers.insert(
            id.clone(),
            StubContainer {
                id: id.clone(),
                name: name.to_string(),
                spec: ContainerSpec {
                    name: name.to_string(),
                    ..Default::default()
                },
                running: true,
                exit_code: None,
                inspects: 0,
                unremovable: false,
            },
        );
        id
    }

    /// Commands whose argv starts with `command` (matched against argv[0]
    /// or the space-joined command line) always return this result.
    pub fn respond_to(&self, command: &str, exit_code: i64, output: &str) {
        self.state().responses.insert(
            command.to_string(),
            ExecResponse {
                failures_left: None,
                exit_code,
                output: output.to_string(),
            },
        );
    }

    /// `command` fails `failures` times with `output`, then succeeds.
    pub fn fail_then_succeed(&self, command: &str, failures: u32, output: &str) {
        self.state().responses.insert(
            command.to_string(),
            ExecResponse {
                failures_left: Some(failures),
                exit_code: 1,
                output: output.to_string(),
            },
        );
    }

    /// Native health reported by successive inspects; the last entry sticks.
    pub fn script_native_health(&self, script: Vec<(HealthStatus, &str)>) {
        self.state().native_health = script
            .into_iter()
            .map(|(status, output)| (status, output.to_string()))
            .collect();
    }

    /// Every container's main process exits with `exit_code` once it has
    /// been inspected `inspects` times.
    pub fn die_after_inspects(&self, inspects: u32, exit_code: i64) {
        self.state().die_after = Some((inspects, exit_code));
    }

    /// Stop a container's main process now.
    pub fn kill(&self, id: &str, exit_code: i64) {
        if let Some(c) = self.state().containers.get_mut(id) {
            c.running = false;
            c.exit_code = Some(exit_code);
        }
    }

    /// Removal of `id` reports success but the container stays.
    pub fn make_unremovable(&self, id: &str) {
        if let Some(c) = self.state().containers.get_mut(id) {
            c.unremovable = true;
        }
    }

    pub fn fail_pull(&self, reason: &str) {
        self.state().fail_pull = Some(reason.to_string());
    }

    pub fn fail_create(&self, reason: &str) {
        self.state().fail_create = Some(reason.to_string());
    }

    pub fn fail_start(&self, reason: &str) {
        self.state().fail_start = Some(reason.to_string());
    }

    /// Make `ping` fail.
    pub fn set_unreachable(&self) {
        self.state().unreachable = true;
    }

    /// Delay every attached exec, to keep a lifecycle in flight.
    pub fn set_exec_delay(&self, delay: Duration) {
        self.state().exec_delay = Some(delay);
    }

    /// Names of all containers currently present, sorted.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    /// A snapshot of the container named `name`.
    pub fn container_by_name(&self, name: &str) -> Option<StubContainer> {
        self.state().containers.values().find(|c| c.name == name).cloned()
    }

    /// Snapshots of every container present.
    pub fn containers(&self) -> Vec<StubContainer> {
        self.state().containers.values().cloned().collect()
    }

    /// Names of containers actually removed, in removal order.
    pub fn removed_names(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    /// Every argv passed to `exec`, attached or detached.
    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.state().exec_log.clone()
    }

    pub fn copies(&self) -> Vec<RecordedCopy> {
        self.state().copies.clone()
    }

    pub fn pull_count(&self) -> u32 {
        self.state().counters.pulls
    }

    pub fn create_count(&self) -> u32 {
        self.state().counters.creates
    }

    pub fn start_count(&self) -> u32 {
        self.state().counters.starts
    }

    pub fn stop_count(&self) -> u32 {
        self.state().counters.stops
    }

    pub fn remove_count(&self) -> u32 {
        self.state().counters.removes
    }

    pub fn inspect_count(&self) -> u32 {
        self.state().counters.inspects
    }

    pub fn exec_count(&self) -> u32 {
        self.state().counters.execs
    }
}

impl StubState {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("stub{:012x}", self.next_id)
    }

    fn running(&self, id: &str) -> Result<()> {
        match self.containers.get(id) {
            Some(c) if c.running => Ok(()),
            Some(_) => Err(Error::runtime("exec", format!("container {id} is not running"))),
            None => Err(Error::ContainerNotFound { id: id.to_string() }),
        }
    }

    fn scripted_response(&mut self, argv: &[String]) -> Option<(i64, String)> {
        let program = argv.first()?;
        let line = argv.join(" ");
        let key = if self.responses.contains_key(program.as_str()) {
            program.clone()
        } else {
            self.responses
                .keys()
                .find(|key| line.starts_with(key.as_str()))?
                .clone()
        };
        let response = self.responses.get_mut(&key)?;

        match &mut response.failures_left {
            None => Some((response.exit_code, response.output.clone())),
            Some(0) => Some((0, String::new())),
            Some(left) => {
                *left -= 1;
                Some((response.exit_code, response.output.clone()))
            }
        }
    }

    fn native_health(&mut self) -> Option<(HealthStatus, String)> {
        if self.native_health.len() > 1 {
            self.native_health.pop_front()
        } else {
            self.native_health.front().cloned()
        }
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn ping(&self) -> Result<()> {
        if self.state().unreachable {
            return Err(Error::RuntimeUnavailable {
                reason: "stub engine marked unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut state = self.state();
        state.counters.pulls += 1;
        match &state.fail_pull {
            Some(reason) => Err(Error::ImagePullFailed {
                image: reference.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state();
        state.counters.creates += 1;

        if let Some(reason) = &state.fail_create {
            return Err(Error::CreateFailed {
                name: spec.name.clone(),
                reason: reason.clone(),
            });
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(Error::CreateFailed {
                name: spec.name.clone(),
                reason: "name already in use".to_string(),
            });
        }

        let id = state.allocate_id();
        state.containers.insert(
            id.clone(),
            StubContainer {
                id: id.clone(),
                name: spec.name.clone(),
                spec: spec.clone(),
                running: false,
                exit_code: None,
                inspects: 0,
                unremovable: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.counters.starts += 1;

        if let Some(reason) = state.fail_start.clone() {
            return Err(Error::StartFailed {
                name: id.to_string(),
                reason,
            });
        }
        match state.containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                c.exit_code = None;
                Ok(())
            }
            None => Err(Error::StartFailed {
                name: id.to_string(),
                reason: "No such container".to_string(),
            }),
        }
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state();
        state.counters.stops += 1;
        if let Some(c) = state.containers.get_mut(id)
            && c.running
        {
            c.running = false;
            c.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<()> {
        let mut state = self.state();
        state.counters.removes += 1;

        let unremovable = state.containers.get(id).is_some_and(|c| c.unremovable);
        if !unremovable && let Some(c) = state.containers.remove(id) {
            state.removed.push(c.name);
        }
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        let mut state = self.state();
        state.counters.inspects += 1;

        let die_after = state.die_after;
        let scripted = if state.native_health.is_empty() {
            None
        } else {
            state.native_health()
        };

        let Some(c) = state.containers.get_mut(id) else {
            return Err(Error::ContainerNotFound { id: id.to_string() });
        };

        c.inspects += 1;
        if let Some((after, exit_code)) = die_after
            && c.inspects > after
            && c.running
        {
            c.running = false;
            c.exit_code = Some(exit_code);
        }

        let health = match scripted {
            Some((status, output)) => Some(HealthReport {
                status,
                last_output: Some(output),
            }),
            None => c.spec.health_check.as_ref().map(|_| HealthReport {
                status: HealthStatus::Healthy,
                last_output: None,
            }),
        };

        Ok(ContainerStatus {
            running: c.running,
            restarting: false,
            exit_code: c.exit_code,
            health,
        })
    }

    async fn list_by_name_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .containers
            .values()
            .filter(|c| name_has_prefix(&c.name, prefix))
            .map(|c| c.id.clone())
            .collect())
    }

    async fn copy_archive_into(&self, id: &str, dest: &str, archive: ArchiveStream) -> Result<()> {
        let bytes = archive.into_bytes().await?;
        let mut state = self.state();
        if !state.containers.contains_key(id) {
            return Err(Error::CopyFailed {
                container: id.to_string(),
                dest: dest.to_string(),
                reason: "No such container".to_string(),
            });
        }
        state.copies.push(RecordedCopy {
            container: id.to_string(),
            dest: dest.to_string(),
            archive: bytes,
        });
        Ok(())
    }

    async fn exec(&self, id: &str, argv: &[String], mode: ExecMode) -> Result<ExecOutput> {
        let delay = {
            let mut state = self.state();
            state.counters.execs += 1;
            state.exec_log.push(argv.to_vec());
            state.running(id)?;
            state.exec_delay
        };

        if mode == ExecMode::Detached {
            return Ok(ExecOutput::default());
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = self.state().scripted_response(argv);
        match response {
            None => Ok(ExecOutput {
                exit_code: Some(0),
                output: String::new(),
            }),
            Some((0, output)) => Ok(ExecOutput {
                exit_code: Some(0),
                output,
            }),
            Some((exit_code, output)) => Err(Error::ExecFailed {
                container: id.to_string(),
                command: argv.to_vec(),
                exit_code: Some(exit_code),
                output,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_start_remove() {
        let stub = StubRuntime::new();
        let spec = ContainerSpec {
            name: "tempcontainers-a".to_string(),
            image: "redis".to_string(),
            ..Default::default()
        };
        let id = stub.create(&spec).await.unwrap();
        assert!(stub.inspect(&id).await.unwrap().is_dead());

        stub.start(&id).await.unwrap();
        assert!(stub.inspect(&id).await.unwrap().running);
        assert!(stub.create(&spec).await.is_err());

        stub.remove(&id, true).await.unwrap();
        stub.remove(&id, true).await.unwrap();
        assert_eq!(stub.removed_names(), vec!["tempcontainers-a".to_string()]);
        assert_eq!(stub.remove_count(), 2);
    }

    #[tokio::test]
    async fn test_fail_then_succeed_script() {
        let stub = StubRuntime::new();
        let id = stub.spawn_running("tempcontainers-b");
        stub.fail_then_succeed("check", 1, "nope");
        let argv = vec!["check".to_string()];

        assert!(stub.exec(&id, &argv, ExecMode::Attached).await.is_err());
        assert!(stub.exec(&id, &argv, ExecMode::Attached).await.is_ok());
        assert!(stub.exec(&id, &argv, ExecMode::Attached).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_line_prefix_match() {
        let stub = StubRuntime::new();
        let id = stub.spawn_running("tempcontainers-c");
        stub.respond_to("sh -c mkdir", 1, "read-only file system");

        let mkdir = vec!["sh".to_string(), "-c".to_string(), "mkdir -p /x".to_string()];
        let other = vec!["sh".to_string(), "-c".to_string(), "true".to_string()];
        assert!(stub.exec(&id, &mkdir, ExecMode::Attached).await.is_err());
        assert!(stub.exec(&id, &other, ExecMode::Attached).await.is_ok());
    }
}
