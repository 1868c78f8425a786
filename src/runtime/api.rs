//! Backend that talks to the engine's control API through bollard.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HealthConfig, HealthStatusEnum, HostConfig};
use futures::StreamExt;

use crate::archive::ArchiveStream;
use crate::error::{Error, Result};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecMode, ExecOutput, HealthReport,
    HealthStatus, name_has_prefix,
};

/// Connect to the engine, trying the platform default first and then the
/// well-known rootless / desktop socket locations.
pub async fn connect_docker() -> Result<Docker> {
    let mut last_error = String::from("no engine socket found");

    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => last_error = e.to_string(),
        },
        Err(e) => last_error = e.to_string(),
    }

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let path = socket.to_string_lossy();
        if let Ok(docker) = Docker::connect_with_socket(&path, 120, bollard::API_DEFAULT_VERSION)
            && docker.ping().await.is_ok()
        {
            tracing::debug!(socket = %path, "connected via fallback socket");
            return Ok(docker);
        }
    }

    Err(Error::RuntimeUnavailable { reason: last_error })
}

#[cfg(unix)]
fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if let Some(home) = dirs::home_dir() {
        sockets.push(home.join(".docker/run/docker.sock"));
    }
    if let Some(runtime_dir) = dirs::runtime_dir() {
        sockets.push(runtime_dir.join("docker.sock"));
        sockets.push(runtime_dir.join("podman/podman.sock"));
    }
    sockets
}

#[cfg(not(unix))]
fn fallback_sockets() -> Vec<PathBuf> {
    Vec::new()
}

/// Engine API backend.
#[derive(Debug, Clone)]
pub struct ApiRuntime {
    docker: Docker,
}

impl ApiRuntime {
    /// Connect using [`connect_docker`].
    pub async fn connect() -> Result<Self> {
        Ok(Self {
            docker: connect_docker().await?,
        })
    }

    /// Wrap an existing client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn exec_attached(&self, id: &str, exec_id: &str, argv: &[String]) -> Result<ExecOutput> {
        let started = self
            .docker
            .start_exec(exec_id, Some(StartExecOptions::default()))
            .await
            .map_err(|e| Error::runtime("exec", e))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => output.push_str(&log.to_string()),
                    Err(e) => return Err(Error::runtime("exec", e)),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| Error::runtime("exec inspect", e))?;

        match inspect.exit_code {
            Some(0) => Ok(ExecOutput {
                exit_code: Some(0),
                output,
            }),
            exit_code => Err(Error::ExecFailed {
                container: id.to_string(),
                command: argv.to_vec(),
                exit_code,
                output,
            }),
        }
    }
}

/// 404 (no such container) and 304 (already in the requested state).
fn is_benign(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 304 | 404,
            ..
        }
    )
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

#[async_trait]
impl ContainerRuntime for ApiRuntime {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::RuntimeUnavailable {
                reason: e.to_string(),
            })
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        tracing::info!("Pulling image: {}", reference);

        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::ImagePullFailed {
                        image: reference.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!("Pulled image: {}", reference);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for binding in &spec.ports {
            let key = format!("{}/tcp", binding.container_port);
            port_bindings.insert(
                key.clone(),
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some(binding.host_ip.clone()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let env = spec.env_strings();
        let labels: HashMap<String, String> = spec.labels.iter().cloned().collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            // Removal is explicit so teardown stays observable.
            auto_remove: Some(false),
            ..Default::default()
        };

        let healthcheck = spec.health_check.as_ref().map(|hc| HealthConfig {
            test: Some(vec!["CMD-SHELL".to_string(), hc.command.clone()]),
            interval: Some(nanos(hc.interval)),
            timeout: Some(nanos(hc.timeout)),
            retries: Some(i64::from(hc.retries)),
            ..Default::default()
        });

        let config = Config {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            cmd: spec.cmd.clone(),
            tty: Some(spec.tty),
            healthcheck,
            labels: if labels.is_empty() { None } else { Some(labels) },
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::CreateFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "engine warning: {}", warning);
        }

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::StartFailed {
                name: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(Error::runtime("stop", e)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(Error::runtime("remove", e)),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    Error::ContainerNotFound { id: id.to_string() }
                } else {
                    Error::runtime("inspect", e)
                }
            })?;

        let state = info.state.unwrap_or_default();
        let health = state.health.map(|h| {
            let status = match h.status {
                Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
                Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
                Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
                _ => HealthStatus::None,
            };
            let last_output = h
                .log
                .and_then(|log| log.into_iter().last())
                .and_then(|entry| entry.output);
            HealthReport {
                status,
                last_output,
            }
        });

        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            exit_code: state.exit_code,
            health,
        })
    }

    async fn list_by_name_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::runtime("list", e))?;

        Ok(containers
            .into_iter()
            .filter(|c| {
                c.names
                    .as_ref()
                    .is_some_and(|names| names.iter().any(|n| name_has_prefix(n, prefix)))
            })
            .filter_map(|c| c.id)
            .collect())
    }

    async fn copy_archive_into(&self, id: &str, dest: &str, archive: ArchiveStream) -> Result<()> {
        // The upload endpoint takes the whole body at once.
        let body = archive.into_bytes().await?;
        let options = UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), body)
            .await
            .map_err(|e| Error::CopyFailed {
                container: id.to_string(),
                dest: dest.to_string(),
                reason: e.to_string(),
            })
    }

    async fn exec(&self, id: &str, argv: &[String], mode: ExecMode) -> Result<ExecOutput> {
        let attached = mode == ExecMode::Attached;
        let created = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(attached),
                    attach_stderr: Some(attached),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::runtime("exec create", e))?;

        if attached {
            return self.exec_attached(id, &created.id, argv).await;
        }

        self.docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::runtime("exec", e))?;

        Ok(ExecOutput::default())
    }
}
