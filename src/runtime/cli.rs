//! Backend that drives the engine's command-line client.
//!
//! Every operation is one child process. Archives are piped into
//! `cp -` chunk by chunk, so payloads never sit in memory in full.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::archive::ArchiveStream;
use crate::error::{Error, Result};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecMode, ExecOutput, HealthReport,
    HealthStatus, name_has_prefix,
};

/// Command-line client backend.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    /// Use `binary` (e.g. `docker` or `podman`) from `PATH` or an absolute path.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the client with `args` and return its output whatever the exit status.
    async fn output(&self, args: &[String]) -> Result<Output> {
        tracing::trace!(binary = %self.binary, ?args, "running engine client");
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))
    }

    /// Run the client and fail with [`Error::Runtime`] on a non-zero exit.
    async fn run(&self, operation: &'static str, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::runtime(operation, stderr_of(&output)))
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::RuntimeUnavailable {
                reason: format!("'{}' not found on PATH", self.binary),
            }
        } else {
            Error::Io(e)
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("no such container")
}

/// Arguments for `create`, in the order the client expects them.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(["create", "--name", &spec.name]);

    for binding in &spec.ports {
        out.push("-p".to_string());
        out.push(format!(
            "{}:{}:{}/tcp",
            binding.host_ip, binding.host_port, binding.container_port
        ));
    }
    for env in spec.env_strings() {
        out.push("-e".to_string());
        out.push(env);
    }
    if let Some(hc) = &spec.health_check {
        out.push("--health-cmd".to_string());
        out.push(hc.command.clone());
        out.push("--health-interval".to_string());
        out.push(format!("{}ms", hc.interval.as_millis()));
        out.push("--health-timeout".to_string());
        out.push(format!("{}ms", hc.timeout.as_millis()));
        out.push("--health-retries".to_string());
        out.push(hc.retries.to_string());
    }
    for bind in &spec.binds {
        out.push("-v".to_string());
        out.push(bind.clone());
    }
    for (key, value) in &spec.labels {
        out.push("--label".to_string());
        out.push(format!("{key}={value}"));
    }
    if spec.tty {
        out.push("-t".to_string());
    }

    out.push(spec.image.clone());
    if let Some(cmd) = &spec.cmd {
        out.extend(cmd.iter().cloned());
    }
    out
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateJson {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    restarting: bool,
    exit_code: Option<i64>,
    health: Option<HealthJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthJson {
    #[serde(default)]
    status: String,
    #[serde(default)]
    log: Option<Vec<HealthLogJson>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthLogJson {
    #[serde(default)]
    output: String,
}

/// Parse `inspect --format '{{json .State}}'` output.
pub(crate) fn parse_state(json: &str) -> Result<ContainerStatus> {
    let state: StateJson = serde_json::from_str(json.trim())
        .map_err(|e| Error::runtime("inspect", format!("unparseable state: {e}")))?;

    let health = state.health.map(|h| HealthReport {
        status: HealthStatus::parse(&h.status),
        last_output: h.log.and_then(|log| log.into_iter().last()).map(|l| l.output),
    });

    Ok(ContainerStatus {
        running: state.running,
        restarting: state.restarting,
        exit_code: state.exit_code,
        health,
    })
}

/// Parse `ps --format '{{.ID}}\t{{.Names}}'` output, keeping only ids whose
/// name really starts with `prefix`.
pub(crate) fn parse_ps(stdout: &str, prefix: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .filter(|(_, names)| names.split(',').any(|n| name_has_prefix(n.trim(), prefix)))
        .map(|(id, _)| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn ping(&self) -> Result<()> {
        let output = self
            .output(&args(["version", "--format", "{{.Server.Version}}"]))
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::RuntimeUnavailable {
                reason: stderr_of(&output),
            })
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        tracing::info!("Pulling image: {}", reference);
        let output = self.output(&args(["pull", "--quiet", reference])).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ImagePullFailed {
                image: reference.to_string(),
                reason: stderr_of(&output),
            })
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.output(&create_args(spec)).await?;
        if !output.status.success() {
            return Err(Error::CreateFailed {
                name: spec.name.clone(),
                reason: stderr_of(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let output = self.output(&args(["start", id])).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::StartFailed {
                name: id.to_string(),
                reason: stderr_of(&output),
            })
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        let output = self.output(&args(["stop", "-t", &secs, id])).await?;
        let stderr = stderr_of(&output);
        if output.status.success() || is_missing_container(&stderr) {
            Ok(())
        } else {
            Err(Error::runtime("stop", stderr))
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut argv = args(["rm", "-v"]);
        if force {
            argv.push("-f".to_string());
        }
        argv.push(id.to_string());

        let output = self.output(&argv).await?;
        let stderr = stderr_of(&output);
        if output.status.success() || is_missing_container(&stderr) {
            Ok(())
        } else {
            Err(Error::runtime("remove", stderr))
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        let output = self
            .output(&args(["inspect", "--format", "{{json .State}}", id]))
            .await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_missing_container(&stderr) {
                return Err(Error::ContainerNotFound { id: id.to_string() });
            }
            return Err(Error::runtime("inspect", stderr));
        }
        parse_state(&String::from_utf8_lossy(&output.stdout))
    }

    async fn list_by_name_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let filter = format!("name={prefix}");
        let stdout = self
            .run(
                "list",
                &args([
                    "ps",
                    "-a",
                    "--no-trunc",
                    "--filter",
                    &filter,
                    "--format",
                    "{{.ID}}\t{{.Names}}",
                ]),
            )
            .await?;
        Ok(parse_ps(&stdout, prefix))
    }

    async fn copy_archive_into(&self, id: &str, dest: &str, mut archive: ArchiveStream) -> Result<()> {
        let copy_failed = |reason: String| Error::CopyFailed {
            container: id.to_string(),
            dest: dest.to_string(),
            reason,
        };

        let target = format!("{id}:{dest}");
        let mut child = self
            .command()
            .args(["cp", "-", target.as_str()])
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let Some(mut stdin) = child.stdin.take() else {
            return Err(copy_failed("stdin not captured".to_string()));
        };

        while let Some(chunk) = archive.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(archive.build_error(e));
                }
            };
            if let Err(e) = stdin.write_all(&chunk).await {
                // The client exited early; its stderr says why.
                tracing::debug!(error = %e, "engine client closed stdin during copy");
                break;
            }
        }
        let _ = stdin.shutdown().await;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(copy_failed(stderr_of(&output)))
        }
    }

    async fn exec(&self, id: &str, argv: &[String], mode: ExecMode) -> Result<ExecOutput> {
        let mut full = vec!["exec".to_string()];
        if mode == ExecMode::Detached {
            full.push("-d".to_string());
        }
        full.push(id.to_string());
        full.extend(argv.iter().cloned());

        let output = self.output(&full).await?;
        let exit_code = output.status.code().map(i64::from);

        if mode == ExecMode::Detached {
            return if output.status.success() {
                Ok(ExecOutput::default())
            } else {
                Err(Error::ExecFailed {
                    container: id.to_string(),
                    command: argv.to_vec(),
                    exit_code,
                    output: stderr_of(&output),
                })
            };
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(ExecOutput {
                exit_code,
                output: combined,
            })
        } else {
            Err(Error::ExecFailed {
                container: id.to_string(),
                command: argv.to_vec(),
                exit_code,
                output: combined,
            })
        }
    }
}
