//! What to provision: image, ports, payloads and setup steps.

use std::path::PathBuf;

use crate::archive::{ArchiveEntry, Compression};
use crate::readiness::ReadinessCheck;

/// A container port to publish on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequest {
    pub container_port: u16,
    /// `None` leases a fresh port from the environment's allocator.
    pub host_port: Option<u16>,
}

impl PortRequest {
    pub fn ephemeral(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
        }
    }

    pub fn fixed(host_port: u16, container_port: u16) -> Self {
        Self {
            container_port,
            host_port: Some(host_port),
        }
    }
}

/// Where an injected payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    /// A file or directory on the host.
    Path(PathBuf),
    /// Files generated in memory.
    Entries(Vec<ArchiveEntry>),
}

/// Files to extract into the instance before setup runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub source: PayloadSource,
    /// Directory inside the instance; created if missing.
    pub dest: String,
    pub compression: Compression,
}

impl Payload {
    pub fn path(source: impl Into<PathBuf>, dest: impl Into<String>) -> Self {
        Self {
            source: PayloadSource::Path(source.into()),
            dest: dest.into(),
            compression: Compression::None,
        }
    }

    pub fn entries(entries: Vec<ArchiveEntry>, dest: impl Into<String>) -> Self {
        Self {
            source: PayloadSource::Entries(entries),
            dest: dest.into(),
            compression: Compression::None,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

/// One step of instance preparation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    /// Run and wait; a non-zero exit aborts provisioning.
    Run(Vec<String>),
    /// Launch in the background.
    Start(Vec<String>),
    /// Run every command concurrently and wait for all of them.
    Parallel(Vec<Vec<String>>),
}

impl SetupStep {
    pub fn run<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        SetupStep::Run(argv.into_iter().map(Into::into).collect())
    }

    pub fn start<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        SetupStep::Start(argv.into_iter().map(Into::into).collect())
    }

    /// `sh -c script`, waited for.
    pub fn shell(script: impl Into<String>) -> Self {
        SetupStep::Run(vec!["sh".to_string(), "-c".to_string(), script.into()])
    }
}

/// Everything needed to provision one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Service kind, e.g. `postgres`. Part of the instance name.
    pub kind: String,
    /// Optional caller-chosen name, also part of the instance name.
    pub name: String,
    pub image: String,
    pub ports: Vec<PortRequest>,
    pub env: Vec<(String, String)>,
    pub cmd: Option<Vec<String>>,
    pub tty: bool,
    /// Bind mounts as `host:container[:options]`.
    pub binds: Vec<String>,
    pub readiness: Option<ReadinessCheck>,
    pub payloads: Vec<Payload>,
    /// Runs after payload injection, before the readiness wait.
    pub setup: Vec<SetupStep>,
    /// Runs once the instance is healthy, before the callback.
    pub after_ready: Vec<SetupStep>,
}

impl InstanceSpec {
    pub fn new(kind: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn port(mut self, container_port: u16) -> Self {
        self.ports.push(PortRequest::ephemeral(container_port));
        self
    }

    pub fn fixed_port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortRequest::fixed(host_port, container_port));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cmd<S: Into<String>>(mut self, argv: impl IntoIterator<Item = S>) -> Self {
        self.cmd = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.binds.push(bind.into());
        self
    }

    pub fn readiness(mut self, check: ReadinessCheck) -> Self {
        self.readiness = Some(check);
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payloads.push(payload);
        self
    }

    pub fn setup(mut self, step: SetupStep) -> Self {
        self.setup.push(step);
        self
    }

    pub fn after_ready(mut self, step: SetupStep) -> Self {
        self.after_ready.push(step);
        self
    }

    /// Build a fresh container name under `prefix`.
    ///
    /// The prefix appears exactly once even when the caller already put it
    /// somewhere in `kind` or `name`, and a random suffix keeps names distinct.
    pub fn instance_name(&self, prefix: &str) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut parts: Vec<String> = [self.kind.as_str(), self.name.as_str()]
            .into_iter()
            .map(|part| remove_all(&sanitize(part), prefix).trim_matches('-').to_string())
            .filter(|part| !part.is_empty())
            .collect();
        parts.push(suffix[..8].to_string());

        // Joining can rebuild the prefix across a part boundary.
        let body = remove_all(&parts.join("-"), prefix);
        format!("{prefix}{}", body.trim_start_matches('-'))
    }
}

/// Remove `prefix` until it no longer occurs; a removal can splice a new
/// occurrence together.
fn remove_all(part: &str, prefix: &str) -> String {
    let mut part = part.to_string();
    if prefix.is_empty() {
        return part;
    }
    while part.contains(prefix) {
        part = part.replace(prefix, "");
    }
    part
}

/// Replace characters the engine rejects in container names.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_.-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
