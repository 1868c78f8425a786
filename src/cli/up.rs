//! `up`: hold one instance open until SIGINT or SIGTERM.

use clap::Args;

use crate::cleanup::termination_signal;
use crate::config::Config;
use crate::lifecycle::{Environment, InstanceSpec};
use crate::readiness::ReadinessCheck;
use crate::runtime::NativeHealthCheck;

#[derive(Args, Debug, Clone)]
pub struct UpArgs {
    /// Image reference, e.g. redis:latest
    #[arg(long)]
    pub image: String,

    /// Container port to publish on a fresh host port (repeatable)
    #[arg(long)]
    pub port: Vec<u16>,

    /// Environment variable as KEY=VALUE (repeatable)
    #[arg(long, value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Shell command the engine runs as a health check
    #[arg(long)]
    pub health_cmd: Option<String>,

    /// Name appended to the prefix and image kind
    #[arg(long, default_value = "up")]
    pub name: String,

    /// Command to run instead of the image default
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

impl UpArgs {
    fn spec(&self) -> InstanceSpec {
        let mut spec = InstanceSpec::new(image_kind(&self.image), &self.image).named(&self.name);
        for port in &self.port {
            spec = spec.port(*port);
        }
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        if !self.cmd.is_empty() {
            spec = spec.cmd(self.cmd.iter().cloned());
        }
        if let Some(cmd) = &self.health_cmd {
            spec = spec.readiness(ReadinessCheck::native(NativeHealthCheck::shell(cmd)));
        }
        spec
    }
}

pub async fn run_up_command(config: Config, args: UpArgs) -> anyhow::Result<()> {
    let env = Environment::init(config).await?;
    // Covers a signal during pull and startup, before the callback runs.
    env.install_signal_handlers();

    env.with_instance(args.spec(), |instance| async move {
        println!("{} is up", instance.name());
        let mut ports: Vec<_> = instance.ports().iter().collect();
        ports.sort();
        for (container_port, host_port) in ports {
            println!("  {container_port}/tcp -> 127.0.0.1:{host_port}");
        }
        println!("Press Ctrl-C to stop.");

        let signal = termination_signal().await;
        println!("Stopping {} on {}", instance.name(), signal.as_str());
        Ok(())
    })
    .await?;

    env.shutdown().await?;
    Ok(())
}

/// `postgres` from `docker.io/library/postgres:16`.
fn image_kind(image: &str) -> &str {
    let last = image.rsplit('/').next().unwrap_or(image);
    let end = last.find([':', '@']).unwrap_or(last.len());
    &last[..end]
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
