//! CLI command handling.
//!
//! Provides subcommands for:
//! - Checking the container engine (`doctor`)
//! - Removing leftover instances (`sweep`)
//! - Holding one instance open until Ctrl-C (`up`)

mod doctor;
mod sweep;
mod up;

pub use doctor::run_doctor_command;
pub use sweep::run_sweep_command;
pub use up::{UpArgs, run_up_command};

use clap::{ColorChoice, Parser, Subcommand};

use crate::config::{Backend, validate_prefix};

#[derive(Parser, Debug)]
#[command(name = "tempcontainers")]
#[command(about = "Disposable container instances for integration tests")]
#[command(
    long_about = "Provision throwaway containers with fresh ports and guaranteed cleanup.\nExamples:\n  tempcontainers doctor\n  tempcontainers up --image redis:latest --port 6379"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine backend, overrides TEMPCONTAINERS_BACKEND
    #[arg(long, global = true, value_parser = parse_backend)]
    pub backend: Option<Backend>,

    /// Reserved name prefix, overrides TEMPCONTAINERS_PREFIX
    #[arg(long, global = true, value_parser = parse_prefix)]
    pub prefix: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the container engine is installed and running
    #[command(
        about = "Check the container engine",
        long_about = "Reports whether the configured engine is reachable, with a hint if not.\nExample: tempcontainers doctor"
    )]
    Doctor,

    /// Remove every container carrying the reserved prefix
    #[command(
        about = "Remove leftover instances",
        long_about = "Force-removes all containers whose name starts with the reserved prefix.\nExample: tempcontainers sweep"
    )]
    Sweep,

    /// Start one instance and keep it until Ctrl-C
    #[command(
        about = "Hold an instance open",
        long_about = "Provisions an instance, prints its endpoints and removes it on Ctrl-C.\nExample: tempcontainers up --image postgres:latest --port 5432 --env POSTGRES_PASSWORD=pass"
    )]
    Up(UpArgs),
}

fn parse_backend(s: &str) -> Result<Backend, String> {
    s.parse::<Backend>()
}

fn parse_prefix(s: &str) -> Result<String, String> {
    validate_prefix(s)?;
    Ok(s.to_string())
}
