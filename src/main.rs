//! tempcontainers - command line entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tempcontainers::cli::{Cli, Command, run_doctor_command, run_sweep_command, run_up_command};
use tempcontainers::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tempcontainers=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env()?;
    if let Some(backend) = cli.backend {
        config = config.with_backend(backend);
    }
    if let Some(prefix) = cli.prefix {
        config = config.with_prefix(prefix);
    }

    match cli.command {
        Command::Doctor => run_doctor_command(&config).await,
        Command::Sweep => run_sweep_command(&config).await,
        Command::Up(args) => run_up_command(config, args).await,
    }
}
