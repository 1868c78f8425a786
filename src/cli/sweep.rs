//! `sweep`: remove leftovers now.

use crate::cleanup::CleanupRegistry;
use crate::config::Config;
use crate::runtime::connect_runtime;

pub async fn run_sweep_command(config: &Config) -> anyhow::Result<()> {
    let runtime = connect_runtime(&config.runtime).await?;
    let registry = CleanupRegistry::new(runtime, config.runtime.prefix.clone(), &config.lifecycle);

    let removed = registry.sweep().await?;
    println!("Removed {removed} instance(s) with prefix '{}'", registry.prefix());
    Ok(())
}
