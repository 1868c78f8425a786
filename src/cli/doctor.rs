//! `doctor`: is the engine usable?

use crate::config::Config;
use crate::runtime::check_runtime;

/// Print engine status and, when it is unusable, what to do about it.
pub async fn run_doctor_command(config: &Config) -> anyhow::Result<()> {
    let detection = check_runtime(&config.runtime).await;

    println!("Backend:  {}", detection.backend);
    if detection.backend == crate::config::Backend::Cli {
        println!("Binary:   {}", config.runtime.cli_binary);
    }
    println!("Platform: {:?}", detection.platform);
    println!("Engine:   {}", detection.status);
    println!("Prefix:   {}", config.runtime.prefix);

    if let Some(hint) = detection.hint() {
        println!();
        println!("  {hint}");
        anyhow::bail!("container engine is {}", detection.status);
    }
    Ok(())
}
