//! The binary entry point for the strand server.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use strand_config::{CliArgs, Config};
use strand_server::{Stack, StartupError, demo_components};

const APP_NAME: &str = "strand";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("strand: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let args = CliArgs::parse();
    let config_dir = resolve_config_dir(&args)?;

    let mut config = Config::load_or_create(&config_dir)?;
    config.apply_cli_overrides(&args);

    let log_dir = config
        .log
        .dir
        .clone()
        .unwrap_or_else(|| config_dir.join("logs"));
    strand_log::init_logging(Some(&log_dir), config.log.json_file, Some(&config));
    tracing::info!(config_dir = %config_dir.display(), "Starting strand server");

    let stack = Arc::new(Stack::new(&config, demo_components())?);
    let engine = stack.start()?;
    tracing::info!(engine = %engine, "Dispatch running");

    let listener = match stack.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            stack.shutdown();
            return Err(e);
        }
    };

    let server = {
        let stack = Arc::clone(&stack);
        tokio::spawn(async move { stack.serve(listener).await })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
    }
    tracing::info!("Shutdown requested");

    // Blocking joins happen off the async workers.
    let stopping = Arc::clone(&stack);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.shutdown()).await {
        tracing::error!("Shutdown task failed: {e}");
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Transport stopped with error: {e}"),
        Err(e) => tracing::error!("Transport task failed: {e}"),
    }
    Ok(())
}

fn resolve_config_dir(args: &CliArgs) -> Result<PathBuf, StartupError> {
    if let Some(dir) = &args.config {
        return Ok(dir.clone());
    }
    dirs::config_dir()
        .map(|base| base.join(APP_NAME))
        .ok_or(StartupError::NoConfigDir)
}
