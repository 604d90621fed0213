//! Command-line entry point for the fleet orchestrator.

use adfleet::config::{PlatformName, Settings};
use adfleet::console::{OperatorConsole, StdinConsole};
use adfleet::device::driver::{AndroidDriver, DeviceDriver, IosDriver};
use adfleet::device::{CommandExec, SystemExec};
use adfleet::harvester::{CollectionService, HarvesterClient};
use adfleet::supervisor::FleetSupervisor;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Runs a batch of paired device experiments from a CSV definition file.
#[derive(Parser, Debug)]
#[command(name = "adfleet", version, about)]
struct Cli {
    /// CSV file containing the parameters for one or more experiments.
    batch_file: PathBuf,

    /// Optional TOML configuration file layered over the built-in defaults.
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("loading configuration")?;

    let collection: Arc<dyn CollectionService> = Arc::new(
        HarvesterClient::new(&settings.collection, &settings.retry)
            .context("building collection service client")?,
    );
    let driver: Arc<dyn DeviceDriver> = match settings.fleet.platform {
        PlatformName::Android => Arc::new(AndroidDriver::new(settings.android.clone())),
        PlatformName::Ios => Arc::new(IosDriver::new(
            settings.ios.clone(),
            settings.collection.base_url.clone(),
            settings.collection.auth_token.clone(),
        )),
    };
    let exec: Arc<dyn CommandExec> = Arc::new(SystemExec);
    let console: Arc<dyn OperatorConsole> = Arc::new(StdinConsole);

    let supervisor = FleetSupervisor::new(settings, driver, exec, console, collection);
    supervisor
        .run_batch(&cli.batch_file)
        .context("running experiment batch")?;
    Ok(())
}
