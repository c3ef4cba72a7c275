//! agnosctl - AGNOS flashing CLI
//!
//! Lists releases, plans flashing runs and drives the full orchestration
//! against a simulated device.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod error;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{ClassifyArgs, PlanArgs, SimulateArgs};
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "agnosctl")]
#[command(about = "AGNOS flashing CLI - Plan and rehearse comma 3/3X flashing runs")]
#[command(version)]
#[command(long_about = "
agnosctl works with the release catalog and partition manifests used to flash
AGNOS onto comma 3/3X devices. It can classify a device by its storage facts,
show exactly which partitions a run would touch, and run the complete flashing
sequence against a simulated device with optional injected failures.

Use --json flag for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output format (human-readable or JSON)
    #[arg(
        long,
        global = true,
        help = "Output in JSON format for machine parsing"
    )]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Release catalog file (YAML or JSON); the built-in catalog otherwise
    #[arg(long, global = true, env = "AGNOSCTL_CATALOG")]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List releases offered for flashing
    Versions,

    /// Show which partitions a run would repair, erase and write
    Plan(PlanArgs),

    /// Classify a device from its storage facts
    Classify(ClassifyArgs),

    /// Run the full flashing sequence against a simulated device
    Simulate(SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("agnosctl={},agnos_flash={}", log_level, log_level).into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let result = execute_command(&cli).await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }

            let exit_code = e.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
            std::process::exit(exit_code);
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    let catalog = cli.catalog.as_deref();
    match &cli.command {
        Commands::Versions => commands::versions::execute(catalog, cli.json).await,
        Commands::Plan(args) => commands::plan::execute(args, catalog, cli.json).await,
        Commands::Classify(args) => commands::classify::execute(args, cli.json).await,
        Commands::Simulate(args) => commands::simulate::execute(args, catalog, cli.json).await,
    }
}
