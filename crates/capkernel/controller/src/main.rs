//! capkernel - run the kernel over a journal directory
//!
//! - `run`: start (or resume) the kernel and drain its run-queue
//! - `dump`: replay and print the kernel's structural state
//! - `verify`: check journal integrity, then replay every vat

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capkernel_controller::{
    Controller, ControllerBuilder, ControllerConfig, ControllerError, ControllerResult, ModuleRegistry,
    StorageConfig,
};
use capkernel_store::{JournalStore, StoreError};
use capkernel_types::CapData;

/// capkernel CLI
#[derive(Parser)]
#[command(name = "capkernel")]
#[command(about = "Deterministic capability kernel with promise pipelining", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CAPKERNEL_CONFIG")]
    config: Option<String>,

    /// Log level (overrides the config file)
    #[arg(long, env = "CAPKERNEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "CAPKERNEL_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume the kernel and run until idle
    Run {
        /// Journal directory (in-memory storage if omitted)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Stop after this many cranks
        #[arg(long)]
        max_cranks: Option<u64>,

        /// Messages to hand the bridge device before running
        #[arg(long)]
        inbound: Vec<String>,
    },

    /// Replay a journal and print the kernel dump as JSON
    Dump {
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Check journal checksums and replay every vat
    Verify {
        #[arg(short, long)]
        dir: PathBuf,
    },
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn configure(mut config: ControllerConfig, dir: Option<PathBuf>) -> ControllerConfig {
    if config.vats.is_empty() {
        config = config.with_demo_genesis();
    }
    if let Some(dir) = dir {
        config.storage = StorageConfig::journal(dir);
    }
    config
}

fn start(config: ControllerConfig, dir: Option<PathBuf>) -> ControllerResult<Controller> {
    let config = configure(config, dir);
    ControllerBuilder::from_config(&config, &ModuleRegistry::with_builtins())?.build()
}

/// Reopen a journal without creating one.
fn reopen(config: ControllerConfig, dir: PathBuf) -> ControllerResult<Controller> {
    let config = configure(config, Some(dir));
    ControllerBuilder::from_existing(&config, &ModuleRegistry::with_builtins())?.build()
}

fn run(config: ControllerConfig, dir: Option<PathBuf>, max_cranks: Option<u64>, inbound: Vec<String>) -> ControllerResult<()> {
    let mut controller = start(config, dir)?;
    for message in inbound {
        let args = CapData::from_json(&json!([message]), Vec::new());
        if let Err(reason) = controller.device_input("bridge", "inbound", args)? {
            warn!(reason = %reason.body, "Bridge refused inbound message");
        }
    }

    let cranks = match max_cranks {
        Some(limit) => {
            let mut ran = 0;
            while ran < limit && controller.step()? {
                ran += 1;
            }
            ran
        }
        None => controller.run()?,
    };

    let summary = json!({
        "fresh": controller.is_fresh(),
        "cranks": cranks,
        "crankNumber": controller.crank_number()?,
        "faults": controller.faults(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn dump(config: ControllerConfig, dir: PathBuf) -> ControllerResult<()> {
    let controller = reopen(config, dir)?;
    println!("{}", serde_json::to_string_pretty(&controller.dump()?)?);
    Ok(())
}

fn verify(config: ControllerConfig, dir: PathBuf) -> ControllerResult<()> {
    let report = JournalStore::verify(&dir)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        let offset = report.corrupted_offsets.first().map(|(_, o)| *o).unwrap_or(0);
        return Err(StoreError::Corruption {
            offset,
            reason: format!("{} corrupted records", report.corrupted_records),
        }
        .into());
    }
    let controller = reopen(config, dir)?;
    info!(crank = controller.crank_number()?, "Replay verified");
    Ok(())
}

fn main() -> Result<(), ControllerError> {
    let cli = Cli::parse();

    let config = ControllerConfig::load(cli.config.as_deref())?;
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.json || config.logging.json);

    match cli.command {
        Commands::Run {
            dir,
            max_cranks,
            inbound,
        } => run(config, dir, max_cranks, inbound),
        Commands::Dump { dir } => dump(config, dir),
        Commands::Verify { dir } => verify(config, dir),
    }
}
