//! CLI entry point for streak-daq
//!
//! # Usage
//!
//! Print the settings of every component:
//! ```bash
//! streak-daq --config config/streak_daq.toml info
//! ```
//!
//! Take ten software-triggered frames:
//! ```bash
//! streak-daq acquire --frames 10 --triggered
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use daq_driver_hamamatsu::StreakCamera;
use std::path::PathBuf;
use std::time::Duration;
use streak_daq::config::{StreakDaqConfig, DEFAULT_CONFIG_PATH};
use streak_daq::{logging, session};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "streak-daq")]
#[command(about = "Hamamatsu streak camera acquisition over RemoteEx", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print the current device settings
    Info,

    /// Acquire a number of frames and print a summary of each
    Acquire {
        /// Number of frames to collect
        #[arg(long, default_value = "1")]
        frames: usize,

        /// Fire the software trigger once per frame instead of free-running
        #[arg(long)]
        triggered: bool,

        /// Seconds to wait for each frame
        #[arg(long, default_value = "10")]
        frame_timeout: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = StreakDaqConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;
    daq_driver_hamamatsu::link();

    info!(
        "{} connecting to {}:{}",
        config.application.name, config.camera.host, config.camera.port
    );
    let system = StreakCamera::connect(&config.camera).await?;

    let outcome = run(&system, cli.command).await;
    if let Err(e) = system.shutdown().await {
        error!("Shutdown failed: {}", e);
    }
    outcome
}

async fn run(system: &StreakCamera, command: Commands) -> Result<()> {
    match command {
        Commands::Info => {
            session::print_info(system);
            Ok(())
        }
        Commands::Acquire {
            frames,
            triggered,
            frame_timeout,
        } => {
            let frame_timeout = Duration::try_from_secs_f64(frame_timeout)
                .map_err(|_| anyhow!("Invalid frame timeout {}", frame_timeout))?;
            for summary in session::acquire(system, frames, triggered, frame_timeout).await? {
                println!("{summary}");
            }
            Ok(())
        }
    }
}
