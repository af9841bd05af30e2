//! `scene-daq`: command-line front end of the acquisition controller.
//!
//! ```bash
//! # capture one sample per stimulus image
//! scene-daq --config rig.toml run --stimuli stimuli/
//!
//! # ten numbered samples starting at 1
//! scene-daq run --count 10 --start 1
//!
//! # average dark captures into a calibration frame
//! scene-daq master-dark darks/thorlabs thorlabs_master_dark.npy
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scene_daq::calibration::{write_master_dark, CalibrationStore};
use scene_daq::config::AppConfig;
use scene_daq::orchestrator::Orchestrator;
use scene_daq::sources::{numbered_samples, stimulus_samples};
use scene_daq::storage::TiffFrameWriter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "scene-daq", version, about = "Synchronized dual-sensor scene acquisition")]
struct Cli {
    /// Configuration file (TOML); built-in rig defaults apply when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire samples with both sensors
    Run(RunArgs),
    /// Average dark TIFF captures into a `.npy` calibration frame
    MasterDark {
        /// Directory of dark `.tif` captures
        input: PathBuf,
        /// Output `.npy` file
        output: PathBuf,
    },
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Name samples after the `.jpg`/`.png` stimuli in this directory
    #[arg(long, conflicts_with = "count")]
    stimuli: Option<PathBuf>,

    /// Number of numbered samples
    #[arg(long)]
    count: Option<usize>,

    /// First sample number (defaults to `acquisition.first_index`)
    #[arg(long, requires = "count")]
    start: Option<usize>,

    /// Override `application.output_dir`
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => AppConfig::load_defaults().context("Failed to load default configuration")?,
    };
    Ok(config)
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::MasterDark { input, output } => {
            init_tracing("info");
            let dark = write_master_dark(&input, &output).with_context(|| {
                format!("Failed to build master dark from {}", input.display())
            })?;
            info!(frames = dark.frames, shape = ?dark.data.shape(), "Done");
            Ok(())
        }
        Command::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Command::Run(args) => {
            let config = load_config(cli.config.as_ref())?;
            init_tracing(&config.application.log_level);
            run(config, args).await
        }
    }
}

async fn run(mut config: AppConfig, args: RunArgs) -> Result<()> {
    if let Some(output) = args.output {
        config.application.output_dir = output;
    }

    let samples = match (&args.stimuli, args.count) {
        (Some(dir), _) => stimulus_samples(dir)
            .with_context(|| format!("Failed to list stimuli in {}", dir.display()))?,
        (None, Some(count)) => {
            numbered_samples(args.start.unwrap_or(config.acquisition.first_index), count)
        }
        (None, None) => bail!("either --stimuli or --count is required"),
    };
    info!(
        app = %config.application.name,
        samples = samples.len(),
        output = %config.application.output_dir.display(),
        "Starting acquisition"
    );

    let calibration = CalibrationStore::load([&config.leader, &config.follower])
        .context("Failed to load dark calibration")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current sample");
            // Receiver gone means the run already finished.
            let _ = stop_tx.send(true);
        }
    });

    let sink = TiffFrameWriter::new(
        config.application.output_dir.clone(),
        config.acquisition.write_reports,
    );
    let mut orchestrator = Orchestrator::from_config(&config, &calibration, sink);
    let summary = orchestrator
        .run(samples, &stop_rx)
        .await
        .context("Acquisition run failed")?;

    println!(
        "Run {}: {} complete, {} partial, {} rejected, {} abandoned{}",
        summary.run_id,
        summary.counts.complete,
        summary.counts.partial,
        summary.counts.rejected,
        summary.counts.abandoned,
        if summary.stopped_early {
            " (stopped early)"
        } else {
            ""
        }
    );
    Ok(())
}
