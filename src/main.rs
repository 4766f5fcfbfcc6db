//! `spectral-cal`: run the spectral-calibration rig against simulated instruments.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use spectral_daq::config::Settings;
use spectral_daq::instrument::InstrumentRegistry;
use spectral_daq::logging;
use spectral_daq::sequence_file::load_series;
use spectral_daq::sequencer::{expand_series, Payload, Report, RunControl, RunOutcome};
use spectral_daq::spectral::Rig;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Spectral calibration sequencer
#[derive(Parser, Debug)]
#[command(name = "spectral-cal", version)]
#[command(about = "Drive a spectral-calibration rig through measurement series", long_about = None)]
struct Cli {
    /// Settings file (TOML); `SPECTRAL_*` environment variables override it
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the rig and, optionally, queue a series
    Run {
        /// Directory of `.seq` files to run as one series
        #[arg(short, long, value_name = "DIR")]
        series: Option<PathBuf>,

        /// Keep waiting for work after the series completes
        #[arg(long)]
        stay: bool,
    },
    /// Print the expanded control loop of a series as JSON
    Expand {
        /// Directory of `.seq` files
        #[arg(value_name = "DIR")]
        series: PathBuf,
    },
    /// Validate a settings file and print the merged result
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load settings from {}", path.display()),
        None => "Failed to load settings".to_string(),
    })?;
    logging::init(&settings.application);

    match cli.command {
        Command::Run { series, stay } => run(settings, series.as_deref(), stay).await,
        Command::Expand { series } => expand(&settings, &series),
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn expand(settings: &Settings, dir: &Path) -> Result<()> {
    let series = load_series(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    let control_loop = expand_series(&series, &settings.expander)?;
    println!("{}", serde_json::to_string_pretty(&control_loop)?);
    Ok(())
}

async fn run(settings: Settings, series: Option<&Path>, stay: bool) -> Result<()> {
    let run_id = Uuid::new_v4();
    let registry = InstrumentRegistry::simulated(&settings.instruments)
        .context("Failed to build simulated instruments")?;
    if registry.is_empty() {
        warn!("No instruments configured; only empty series can run");
    }
    let rig = Rig::build(settings, registry).context("Failed to build the rig")?;
    let mut reports = rig.handle.subscribe();

    let control = RunControl::new();
    let machine = rig.machine;
    let machine_task = tokio::spawn({
        let control = control.clone();
        async move { machine.run(control).await }
            .instrument(info_span!("rig", run = %run_id))
    });

    if let Some(dir) = series {
        let series = load_series(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
        info!(sequences = series.len(), "Queueing series");
        rig.handle.submit(Payload::Series(series)).await?;
    }

    loop {
        tokio::select! {
            report = reports.recv() => match report {
                Ok(report) => {
                    println!("{}", serde_json::to_string(&report)?);
                    match report {
                        Report::SeriesComplete { .. } if !stay => break,
                        Report::Fault { .. } => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Report stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                rig.handle.abort().await.ok();
                break;
            }
        }
    }

    control.cancel();
    let outcome = machine_task.await.context("Machine task panicked")??;
    info!(?outcome, "Rig stopped");
    if let RunOutcome::Halted { state, reason } = outcome {
        bail!("Rig halted in '{}': {}", state, reason);
    }
    Ok(())
}
