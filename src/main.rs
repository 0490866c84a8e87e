//! CLI entry point for srs-daq
//!
//! ```bash
//! srs-daq --simulate calibrate 700-720
//! srs-daq optimize --hint -49.8
//! srs-daq status
//! srs-daq ports
//! ```
//!
//! Every command that touches an instrument opens both, runs, and closes them
//! again whatever the outcome. `calibrate` and `optimize` keep the background
//! status polls running for the length of the sweep. Ctrl-C during either
//! stops the sweep at the next scan point; the calibration keeps every
//! wavelength finished before that.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_experiment::{CalibrationEngine, SweepTrace};
use mimalloc::MiMalloc;
use srs_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use srs_daq::logging::{self, OutputFormat};
use srs_daq::Instruments;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "srs-daq", version)]
#[command(about = "Time-zero calibration for a delay stage, tunable laser and lock-in", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the in-process instrument simulators
    #[arg(long, global = true)]
    simulate: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find time zero for every wavelength in a range, e.g. 700-720
    Calibrate {
        /// Inclusive wavelength range in nm
        range: String,
    },

    /// Find time zero at the laser's current wavelength
    Optimize {
        /// Centre of the sweep in mm; derived from the calibration if omitted
        #[arg(long, allow_hyphen_values = true)]
        hint: Option<f64>,

        /// Write the measured curve to this JSON file
        #[arg(long)]
        trace: Option<PathBuf>,
    },

    /// Print the state of both instruments
    Status,

    /// Move the stage to an absolute position in mm
    Move {
        /// Target position
        #[arg(allow_hyphen_values = true)]
        position: f64,
    },

    /// Tune the laser
    Tune {
        /// Wavelength in nm
        wavelength: u32,
    },

    /// Print the laser's fault state and history
    Faults,

    /// List serial ports
    Ports,
}

impl Commands {
    /// Long-running commands that want the status polls alongside them.
    fn is_sweep(&self) -> bool {
        matches!(self, Self::Calibrate { .. } | Self::Optimize { .. })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.simulate |= cli.simulate;

    let format = if cli.json_logs {
        OutputFormat::Json
    } else {
        OutputFormat::Compact
    };
    logging::init(&config.log_level, format)?;

    if let Commands::Ports = cli.command {
        return list_ports();
    }

    let instruments = Instruments::open(&config)
        .await
        .context("opening instruments")?;
    if cli.command.is_sweep() {
        instruments.start_polling(&config);
    }
    let result = run(&cli.command, &config, &instruments).await;
    instruments.shutdown().await;
    result
}

async fn run(command: &Commands, config: &AppConfig, instruments: &Instruments) -> Result<()> {
    match command {
        Commands::Calibrate { range } => {
            let engine = sweep_engine(config, instruments).await?;
            let summary = engine.calibrate(range).await?;
            for trace in &summary.calibrated {
                print_trace(trace);
            }
            for skipped in &summary.skipped {
                println!("{} nm skipped: {}", skipped.wavelength_nm, skipped.reason);
            }
            println!(
                "{} calibrated, {} skipped{}; calibration at {}",
                summary.calibrated.len(),
                summary.skipped.len(),
                if summary.cancelled { ", cancelled" } else { "" },
                config.calibration.path.display()
            );
            Ok(())
        }
        Commands::Optimize { hint, trace } => {
            let engine = sweep_engine(config, instruments).await?;
            let result = engine.optimize(*hint).await?;
            print_trace(&result);
            if let Some(path) = trace {
                let json = serde_json::to_string_pretty(&result)?;
                tokio::fs::write(path, json)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(path = %path.display(), "Sweep trace written");
            }
            Ok(())
        }
        Commands::Status => {
            let stage = instruments.stage().stage();
            stage.query_state().await?;
            stage.position().await?;
            let laser = instruments.laser().driver();
            laser.query_state().await?;
            laser.dsm_position().await?;
            laser.dsm_bounds().await?;
            if let Err(e) = laser.read_diagnostics().await {
                warn!("Diagnostics unavailable: {}", e);
            }
            println!("{}", serde_json::to_string_pretty(&instruments.status())?);
            Ok(())
        }
        Commands::Move { position } => {
            let outcome = instruments.stage().stage().move_absolute(*position).await;
            println!("{}", outcome.message);
            outcome.into_result().map(|_| ())
        }
        Commands::Tune { wavelength } => {
            let outcome = instruments.laser().driver().set_wavelength(*wavelength).await;
            println!("{}", outcome.message);
            outcome.into_result().map(|_| ())
        }
        Commands::Faults => {
            let laser = instruments.laser().driver();
            match laser.check_errors().await {
                Ok(word) => println!("No active fault ({})", word.run_state()),
                Err(fault) => println!("Active fault: {fault}"),
            }
            for record in laser.read_fault_history().await? {
                println!("{record}");
            }
            Ok(())
        }
        Commands::Ports => list_ports(),
    }
}

/// Engine with Ctrl-C wired to cooperative cancellation.
async fn sweep_engine(config: &AppConfig, instruments: &Instruments) -> Result<Arc<CalibrationEngine>> {
    let engine = Arc::new(instruments.engine(config).await?);
    let watcher = Arc::downgrade(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Some(engine) = watcher.upgrade() {
                engine.cancel();
            }
        }
    });
    Ok(engine)
}

fn print_trace(trace: &SweepTrace) {
    let peak = trace
        .peak_magnitude()
        .map_or_else(|| "-".to_string(), |m| format!("{m:.3e}"));
    println!(
        "{} nm: time zero at {:.6} mm (seed {:?} {:.6}, peak {} V)",
        trace.wavelength_nm, trace.best_position, trace.seed, trace.hint, peak
    );
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => println!(
                "{}  USB {:04x}:{:04x} {}",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}
