//! CLI Entry Point for enose-capture
//!
//! Provides a command-line front end for:
//! - Listing serial ports
//! - Running a capture session until Ctrl+C or the configured duration
//!
//! # Usage
//!
//! List ports:
//! ```bash
//! enose-capture ports
//! ```
//!
//! Capture acetone on two boards for ten minutes:
//! ```bash
//! enose-capture capture --stage testing --substance acetone \
//!     --port B1=/dev/ttyUSB0 --port LB1=/dev/ttyUSB1 \
//!     --flowrate 1.5 --interval 1 --duration 600
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use enose_capture::board::serial::available_ports;
use enose_capture::config::AppConfig;
use enose_capture::logging;
use enose_capture::{CaptureController, CaptureRequest, Stage};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "enose-capture")]
#[command(about = "Multi-board e-nose serial capture", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/enose.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Capture until Ctrl+C or until --duration has passed since the first reading
    Capture {
        /// Testing, Experiment, Deployment or Baseline
        #[arg(long)]
        stage: Stage,

        /// Substance under test (not used for Baseline)
        #[arg(long)]
        substance: Option<String>,

        /// Board endpoint as BOARD=PORT, repeatable (e.g. B1=/dev/ttyUSB0)
        #[arg(long = "port", value_parser = parse_board_port, required = true)]
        ports: Vec<(String, String)>,

        /// Gas flow rate in L/min
        #[arg(long, default_value_t = 0.0)]
        flowrate: f64,

        /// Seconds between blocks and between rows
        #[arg(long, default_value_t = 1.0)]
        interval: f64,

        /// Stop this many seconds after the first reading
        #[arg(long)]
        duration: Option<f64>,

        /// Remote test id (generated when absent)
        #[arg(long)]
        test_id: Option<String>,

        /// Seconds between status printouts
        #[arg(long, default_value_t = 5.0)]
        status_every: f64,
    },
}

fn parse_board_port(raw: &str) -> Result<(String, String), String> {
    let (board, port) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected BOARD=PORT, got '{raw}'"))?;
    Ok((board.trim().to_string(), port.trim().to_string()))
}

fn seconds(value: f64, name: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| anyhow!("invalid --{name} {value}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Capture {
            stage,
            substance,
            ports,
            flowrate,
            interval,
            duration,
            test_id,
            status_every,
        } => {
            let mut request =
                CaptureRequest::new(stage, substance.as_deref(), flowrate, seconds(interval, "interval")?);
            for (board, port) in &ports {
                request = request.with_port(board, port);
            }
            if let Some(duration) = duration {
                request = request.with_duration(seconds(duration, "duration")?);
            }
            if let Some(test_id) = &test_id {
                request = request.with_test_id(test_id);
            }
            run_capture(config, request, seconds(status_every, "status-every")?).await
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

async fn run_capture(config: AppConfig, request: CaptureRequest, status_every: Duration) -> Result<()> {
    let controller = CaptureController::new(config);
    controller.start_capture(request).await?;
    println!("Capture running - press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(status_every.max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                println!("Stopping...");
                controller.stop_capture().await;
                break;
            }
            _ = ticker.tick() => {
                let snapshot = controller.snapshot();
                print_snapshot(&snapshot.status_lines, snapshot.progress_pct);
                if !snapshot.active {
                    break;
                }
            }
        }
    }

    let snapshot = controller.snapshot();
    print_snapshot(&snapshot.status_lines, snapshot.progress_pct);
    Ok(())
}

fn print_snapshot(lines: &[String], progress_pct: f64) {
    println!("--- {progress_pct:.0}% ---");
    for line in lines {
        println!("  {line}");
    }
}
