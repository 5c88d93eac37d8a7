//! `tessera-sim`: run the chiplet simulator from the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera_config::SimConfig;
use tessera_platform::ChipletPlatform;

#[derive(Parser, Debug)]
#[command(name = "tessera-sim", version, about = "Cycle-level chiplet accelerator simulator")]
struct Args {
    /// JSON configuration file; missing file runs the built-in defaults.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Command graph (overrides the config's `command_file`).
    #[arg(long = "commands")]
    commands: Option<PathBuf>,
    /// Model spec file (overrides the config's `model_file`).
    #[arg(long = "model")]
    model: Option<PathBuf>,
    /// Output directory for logs and CSVs (overrides `bin_dirpath`).
    #[arg(long = "out")]
    out: Option<PathBuf>,
    /// Cycle budget; the run also stops early once the platform is idle.
    #[arg(long = "cycles", default_value_t = 1_000_000)]
    cycles: u64,
    /// Write the per-cycle CSV log (large for long runs).
    #[arg(long = "cycle-log")]
    cycle_log: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => SimConfig::load(path).context("loading configuration")?,
        None => SimConfig::default(),
    };
    if let Some(path) = args.commands {
        cfg.command_file = Some(path);
    }
    if let Some(path) = args.model {
        cfg.model_file = Some(path);
    }
    if let Some(dir) = args.out {
        cfg.bin_dirpath = dir;
    }

    let mut platform = ChipletPlatform::new(cfg).context("initializing platform")?;
    if args.cycle_log {
        platform.enable_cycle_log().context("opening cycle log")?;
    }

    let spent = platform.run_until_idle(args.cycles);
    let totals = *platform.totals();
    platform.write_outputs().context("writing outputs")?;

    info!(
        cycles = spent,
        digital = totals.digital_tasks_executed,
        rram = totals.rram_tasks_executed,
        transfers = totals.transfer_tasks_executed,
        host = totals.host_tasks_executed,
        "run complete"
    );
    println!(
        "simulated {spent} cycles: {} digital / {} rram / {} transfer / {} host tasks, {} transfer bytes",
        totals.digital_tasks_executed,
        totals.rram_tasks_executed,
        totals.transfer_tasks_executed,
        totals.host_tasks_executed,
        totals.total_transfer_bytes,
    );
    if let Some(avg) = totals.avg_wait_cycles() {
        println!("average dispatch wait: {avg:.2} cycles");
    }
    Ok(())
}
