use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use sched_energy::{sched_energy, write_report, Config, OutputFormat};

#[derive(Debug, Parser)]
#[command(name = "sched-energy")]
#[command(about = "Attribute energy to the threads of a big.LITTLE scheduler trace")]
#[command(version)]
struct Command {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// JSON-lines event stream
    #[arg(short, long)]
    events: PathBuf,
    /// Thread classification table
    #[arg(short, long)]
    pids: PathBuf,
    /// JSON file with tunables
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Initial core/GPU state as JSON
    #[arg(long, conflicts_with = "sysfs")]
    snapshot: Option<PathBuf>,
    /// Pulled copy of /sys/devices/system/cpu for the initial frequencies
    #[arg(long)]
    sysfs: Option<PathBuf>,
    /// Power model
    #[arg(short, long, default_value = "hikey960")]
    device: String,
    /// Drop events before this timestamp (us)
    #[arg(long)]
    start: Option<u64>,
    /// Drop events after this timestamp (us)
    #[arg(long)]
    end: Option<u64>,
    /// Write the task dependency graph as DOT
    #[arg(short, long)]
    graph: Option<PathBuf>,
    /// Output format: table, json, csv
    #[arg(short, long, default_value = "table")]
    format: OutputFormat,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn build_config(opts: Command) -> Result<Config> {
    let mut config = Config {
        verbosity: opts.verbose,
        events: opts.events,
        pids: opts.pids,
        device: opts.device,
        snapshot: opts.snapshot,
        sysfs: opts.sysfs,
        window_start: opts.start,
        window_end: opts.end,
        graph: opts.graph,
        format: opts.format,
        ..Config::default()
    };
    if let Some(path) = &opts.config {
        config.apply_tunables_file(path)?;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbose);

    let config = build_config(opts)?;
    let summary = sched_energy(&config)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_report(&mut out, &summary, config.format)
}
