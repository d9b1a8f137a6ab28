use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use usagemon::{
    config::Config,
    db::Database,
    monitor::{Monitor, SnapshotStream, SystemClock},
    replay::{self, ReplayWriter},
    sampler::LinuxSampler,
};

/// Records per-user and host-wide resource utilization of this node.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    config: PathBuf,

    /// Verbosity of console logging
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Seconds between process table samples
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Minutes of measurements aggregated into each committed record
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    resolution: u64,

    /// Processes with an effective uid below this are not attributed to a user
    #[arg(long, default_value_t = 1000)]
    min_user_id: u32,

    /// Replay a recorded snapshot stream instead of sampling live
    #[arg(long, conflicts_with = "save_replay")]
    load_replay: Option<PathBuf>,

    /// Record the live snapshot stream for later replay
    #[arg(long)]
    save_replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let config = Config::load(&args.config)?;
    let hostname = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    let mut db = Database::open(&config.database)
        .with_context(|| format!("opening database {}", config.database.display()))?;
    db.init_schema().context("initializing database schema")?;

    let commit_interval = (args.resolution * 60) as f64;
    let mut monitor = Monitor::new(commit_interval, hostname, &config.process_groups)?;

    let mut stream = match &args.load_replay {
        Some(path) => {
            let snapshots = replay::load(path)?;
            info!("Replaying {} snapshots from {}", snapshots.len(), path.display());
            SnapshotStream::replay(snapshots)
        }
        None => {
            let recorder = match &args.save_replay {
                Some(path) => Some(ReplayWriter::create(path)?),
                None => None,
            };
            let sampler = Box::new(LinuxSampler::new(args.min_user_id));
            SnapshotStream::live(sampler, Arc::new(SystemClock), args.interval as f64, recorder)
        }
    };

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current tick");
            stop.cancel();
        }
    });

    info!(
        "Monitoring with a {}s sample interval, committing every {} minutes",
        args.interval, args.resolution
    );
    monitor.run(&mut stream, &mut db, &cancel).await
}
