//! slot-send - Background daemon for thread publishing
//!
//! Polls the job queue and publishes every thread whose job is due.

use anyhow::Context;
use clap::Parser;
use libslotline::logging::LoggingConfig;
use libslotline::platforms::x::XPlatform;
use libslotline::storage::SupabaseStorage;
use libslotline::{Config, Database, Scheduler, SlotlineError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "slot-send")]
#[command(version)]
#[command(about = "Background daemon that publishes due threads")]
#[command(long_about = "\
slot-send - Background daemon that publishes due threads

DESCRIPTION:
    slot-send is a long-running daemon that polls the Slotline job queue.
    Each tick it claims up to --batch-size due jobs, refreshes the X
    credential when it is about to expire, uploads the thread's media
    and posts its items as a reply chain.

    Several instances may run against the same database: a job is only
    ever claimed by one of them.

USAGE:
    # Run in foreground (logs to stderr)
    slot-send

    # Poll every 15 seconds, five jobs at a time
    slot-send --poll-interval 15 --batch-size 5

    # Process due jobs once and exit (cron style)
    slot-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current tick)

CONFIGURATION:
    Configuration file: ~/.config/slotline/config.toml

    [scheduler]
    poll_interval_secs = 60
    batch_size = 5

    Override with environment variables:
        SLOTLINE_CONFIG      - Path to config file
        SLOTLINE_DB_PATH     - Path to database file
        SLOTLINE_LOG_FORMAT  - text, json or pretty
        SLOTLINE_LOG_LEVEL   - tracing filter (e.g. debug)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Maximum jobs claimed per tick (overrides config)
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process due jobs once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

/// 2 for configuration problems, 1 for everything else
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SlotlineError>() {
        Some(SlotlineError::Config(_)) => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let scheduler = build_scheduler(&config, cli.batch_size).await?;

    info!("slot-send daemon starting");

    if cli.once {
        let summary = scheduler.tick(chrono::Utc::now().timestamp()).await?;
        info!(
            claimed = summary.claimed,
            published = summary.published,
            failed = summary.failed,
            "processed due jobs once, exiting"
        );
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let poll_interval = cli
        .poll_interval
        .unwrap_or(config.scheduler.poll_interval_secs)
        .max(1);
    info!(poll_interval, "poll interval set");

    run_daemon_loop(&scheduler, poll_interval, shutdown).await;

    info!("slot-send daemon stopped");
    Ok(())
}

async fn build_scheduler(config: &Config, batch_size: Option<usize>) -> anyhow::Result<Scheduler> {
    let db = Database::new(&config.database.path).await?;
    let platform = XPlatform::new(&config.x)?;
    let storage = SupabaseStorage::new(&config.storage)?;

    let mut scheduler = Scheduler::new(
        Arc::new(db),
        Arc::new(platform),
        Arc::new(storage),
        config,
    );
    if let Some(n) = batch_size {
        anyhow::ensure!(n > 0, "--batch-size must be at least 1");
        scheduler = scheduler.with_batch_size(n);
    }
    Ok(scheduler)
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("signal setup failed")?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

/// Main daemon loop. A failed tick is logged and retried on the next poll.
async fn run_daemon_loop(scheduler: &Scheduler, poll_interval: u64, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        match scheduler.tick(chrono::Utc::now().timestamp()).await {
            Ok(summary) if summary.claimed > 0 || summary.reaped > 0 => {
                info!(
                    reaped = summary.reaped,
                    claimed = summary.claimed,
                    published = summary.published,
                    failed = summary.failed,
                    "tick complete"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "tick failed"),
        }

        // Sleep until next poll (check shutdown every second)
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}
