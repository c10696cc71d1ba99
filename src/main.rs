/// chainmapper - Main entry point
/// Streams pending transactions, tallies senders in SQLite, exports periodic snapshots

use anyhow::{Context, Result};
use dotenvy::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

use chainmapper::ingestor::{self, FeedConfig};
use chainmapper::persistence::{AddressStore, SqliteStore};
use chainmapper::queue::handoff_queue;
use chainmapper::settings::{Config, Mode, SHUTDOWN_GRACE, SHUTDOWN_POLL};
use chainmapper::shutdown::ShutdownFlag;
use chainmapper::snapshot::{self, SnapshotConfig};
use chainmapper::consumer;

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cfg = Config::from_env()?;
    init_logging(cfg.mode);

    cfg.ensure_data_dirs()?;
    let store: Arc<dyn AddressStore> = Arc::new(SqliteStore::open(&cfg.db_path)?);
    info!("[main] Database ready at {}", cfg.db_path.display());

    let shutdown = ShutdownFlag::new();
    let (queue_tx, queue_rx) = handoff_queue::<String>(cfg.queue_capacity);
    match cfg.queue_capacity {
        Some(cap) => info!("[main] Handoff queue bounded at {} items", cap),
        None => info!("[main] Handoff queue unbounded"),
    }

    let consumer = consumer::spawn(queue_rx, Arc::clone(&store), shutdown.clone())?;
    let (ingestor, stats) = ingestor::spawn(FeedConfig::new(&cfg.wss_url), queue_tx, shutdown.clone())?;
    let scheduler = snapshot::spawn(
        Arc::clone(&store),
        SnapshotConfig::new(cfg.export_enabled, cfg.export_interval, &cfg.export_path),
        shutdown.clone(),
    )?;
    if cfg.export_enabled {
        info!(
            "[main] Snapshot export every {}s to {}",
            cfg.export_interval.as_secs(),
            cfg.export_path.display()
        );
    } else {
        info!("[main] Snapshot export disabled (set IS_EXPORT=true to enable)");
    }

    info!("[main] Streaming from {}", cfg.wss_url);
    let signals = tokio::spawn(watch_signals(shutdown.clone()));
    info!("[main] Running. Press CTRL+C to shut down");

    // (1) a signal or any worker's fatal error sets the flag
    let mut poll = tokio::time::interval(SHUTDOWN_POLL);
    while !shutdown.is_set() {
        poll.tick().await;
    }

    // (2) let in-flight operations reach their next check point
    info!("[main] Shutting down...");
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    // (3) cancel leftover background work
    signals.abort();

    // (4) consumer first, then ingestor, then scheduler
    join_worker("consumer", consumer).await;
    join_worker("ingestor", ingestor).await;
    join_worker("snapshot", scheduler).await;

    info!(
        "[main] Stopped. {} transactions received this run",
        stats.received()
    );
    Ok(())
}

// ============================================================================
// Shutdown Plumbing
// ============================================================================

/// Set the shutdown flag on SIGINT/SIGTERM. Later signals only log.
async fn watch_signals(shutdown: ShutdownFlag) {
    loop {
        if let Err(e) = next_signal().await {
            error!("[main] Failed to listen for shutdown signals: {:#}", e);
            shutdown.trigger();
            return;
        }
        if shutdown.trigger() {
            info!("[main] Shutdown signal received");
        } else {
            warn!("[main] Already shutting down, ignoring repeated signal");
        }
    }
}

#[cfg(unix)]
async fn next_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to wait for CTRL+C"),
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Failed to wait for CTRL+C")
}

/// Block (off the async workers) until a worker thread exits. No timeout.
async fn join_worker(name: &'static str, handle: JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => info!("[main] {} stopped", name),
        Ok(Err(_)) => error!("[main] {} thread panicked", name),
        Err(e) => error!("[main] Failed to join {}: {}", name, e),
    }
}

fn init_logging(mode: Mode) {
    // RUST_LOG wins over the mode default
    env_logger::Builder::new()
        .filter_level(mode.log_level())
        .parse_default_env()
        .init();
    if mode == Mode::Development {
        info!("[main] Development mode, verbose logging on");
    }
}
