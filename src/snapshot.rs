/// Snapshot scheduler - periodically exports the ranked tally as JSON
///
/// Sleeps in short ticks so shutdown is noticed quickly. No snapshot is forced
/// on shutdown; counts newer than the last export are only in the database.

use anyhow::{Context, Result};
use log::{debug, error, info};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::models::SnapshotEntry;
use crate::persistence::AddressStore;
use crate::settings::{SNAPSHOT_TICK, ensure_parent_dir};
use crate::shutdown::ShutdownFlag;

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub path: PathBuf,
    pub tick: Duration,
}

impl SnapshotConfig {
    pub fn new(enabled: bool, interval: Duration, path: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            interval,
            path: path.into(),
            tick: SNAPSHOT_TICK.min(interval),
        }
    }
}

/// Read the store in ranked order and replace the artifact at `path`.
/// Returns the number of entries written.
pub fn write_snapshot(store: &dyn AddressStore, path: &Path) -> Result<usize> {
    let entries: Vec<SnapshotEntry> = store
        .snapshot()
        .context("Failed to read aggregate store")?
        .iter()
        .map(SnapshotEntry::from)
        .collect();

    ensure_parent_dir(path)?;

    // Write a sibling temp file then rename, so readers never see a partial export
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = std::fs::File::create(&tmp_path)
        .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
    serde_json::to_writer_pretty(&mut file, &entries).context("Failed to serialize snapshot")?;
    file.write_all(b"\n")
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    file.sync_all().context("Failed to sync snapshot file")?;
    drop(file);

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    Ok(entries.len())
}

pub struct SnapshotScheduler {
    store: Arc<dyn AddressStore>,
    config: SnapshotConfig,
    shutdown: ShutdownFlag,
    runs: u64,
}

impl SnapshotScheduler {
    pub fn new(store: Arc<dyn AddressStore>, config: SnapshotConfig, shutdown: ShutdownFlag) -> Self {
        Self { store, config, shutdown, runs: 0 }
    }

    /// Completed exports
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Tick until shutdown, exporting whenever `interval` has accumulated
    pub fn run(&mut self) {
        if !self.config.enabled {
            debug!("[snapshot] Export disabled, idling until shutdown");
        } else {
            info!(
                "[snapshot] Exporting to {} every {:?}",
                self.config.path.display(),
                self.config.interval
            );
        }

        let mut elapsed = Duration::ZERO;
        while !self.shutdown.is_set() {
            std::thread::sleep(self.config.tick);
            if !self.config.enabled || self.shutdown.is_set() {
                continue;
            }

            elapsed += self.config.tick;
            if elapsed < self.config.interval {
                continue;
            }
            elapsed = Duration::ZERO;

            match write_snapshot(self.store.as_ref(), &self.config.path) {
                Ok(count) => {
                    self.runs += 1;
                    info!(
                        "[snapshot] Exported {} addresses to {}",
                        count,
                        self.config.path.display()
                    );
                }
                Err(e) => {
                    error!("[snapshot] Fatal export error: {:#}", e);
                    self.shutdown.trigger();
                    break;
                }
            }
        }
        debug!("[snapshot] Stopped after {} exports", self.runs);
    }
}

/// Run the scheduler on a dedicated thread
pub fn spawn(
    store: Arc<dyn AddressStore>,
    config: SnapshotConfig,
    shutdown: ShutdownFlag,
) -> Result<JoinHandle<()>> {
    let guard = shutdown.panic_guard();
    let mut scheduler = SnapshotScheduler::new(store, config, shutdown);
    std::thread::Builder::new()
        .name("snapshot".into())
        .spawn(move || {
            let _guard = guard;
            scheduler.run();
        })
        .context("Failed to spawn snapshot thread")
}
