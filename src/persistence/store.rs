// store.rs - SQLite persistence implementation
//
// Provides SqliteStore for the per-address tally with:
// - WAL mode for concurrent readers (e.g. address_stats while the pipeline runs)
// - NORMAL synchronous mode for performance
// - One connection behind a mutex shared by the consumer and the snapshot job

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::AddressStore;
use crate::models::AddressRecord;

/// SqliteStore owns the single database connection of the process
///
/// rusqlite's `Connection` is `Send` but not `Sync`, so every statement runs
/// while holding `conn`'s lock.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and create the schema if missing
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open SQLite database {}", db_path.as_ref().display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;"
        ).context("Failed to configure database settings")?;

        let store = SqliteStore { conn: Mutex::new(conn) };
        store.create_if_missing()?;
        Ok(store)
    }

    /// Apply the schema; safe to call repeatedly
    pub fn create_if_missing(&self) -> Result<()> {
        self.lock()?
            .execute_batch(include_str!("schema.sql"))
            .context("Failed to initialize schema")
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
    }

    /// Number of distinct addresses tracked
    pub fn address_count(&self) -> Result<u64> {
        let count: i64 = self.lock()?
            .query_row("SELECT COUNT(*) FROM AddressMapping", [], |row| row.get(0))
            .context("Failed to query address count")?;
        Ok(count as u64)
    }

    /// Look up a single address
    pub fn get(&self, address: &str) -> Result<Option<AddressRecord>> {
        self.lock()?
            .query_row(
                "SELECT address, total_tx_count, last_updated
                 FROM AddressMapping WHERE address = ?1",
                params![address],
                row_to_record,
            )
            .optional()
            .context("Failed to query address")
    }

    /// Ranked read of at most `limit` records (None = all)
    pub fn top(&self, limit: Option<usize>) -> Result<Vec<AddressRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT address, total_tx_count, last_updated
             FROM AddressMapping
             ORDER BY total_tx_count DESC, address ASC
             LIMIT ?1"
        ).context("Failed to prepare ranked scan")?;

        // SQLite treats a negative LIMIT as no limit
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let records = stmt
            .query_map(params![limit], row_to_record)
            .context("Failed to execute ranked scan")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect address records")?;

        Ok(records)
    }

    /// Get current journal mode (for testing)
    pub fn get_journal_mode(&self) -> Result<String> {
        let mode: String = self.lock()?
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .context("Failed to query journal_mode")?;
        Ok(mode)
    }

    /// Get column names for a table (for testing)
    pub fn get_table_columns(&self, table_name: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table_name))
            .context("Failed to prepare table_info query")?;

        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .context("Failed to query columns")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect columns")?;

        Ok(columns)
    }
}

impl AddressStore for SqliteStore {
    /// Insert with count 1 or bump the count, in one statement so concurrent
    /// upserts of the same address can never lose an increment
    fn upsert(&self, address: &str) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.lock()?
            .execute(
                "INSERT INTO AddressMapping (address, total_tx_count, last_updated)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(address) DO UPDATE SET
                     total_tx_count = total_tx_count + 1,
                     last_updated = excluded.last_updated",
                params![address, now_ms],
            )
            .with_context(|| format!("Failed to upsert address {}", address))?;
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<AddressRecord>> {
        self.top(None)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AddressRecord> {
    let count: i64 = row.get(1)?;
    let updated_ms: i64 = row.get(2)?;
    Ok(AddressRecord {
        address: row.get(0)?,
        occurrence_count: count as u64,
        last_updated: DateTime::from_timestamp_millis(updated_ms)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, updated_ms))?,
    })
}
