//! Results database.
//!
//! The coordinator hands every found value to a [`ResultSink`]. The SQLite
//! implementation keeps one row per reporting client, one per search label,
//! and appends a result row per match.

pub mod queries;

use crate::error::{KeypoolError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

/// Timeout for the SQLite busy handler (in seconds).
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

/// One found value, as handed to the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    /// Coordinator session that reported the value.
    pub client_id: u64,
    pub ip: String,
    pub hostname: String,
    /// Search label (or path) the value belongs to.
    pub label: String,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    pub value_hex: String,
}

/// Destination for found values.
///
/// Failures are reported to the caller, which logs and carries on; a sink
/// error never stops a run.
pub trait ResultSink {
    fn record_result(&mut self, record: &ResultRecord) -> Result<()>;
}

/// Sink that discards everything, used when no database is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn record_result(&mut self, _record: &ResultRecord) -> Result<()> {
        Ok(())
    }
}

/// Database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(KeypoolError::InvalidPath(format!(
                "'{}' is a directory, not a file. Expected a path like '{}/results.db'",
                path.display(),
                path.display().to_string().trim_end_matches('/')
            )));
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS))?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            "#,
        )?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS clients (
                id INTEGER PRIMARY KEY,
                ip_address TEXT NOT NULL,
                hostname TEXT NOT NULL,
                UNIQUE(ip_address, hostname)
            );

            CREATE TABLE IF NOT EXISTS labels (
                id INTEGER PRIMARY KEY,
                client_id INTEGER NOT NULL,
                label TEXT NOT NULL,
                FOREIGN KEY(client_id) REFERENCES clients(id) ON DELETE CASCADE,
                UNIQUE(client_id, label)
            );

            CREATE TABLE IF NOT EXISTS results (
                id INTEGER PRIMARY KEY,
                label_id INTEGER NOT NULL,
                session_id INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                value_hex TEXT NOT NULL,
                FOREIGN KEY(label_id) REFERENCES labels(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_results_timestamp ON results(timestamp DESC);
            "#,
        )?;

        if self.get_meta("schema_version")?.is_none() {
            self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?;
        }
        Ok(())
    }

    /// Get a metadata value.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a metadata value.
    #[instrument(skip(self, value))]
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            [key, value],
        )?;
        Ok(())
    }

    /// Store a found value in a single transaction.
    #[instrument(level = "debug", skip(self, record), fields(client = record.client_id))]
    pub fn insert_result(&mut self, record: &ResultRecord) -> Result<i64> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO clients (ip_address, hostname) VALUES (?1, ?2)",
            params![record.ip, record.hostname],
        )?;
        let client_id: i64 = tx.query_row(
            "SELECT id FROM clients WHERE ip_address = ?1 AND hostname = ?2",
            params![record.ip, record.hostname],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT OR IGNORE INTO labels (client_id, label) VALUES (?1, ?2)",
            params![client_id, record.label],
        )?;
        let label_id: i64 = tx.query_row(
            "SELECT id FROM labels WHERE client_id = ?1 AND label = ?2",
            params![client_id, record.label],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO results (label_id, session_id, timestamp, value_hex) VALUES (?1, ?2, ?3, ?4)",
            params![
                label_id,
                record.client_id as i64,
                record.timestamp,
                record.value_hex
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }
}

impl ResultSink for Database {
    fn record_result(&mut self, record: &ResultRecord) -> Result<()> {
        self.insert_result(record).map(|_| ())
    }
}
