//! Persistent storage
//!
//! SQLite-backed store for devices, metrics, alerts, scan history, and
//! configuration. One connection behind a mutex: concurrent reads are safe,
//! writers serialize per process.

mod admin;
mod alerts;
mod devices;
mod metrics;
mod schema;

pub use admin::CleanupReport;
pub use metrics::AggregatePeriod;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Settings;

/// Store handle. Cheap to clone; all clones share one connection.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path).context("Failed to open database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };
        store.initialize()?;

        Ok(store)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        };
        store.initialize()?;

        Ok(store)
    }

    /// Default database path for the application.
    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("lanpulse").join("telemetry.db")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn initialize(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON")
                .context("Failed to enable foreign keys")?;
            schema::create_tables(conn)?;
            schema::seed_configuration(conn, &Settings::seed_entries())?;
            Ok(())
        })
    }

    /// Run a closure against the locked connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))?;
        f(&conn)
    }
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            path: self.path.clone(),
        }
    }
}

/// Timestamp column encoding used across all tables.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn decode_ts_column(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn decode_ts_opt_column(
    raw: Option<String>,
    column: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| decode_ts_column(s, column)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store() {
        let store = Store::in_memory().expect("Failed to create in-memory store");
        assert_eq!(store.path().to_str(), Some(":memory:"));
    }

    #[test]
    fn test_default_path() {
        let path = Store::default_path();
        assert!(path.to_str().unwrap().contains("lanpulse"));
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let decoded = decode_ts_column(encode_ts(now), 0).unwrap();
        assert_eq!(decoded, now);
    }
}
