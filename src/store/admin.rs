//! Scan history, configuration, retention cleanup, and stats

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, params};
use std::collections::BTreeMap;

use super::{Store, decode_ts_column, encode_ts};
use crate::models::{ConfigEntry, ScanRecord, StoreStats};

/// Rows removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CleanupReport {
    pub metrics: usize,
    pub system_info: usize,
    pub interfaces: usize,
    pub alerts: usize,
}

impl Store {
    pub fn append_scan_history(&self, record: &ScanRecord) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scan_history (
                    scan_range, total_ips, discovered_hosts, duration_ms,
                    started_at, completed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.scan_range,
                    record.total_ips,
                    record.discovered_hosts,
                    record.duration_ms as i64,
                    encode_ts(record.started_at),
                    encode_ts(record.completed_at),
                ],
            )
            .context("Failed to append scan history")?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_scan_history(&self, limit: u32) -> Result<Vec<ScanRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, scan_range, total_ips, discovered_hosts, duration_ms,
                        started_at, completed_at
                 FROM scan_history
                 ORDER BY completed_at DESC
                 LIMIT ?1",
            )?;
            let records = stmt
                .query_map(params![limit], |row| {
                    Ok(ScanRecord {
                        id: row.get(0)?,
                        scan_range: row.get(1)?,
                        total_ips: row.get(2)?,
                        discovered_hosts: row.get(3)?,
                        duration_ms: row.get::<_, i64>(4)? as u64,
                        started_at: decode_ts_column(row.get::<_, String>(5)?, 5)?,
                        completed_at: decode_ts_column(row.get::<_, String>(6)?, 6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    pub fn get_config_value(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM configuration WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    pub fn list_config(&self) -> Result<Vec<ConfigEntry>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, value, description FROM configuration ORDER BY key")?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(ConfigEntry {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        description: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Current configuration as a plain key/value map.
    pub fn config_map(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .list_config()?
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect())
    }

    pub fn set_config(&self, key: &str, value: &str, description: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO configuration (key, value, description) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    description = COALESCE(excluded.description, configuration.description)",
                params![key, value, description],
            )
            .with_context(|| format!("Failed to set configuration {}", key))?;
            Ok(())
        })
    }

    /// Retention pass: metrics and system info older than `retention_days`,
    /// interface snapshots older than one day, alerts resolved more than
    /// seven days ago.
    pub fn cleanup(&self, retention_days: u32) -> Result<CleanupReport> {
        let now = Utc::now();
        let metrics_cutoff = encode_ts(now - Duration::days(retention_days as i64));
        let interfaces_cutoff = encode_ts(now - Duration::days(1));
        let alerts_cutoff = encode_ts(now - Duration::days(7));

        self.with_conn(|conn| {
            let metrics = conn
                .execute(
                    "DELETE FROM metrics WHERE timestamp < ?1",
                    params![metrics_cutoff],
                )
                .context("Failed to clean up metrics")?;
            let system_info = conn
                .execute(
                    "DELETE FROM system_info WHERE timestamp < ?1",
                    params![metrics_cutoff],
                )
                .context("Failed to clean up system info")?;
            let interfaces = conn
                .execute(
                    "DELETE FROM network_interfaces WHERE timestamp < ?1",
                    params![interfaces_cutoff],
                )
                .context("Failed to clean up interfaces")?;
            let alerts = conn
                .execute(
                    "DELETE FROM alerts WHERE resolved_at IS NOT NULL AND resolved_at < ?1",
                    params![alerts_cutoff],
                )
                .context("Failed to clean up resolved alerts")?;

            Ok(CleanupReport {
                metrics,
                system_info,
                interfaces,
                alerts,
            })
        })
    }

    /// Row counts per table and the database footprint in bytes.
    pub fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<i64> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .with_context(|| format!("Failed to count rows in {}", table))
            };

            let page_count: u64 =
                conn.query_row("PRAGMA page_count", [], |row| row.get::<_, i64>(0))? as u64;
            let page_size: u64 =
                conn.query_row("PRAGMA page_size", [], |row| row.get::<_, i64>(0))? as u64;

            Ok(StoreStats {
                devices: count("devices")?,
                metrics: count("metrics")?,
                system_info: count("system_info")?,
                network_interfaces: count("network_interfaces")?,
                alerts: count("alerts")?,
                scan_history: count("scan_history")?,
                configuration: count("configuration")?,
                db_size_bytes: page_count * page_size,
            })
        })
    }
}
