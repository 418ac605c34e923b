//! Schema definitions
//!
//! Creates tables and indexes on open; seeds default configuration keys.

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

/// Create all tables and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Monitored endpoints; "localhost" is the host-probe device
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            ip TEXT UNIQUE NOT NULL,
            hostname TEXT NOT NULL DEFAULT '',
            description TEXT,
            location TEXT,
            contact TEXT,
            community TEXT NOT NULL DEFAULT 'public',
            status TEXT NOT NULL DEFAULT 'unknown',
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL
        );

        -- Time-series observations, one row per metric per poll
        CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            metric_type TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        -- Per-poll system summary
        CREATE TABLE IF NOT EXISTS system_info (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            uptime_seconds INTEGER NOT NULL DEFAULT 0,
            processes INTEGER NOT NULL DEFAULT 0,
            users INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );

        -- Latest interface snapshot per device
        CREATE TABLE IF NOT EXISTS network_interfaces (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            if_index INTEGER NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            iface_type INTEGER NOT NULL DEFAULT 0,
            speed INTEGER NOT NULL DEFAULT 0,
            admin_status INTEGER NOT NULL DEFAULT 0,
            oper_status INTEGER NOT NULL DEFAULT 0,
            in_octets INTEGER NOT NULL DEFAULT 0,
            out_octets INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );

        -- Alert lifecycle rows; resolved rows are kept for history
        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            device_ip TEXT NOT NULL DEFAULT '',
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            acknowledged INTEGER NOT NULL DEFAULT 0,
            acknowledged_by TEXT,
            acknowledged_at TEXT,
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT,
            metadata TEXT
        );

        -- Audit trail of completed sweeps
        CREATE TABLE IF NOT EXISTS scan_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_range TEXT NOT NULL,
            total_ips INTEGER NOT NULL DEFAULT 0,
            discovered_hosts INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT NOT NULL
        );

        -- Key/value configuration
        CREATE TABLE IF NOT EXISTS configuration (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            description TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_devices_ip ON devices(ip);
        CREATE INDEX IF NOT EXISTS idx_devices_status ON devices(status);
        CREATE INDEX IF NOT EXISTS idx_metrics_device_time ON metrics(device_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_metrics_type_time ON metrics(metric_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_system_info_device ON system_info(device_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_alerts_device_severity ON alerts(device_id, severity);
        CREATE INDEX IF NOT EXISTS idx_alerts_acknowledged ON alerts(acknowledged);
        CREATE INDEX IF NOT EXISTS idx_interfaces_device ON network_interfaces(device_id);
        CREATE INDEX IF NOT EXISTS idx_scan_history_completed ON scan_history(completed_at);
        "#,
    )
    .context("Failed to create database tables")?;

    Ok(())
}

/// Insert default configuration rows that are not present yet.
pub fn seed_configuration(
    conn: &Connection,
    entries: &[(&'static str, String, &'static str)],
) -> Result<()> {
    for (key, value, description) in entries {
        conn.execute(
            "INSERT OR IGNORE INTO configuration (key, value, description) VALUES (?1, ?2, ?3)",
            params![key, value, description],
        )
        .with_context(|| format!("Failed to seed configuration key {}", key))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).expect("Failed to create tables");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for expected in [
            "devices",
            "metrics",
            "system_info",
            "network_interfaces",
            "alerts",
            "scan_history",
            "configuration",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_seed_is_idempotent_and_preserves_overrides() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        seed_configuration(&conn, &Settings::seed_entries()).unwrap();

        conn.execute(
            "UPDATE configuration SET value = '42' WHERE key = 'refresh_interval'",
            [],
        )
        .unwrap();

        // Re-seeding (as on every open) must not clobber operator values.
        seed_configuration(&conn, &Settings::seed_entries()).unwrap();

        let value: String = conn
            .query_row(
                "SELECT value FROM configuration WHERE key = 'refresh_interval'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "42");
    }
}
