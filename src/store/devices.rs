//! Device CRUD

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Row, params};

use super::{Store, decode_ts_column, encode_ts};
use crate::models::{Device, DeviceStatus};

const DEVICE_COLUMNS: &str = "id, ip, hostname, description, location, contact, community, \
                              status, first_seen, last_seen";

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let status_raw: String = row.get(7)?;
    let status = status_raw.parse().unwrap_or_else(|_| {
        tracing::warn!("Unknown device status in database: {}", status_raw);
        DeviceStatus::Unknown
    });

    Ok(Device {
        id: row.get(0)?,
        ip: row.get(1)?,
        hostname: row.get(2)?,
        description: row.get(3)?,
        location: row.get(4)?,
        contact: row.get(5)?,
        community: row.get(6)?,
        status,
        first_seen: decode_ts_column(row.get::<_, String>(8)?, 8)?,
        last_seen: decode_ts_column(row.get::<_, String>(9)?, 9)?,
    })
}

impl Store {
    /// Insert or replace by id. `last_seen` is bumped to now; an existing
    /// row keeps its `first_seen`.
    pub fn upsert_device(&self, device: &Device) -> Result<()> {
        let now = encode_ts(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO devices (
                    id, ip, hostname, description, location, contact, community,
                    status, first_seen, last_seen
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    ip = excluded.ip,
                    hostname = excluded.hostname,
                    description = excluded.description,
                    location = excluded.location,
                    contact = excluded.contact,
                    community = excluded.community,
                    status = excluded.status,
                    last_seen = excluded.last_seen
                "#,
                params![
                    device.id,
                    device.ip,
                    device.hostname,
                    device.description,
                    device.location,
                    device.contact,
                    device.community,
                    device.status.to_string(),
                    encode_ts(device.first_seen),
                    now,
                ],
            )
            .with_context(|| format!("Failed to upsert device {}", device.id))?;
            Ok(())
        })
    }

    pub fn get_device(&self, id: &str) -> Result<Option<Device>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id],
                device_from_row,
            );
            match result {
                Ok(device) => Ok(Some(device)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_device_by_ip(&self, ip: &str) -> Result<Option<Device>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                &format!("SELECT {} FROM devices WHERE ip = ?1", DEVICE_COLUMNS),
                params![ip],
                device_from_row,
            );
            match result {
                Ok(device) => Ok(Some(device)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM devices ORDER BY last_seen DESC",
                DEVICE_COLUMNS
            ))?;
            let devices = stmt
                .query_map([], device_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(devices)
        })
    }

    /// Delete a device; metrics, system info, interfaces, and alerts cascade.
    pub fn delete_device(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute("DELETE FROM devices WHERE id = ?1", params![id])
                .with_context(|| format!("Failed to delete device {}", id))?;
            Ok(affected > 0)
        })
    }

    /// Set only the status column, bumping `last_seen` when the device is
    /// reachable.
    pub fn update_device_status(&self, id: &str, status: DeviceStatus) -> Result<bool> {
        let bump_last_seen = !matches!(status, DeviceStatus::Offline | DeviceStatus::Unknown);
        self.with_conn(|conn| {
            let affected = if bump_last_seen {
                conn.execute(
                    "UPDATE devices SET status = ?2, last_seen = ?3 WHERE id = ?1",
                    params![id, status.to_string(), encode_ts(Utc::now())],
                )
            } else {
                conn.execute(
                    "UPDATE devices SET status = ?2 WHERE id = ?1",
                    params![id, status.to_string()],
                )
            }
            .with_context(|| format!("Failed to update status for device {}", id))?;
            Ok(affected > 0)
        })
    }
}
