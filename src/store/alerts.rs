//! Alert rows
//!
//! The alert engine owns lifecycle decisions; these queries only mirror its
//! state. Inserts fail on a duplicate id rather than replacing, so an
//! acknowledged row can never be clobbered by a re-create.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Row, ToSql, params};

use super::{Store, decode_ts_column, decode_ts_opt_column, encode_ts};
use crate::alerts::{Alert, AlertFilter};

const ALERT_COLUMNS: &str = "id, device_id, device_ip, alert_type, severity, message, \
                             acknowledged, acknowledged_by, acknowledged_at, created_at, \
                             resolved_at, resolved_by, metadata";

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let type_raw: String = row.get(3)?;
    let severity_raw: String = row.get(4)?;
    let metadata_raw: Option<String> = row.get(12)?;
    let created_at = decode_ts_column(row.get::<_, String>(9)?, 9)?;

    Ok(Alert {
        id: row.get(0)?,
        device_id: row.get(1)?,
        device_ip: row.get(2)?,
        alert_type: type_raw.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(3, type_raw.clone(), rusqlite::types::Type::Text)
        })?,
        severity: severity_raw.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(4, severity_raw.clone(), rusqlite::types::Type::Text)
        })?,
        message: row.get(5)?,
        acknowledged: row.get::<_, i64>(6)? != 0,
        acknowledged_by: row.get(7)?,
        acknowledged_at: decode_ts_opt_column(row.get(8)?, 8)?,
        created_at,
        resolved_at: decode_ts_opt_column(row.get(10)?, 10)?,
        resolved_by: row.get(11)?,
        metadata: metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        occurrence_count: 1,
        last_occurrence: created_at,
    })
}

impl Store {
    pub fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let metadata = alert
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m))
            .transpose()
            .context("Failed to serialize alert metadata")?;

        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO alerts (
                    id, device_id, device_ip, alert_type, severity, message,
                    acknowledged, acknowledged_by, acknowledged_at, created_at,
                    resolved_at, resolved_by, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    alert.id,
                    alert.device_id,
                    alert.device_ip,
                    alert.alert_type.to_string(),
                    alert.severity.to_string(),
                    alert.message,
                    alert.acknowledged as i64,
                    alert.acknowledged_by,
                    alert.acknowledged_at.map(encode_ts),
                    encode_ts(alert.created_at),
                    alert.resolved_at.map(encode_ts),
                    alert.resolved_by,
                    metadata,
                ],
            )
            .with_context(|| format!("Failed to insert alert {}", alert.id))?;
            Ok(())
        })
    }

    pub fn ack_alert(&self, id: &str, who: &str, when: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute(
                    "UPDATE alerts SET acknowledged = 1, acknowledged_by = ?2, acknowledged_at = ?3
                     WHERE id = ?1",
                    params![id, who, encode_ts(when)],
                )
                .with_context(|| format!("Failed to acknowledge alert {}", id))?;
            Ok(affected > 0)
        })
    }

    pub fn resolve_alert(
        &self,
        id: &str,
        who: Option<&str>,
        when: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute(
                    "UPDATE alerts SET resolved_at = ?2, resolved_by = ?3 WHERE id = ?1",
                    params![id, encode_ts(when), who],
                )
                .with_context(|| format!("Failed to resolve alert {}", id))?;
            Ok(affected > 0)
        })
    }

    pub fn delete_alert(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn
                .execute("DELETE FROM alerts WHERE id = ?1", params![id])
                .with_context(|| format!("Failed to delete alert {}", id))?;
            Ok(affected > 0)
        })
    }

    pub fn get_alert(&self, id: &str) -> Result<Option<Alert>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
                params![id],
                alert_from_row,
            );
            match result {
                Ok(alert) => Ok(Some(alert)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn list_alerts(&self, filter: &AlertFilter, limit: u32, offset: u32) -> Result<Vec<Alert>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref device_id) = filter.device_id {
            values.push(Box::new(device_id.clone()));
            clauses.push(format!("device_id = ?{}", values.len()));
        }
        if let Some(alert_type) = filter.alert_type {
            values.push(Box::new(alert_type.to_string()));
            clauses.push(format!("alert_type = ?{}", values.len()));
        }
        if let Some(severity) = filter.severity {
            values.push(Box::new(severity.to_string()));
            clauses.push(format!("severity = ?{}", values.len()));
        }
        if let Some(acknowledged) = filter.acknowledged {
            values.push(Box::new(acknowledged as i64));
            clauses.push(format!("acknowledged = ?{}", values.len()));
            if !acknowledged {
                // an unacknowledged listing means alerts still needing
                // attention; resolved history is excluded
                clauses.push("resolved_at IS NULL".to_string());
            }
        }
        if filter.active_only {
            clauses.push("resolved_at IS NULL".to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(Box::new(limit as i64));
        let limit_idx = values.len();
        values.push(Box::new(offset as i64));
        let offset_idx = values.len();

        let sql = format!(
            "SELECT {} FROM alerts {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            ALERT_COLUMNS, where_clause, limit_idx, offset_idx
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let alerts = stmt
                .query_map(params.as_slice(), alert_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(alerts)
        })
    }

    /// Rows the alert engine hydrates its active set from.
    pub fn load_active_alerts(&self) -> Result<Vec<Alert>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM alerts
                 WHERE acknowledged = 0 AND resolved_at IS NULL
                 ORDER BY created_at ASC",
                ALERT_COLUMNS
            ))?;
            let alerts = stmt
                .query_map([], alert_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(alerts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertSeverity, AlertType};
    use crate::models::Device;

    fn store_with_device(id: &str, ip: &str) -> Store {
        let store = Store::in_memory().unwrap();
        let device = Device::new(
            id.to_string(),
            ip.to_string(),
            "host".to_string(),
            "public".to_string(),
        );
        store.upsert_device(&device).unwrap();
        store
    }

    fn sample_alert(id: &str, device_id: &str) -> Alert {
        let now = Utc::now();
        Alert {
            id: id.to_string(),
            device_id: device_id.to_string(),
            device_ip: "192.168.1.10".to_string(),
            alert_type: AlertType::Cpu,
            severity: AlertSeverity::Critical,
            message: "CPU usage 92% exceeds critical threshold (90%)".to_string(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
            occurrence_count: 1,
            last_occurrence: now,
            metadata: None,
        }
    }

    #[test]
    fn test_insert_fails_on_duplicate_id() {
        let store = store_with_device("d", "192.168.1.10");
        let alert = sample_alert("a-1", "d");
        store.insert_alert(&alert).unwrap();
        assert!(store.insert_alert(&alert).is_err());
    }

    #[test]
    fn test_lifecycle_updates() {
        let store = store_with_device("d", "192.168.1.10");
        store.insert_alert(&sample_alert("a-1", "d")).unwrap();

        assert!(store.ack_alert("a-1", "operator", Utc::now()).unwrap());
        let acked = store.get_alert("a-1").unwrap().unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("operator"));

        assert!(store.resolve_alert("a-1", Some("operator"), Utc::now()).unwrap());
        let resolved = store.get_alert("a-1").unwrap().unwrap();
        assert!(resolved.resolved_at.is_some());
        assert!(resolved.created_at <= resolved.resolved_at.unwrap());

        assert!(store.delete_alert("a-1").unwrap());
        assert!(store.get_alert("a-1").unwrap().is_none());
    }

    #[test]
    fn test_list_alerts_filters() {
        let store = store_with_device("d", "192.168.1.10");
        store.insert_alert(&sample_alert("a-1", "d")).unwrap();
        let mut warning = sample_alert("a-2", "d");
        warning.severity = AlertSeverity::Warning;
        warning.alert_type = AlertType::Memory;
        store.insert_alert(&warning).unwrap();

        let all = store.list_alerts(&AlertFilter::default(), 50, 0).unwrap();
        assert_eq!(all.len(), 2);

        let critical_only = store
            .list_alerts(
                &AlertFilter {
                    severity: Some(AlertSeverity::Critical),
                    ..Default::default()
                },
                50,
                0,
            )
            .unwrap();
        assert_eq!(critical_only.len(), 1);
        assert_eq!(critical_only[0].id, "a-1");

        store.resolve_alert("a-1", None, Utc::now()).unwrap();
        let active = store
            .list_alerts(
                &AlertFilter {
                    active_only: true,
                    ..Default::default()
                },
                50,
                0,
            )
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a-2");

        // a resolved alert is not part of the unacknowledged listing
        let unacked = store
            .list_alerts(
                &AlertFilter {
                    acknowledged: Some(false),
                    ..Default::default()
                },
                50,
                0,
            )
            .unwrap();
        assert_eq!(unacked.len(), 1);
        assert_eq!(unacked[0].id, "a-2");
    }

    #[test]
    fn test_load_active_skips_acked_and_resolved() {
        let store = store_with_device("d", "192.168.1.10");
        store.insert_alert(&sample_alert("a-1", "d")).unwrap();
        store.insert_alert(&sample_alert("a-2", "d")).unwrap();
        store.insert_alert(&sample_alert("a-3", "d")).unwrap();

        store.ack_alert("a-2", "op", Utc::now()).unwrap();
        store.resolve_alert("a-3", None, Utc::now()).unwrap();

        let active = store.load_active_alerts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a-1");
    }
}
