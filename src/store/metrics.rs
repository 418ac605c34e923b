//! Metric, system-info, and interface persistence

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{Row, params};

use super::{Store, decode_ts_column, encode_ts};
use crate::models::{InterfaceRecord, MetricBucket, MetricSample, MetricType, SystemInfoRecord};

/// Bucket width for aggregation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatePeriod {
    Hour,
    Day,
}

impl AggregatePeriod {
    fn strftime_format(&self) -> &'static str {
        match self {
            AggregatePeriod::Hour => "%Y-%m-%d %H:00:00",
            AggregatePeriod::Day => "%Y-%m-%d",
        }
    }
}

impl std::str::FromStr for AggregatePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(AggregatePeriod::Hour),
            "day" => Ok(AggregatePeriod::Day),
            _ => Err(format!("Unknown aggregation period: {}", s)),
        }
    }
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<MetricSample> {
    let type_raw: String = row.get(1)?;
    let unit_raw: String = row.get(3)?;
    Ok(MetricSample {
        device_id: row.get(0)?,
        metric_type: type_raw.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(1, type_raw.clone(), rusqlite::types::Type::Text)
        })?,
        value: row.get(2)?,
        unit: unit_raw.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(3, unit_raw.clone(), rusqlite::types::Type::Text)
        })?,
        timestamp: decode_ts_column(row.get::<_, String>(4)?, 4)?,
    })
}

impl Store {
    pub fn insert_metric(&self, device_id: &str, metric_type: MetricType, value: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO metrics (device_id, metric_type, value, unit, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    device_id,
                    metric_type.to_string(),
                    value,
                    metric_type.unit().to_string(),
                    encode_ts(Utc::now()),
                ],
            )
            .with_context(|| format!("Failed to insert {} for {}", metric_type, device_id))?;
            Ok(())
        })
    }

    /// Batched insert for one device/tick. All-or-nothing.
    pub fn insert_metrics(&self, device_id: &str, samples: &[(MetricType, f64)]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let now = encode_ts(Utc::now());
        self.with_conn(|conn| {
            conn.execute_batch("SAVEPOINT insert_metrics")
                .context("Failed to start insert_metrics transaction")?;

            let insert_result = (|| -> Result<()> {
                let mut stmt = conn.prepare(
                    "INSERT INTO metrics (device_id, metric_type, value, unit, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (metric_type, value) in samples {
                    stmt.execute(params![
                        device_id,
                        metric_type.to_string(),
                        value,
                        metric_type.unit().to_string(),
                        now,
                    ])
                    .with_context(|| {
                        format!("Failed to insert {} for {}", metric_type, device_id)
                    })?;
                }
                Ok(())
            })();

            match insert_result {
                Ok(()) => {
                    conn.execute_batch("RELEASE SAVEPOINT insert_metrics")
                        .context("Failed to commit insert_metrics transaction")?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute_batch(
                        "ROLLBACK TO SAVEPOINT insert_metrics; RELEASE SAVEPOINT insert_metrics",
                    );
                    Err(e)
                }
            }
        })
    }

    /// Most recent row per metric type, optionally narrowed to `types`.
    pub fn latest_metrics(
        &self,
        device_id: &str,
        types: Option<&[MetricType]>,
    ) -> Result<Vec<MetricSample>> {
        let mut samples = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT m.device_id, m.metric_type, m.value, m.unit, m.timestamp
                FROM metrics m
                JOIN (
                    SELECT metric_type, MAX(id) AS latest_id
                    FROM metrics
                    WHERE device_id = ?1
                    GROUP BY metric_type
                ) latest ON m.id = latest.latest_id
                "#,
            )?;
            let samples = stmt
                .query_map(params![device_id], sample_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(samples)
        })?;

        if let Some(wanted) = types {
            samples.retain(|s| wanted.contains(&s.metric_type));
        }
        samples.sort_by_key(|s| s.metric_type.to_string());
        Ok(samples)
    }

    /// History for one metric over the trailing window, ascending.
    pub fn metrics_history(
        &self,
        device_id: &str,
        metric_type: MetricType,
        window_hours: u32,
    ) -> Result<Vec<MetricSample>> {
        let cutoff = encode_ts(Utc::now() - Duration::hours(window_hours as i64));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, metric_type, value, unit, timestamp
                 FROM metrics
                 WHERE device_id = ?1 AND metric_type = ?2 AND timestamp >= ?3
                 ORDER BY timestamp ASC",
            )?;
            let samples = stmt
                .query_map(
                    params![device_id, metric_type.to_string(), cutoff],
                    sample_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(samples)
        })
    }

    /// Bucketed roll-up over the trailing window.
    pub fn metrics_aggregated(
        &self,
        device_id: &str,
        metric_type: MetricType,
        period: AggregatePeriod,
        window_hours: u32,
    ) -> Result<Vec<MetricBucket>> {
        let cutoff = encode_ts(Utc::now() - Duration::hours(window_hours as i64));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT strftime(?4, timestamp) AS bucket,
                        AVG(value), MIN(value), MAX(value), COUNT(*)
                 FROM metrics
                 WHERE device_id = ?1 AND metric_type = ?2 AND timestamp >= ?3
                 GROUP BY bucket
                 ORDER BY bucket ASC",
            )?;
            let buckets = stmt
                .query_map(
                    params![
                        device_id,
                        metric_type.to_string(),
                        cutoff,
                        period.strftime_format()
                    ],
                    |row| {
                        Ok(MetricBucket {
                            bucket: row.get(0)?,
                            avg: row.get(1)?,
                            min: row.get(2)?,
                            max: row.get(3)?,
                            sample_count: row.get(4)?,
                        })
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(buckets)
        })
    }

    /// Devices ranked by their latest value of one metric.
    pub fn top_usage(&self, metric_type: MetricType, limit: u32) -> Result<Vec<(String, f64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT m.device_id, m.value
                FROM metrics m
                JOIN (
                    SELECT device_id, MAX(id) AS latest_id
                    FROM metrics
                    WHERE metric_type = ?1
                    GROUP BY device_id
                ) latest ON m.id = latest.latest_id
                ORDER BY m.value DESC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt
                .query_map(params![metric_type.to_string(), limit], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn insert_system_info(&self, record: &SystemInfoRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO system_info (device_id, uptime_seconds, processes, users, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.device_id,
                    record.uptime_seconds as i64,
                    record.processes,
                    record.users,
                    encode_ts(record.timestamp),
                ],
            )
            .with_context(|| format!("Failed to insert system info for {}", record.device_id))?;
            Ok(())
        })
    }

    /// Atomic delete-then-insert of the interface snapshot.
    pub fn replace_interfaces(&self, device_id: &str, interfaces: &[InterfaceRecord]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("SAVEPOINT replace_interfaces")
                .context("Failed to start replace_interfaces transaction")?;

            let replace_result = (|| -> Result<()> {
                conn.execute(
                    "DELETE FROM network_interfaces WHERE device_id = ?1",
                    params![device_id],
                )?;
                let mut stmt = conn.prepare(
                    "INSERT INTO network_interfaces (
                        device_id, if_index, name, description, iface_type, speed,
                        admin_status, oper_status, in_octets, out_octets, timestamp
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for iface in interfaces {
                    stmt.execute(params![
                        device_id,
                        iface.index,
                        iface.name,
                        iface.description,
                        iface.iface_type,
                        iface.speed as i64,
                        iface.admin_status,
                        iface.oper_status,
                        iface.in_octets as i64,
                        iface.out_octets as i64,
                        encode_ts(iface.timestamp),
                    ])?;
                }
                Ok(())
            })();

            match replace_result {
                Ok(()) => {
                    conn.execute_batch("RELEASE SAVEPOINT replace_interfaces")
                        .context("Failed to commit replace_interfaces transaction")?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute_batch(
                        "ROLLBACK TO SAVEPOINT replace_interfaces; \
                         RELEASE SAVEPOINT replace_interfaces",
                    );
                    Err(e)
                }
            }
        })
    }

    pub fn list_interfaces(&self, device_id: &str) -> Result<Vec<InterfaceRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, if_index, name, description, iface_type, speed,
                        admin_status, oper_status, in_octets, out_octets, timestamp
                 FROM network_interfaces
                 WHERE device_id = ?1
                 ORDER BY if_index ASC",
            )?;
            let interfaces = stmt
                .query_map(params![device_id], |row| {
                    Ok(InterfaceRecord {
                        device_id: row.get(0)?,
                        index: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        iface_type: row.get(4)?,
                        speed: row.get::<_, i64>(5)? as u64,
                        admin_status: row.get(6)?,
                        oper_status: row.get(7)?,
                        in_octets: row.get::<_, i64>(8)? as u64,
                        out_octets: row.get::<_, i64>(9)? as u64,
                        timestamp: decode_ts_column(row.get::<_, String>(10)?, 10)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(interfaces)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Device;

    fn store_with_device(id: &str) -> Store {
        let store = Store::in_memory().unwrap();
        let device = Device::new(
            id.to_string(),
            "192.168.1.10".to_string(),
            "host".to_string(),
            "public".to_string(),
        );
        store.upsert_device(&device).unwrap();
        store
    }

    #[test]
    fn test_batch_insert_and_latest() {
        let store = store_with_device("d");
        store
            .insert_metrics(
                "d",
                &[
                    (MetricType::CpuUsage, 42.0),
                    (MetricType::MemoryUsage, 61.0),
                    (MetricType::MemoryTotal, 8.0 * 1024.0 * 1024.0 * 1024.0),
                ],
            )
            .unwrap();
        store.insert_metric("d", MetricType::CpuUsage, 55.0).unwrap();

        let latest = store.latest_metrics("d", None).unwrap();
        assert_eq!(latest.len(), 3);
        let cpu = latest
            .iter()
            .find(|s| s.metric_type == MetricType::CpuUsage)
            .unwrap();
        assert_eq!(cpu.value, 55.0);
        assert_eq!(cpu.unit, crate::models::MetricUnit::Percent);

        let narrowed = store
            .latest_metrics("d", Some(&[MetricType::MemoryUsage]))
            .unwrap();
        assert_eq!(narrowed.len(), 1);
    }

    #[test]
    fn test_history_is_ascending() {
        let store = store_with_device("d");
        for value in [10.0, 20.0, 30.0] {
            store.insert_metric("d", MetricType::CpuUsage, value).unwrap();
        }
        let history = store.metrics_history("d", MetricType::CpuUsage, 24).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_hour_bucket_aggregation() {
        let store = store_with_device("d");
        for value in [10.0, 20.0, 30.0, 40.0] {
            store.insert_metric("d", MetricType::CpuUsage, value).unwrap();
        }

        let buckets = store
            .metrics_aggregated("d", MetricType::CpuUsage, AggregatePeriod::Hour, 1)
            .unwrap();
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert_eq!(bucket.avg, 25.0);
        assert_eq!(bucket.min, 10.0);
        assert_eq!(bucket.max, 40.0);
        assert_eq!(bucket.sample_count, 4);
    }

    #[test]
    fn test_replace_interfaces_keeps_only_latest_snapshot() {
        let store = store_with_device("d");
        let make = |index: i64, name: &str| InterfaceRecord {
            device_id: "d".to_string(),
            index,
            name: name.to_string(),
            description: None,
            iface_type: 6,
            speed: 1_000_000_000,
            admin_status: 1,
            oper_status: 1,
            in_octets: 100,
            out_octets: 50,
            timestamp: Utc::now(),
        };

        store
            .replace_interfaces("d", &[make(1, "eth0"), make(2, "eth1")])
            .unwrap();
        store.replace_interfaces("d", &[make(1, "eth0")]).unwrap();

        let interfaces = store.list_interfaces("d").unwrap();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].name, "eth0");
    }

    #[test]
    fn test_top_usage_orders_by_latest_value() {
        let store = Store::in_memory().unwrap();
        for (id, ip, cpu) in [("a", "10.0.0.1", 20.0), ("b", "10.0.0.2", 90.0)] {
            let device = Device::new(
                id.to_string(),
                ip.to_string(),
                id.to_string(),
                "public".to_string(),
            );
            store.upsert_device(&device).unwrap();
            store.insert_metric(id, MetricType::CpuUsage, cpu).unwrap();
        }

        let top = store.top_usage(MetricType::CpuUsage, 10).unwrap();
        assert_eq!(top[0].0, "b");
        assert_eq!(top[0].1, 90.0);
    }
}
