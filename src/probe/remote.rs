//! Remote device probe over SNMP v2c
//!
//! Reads the standard system group, host-resources tables, the interface
//! table, and the UCD load/memory objects, then normalizes everything into a
//! [`Sample`]. The five sub-collections of [`SnmpProbe::collect_all`] run
//! concurrently and fail independently.

use anyhow::{Result, anyhow, bail};
use snmp2::{Oid, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;

use super::session::{SessionCache, SessionHandle};
use super::{
    CpuSection, RemoteSampler, Sample, SampleInterface, SystemSection, UsageSection, round_percent,
};
use crate::config::SNMP_RETRIES;

// System group
const OID_SYS_DESCR: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];
const OID_SYS_UPTIME: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 3, 0];
const OID_SYS_CONTACT: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 4, 0];
const OID_SYS_NAME: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 5, 0];
const OID_SYS_LOCATION: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 6, 0];

// Host resources
const OID_HR_NUM_USERS: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 1, 5, 0];
const OID_HR_PROCESSES: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 1, 6, 0];
const OID_HR_MEMORY_SIZE_KB: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 2, 2, 0];
const OID_HR_PROCESSOR_LOAD: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 3, 3, 1, 2];
const OID_HR_STORAGE_ENTRY: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 2, 3, 1];
const HR_STORAGE_DESCR: u64 = 3;
const HR_STORAGE_ALLOC_UNITS: u64 = 4;
const HR_STORAGE_SIZE: u64 = 5;
const HR_STORAGE_USED: u64 = 6;

// Interface table
const OID_IF_ENTRY: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1];
const IF_DESCR: u64 = 2;
const IF_TYPE: u64 = 3;
const IF_SPEED: u64 = 5;
const IF_PHYS_ADDRESS: u64 = 6;
const IF_ADMIN_STATUS: u64 = 7;
const IF_OPER_STATUS: u64 = 8;
const IF_IN_OCTETS: u64 = 10;
const IF_OUT_OCTETS: u64 = 16;

// UCD-SNMP
const OID_UCD_LOAD_1MIN: &[u64] = &[1, 3, 6, 1, 4, 1, 2021, 10, 1, 3, 1];
const OID_UCD_MEM_TOTAL_REAL_KB: &[u64] = &[1, 3, 6, 1, 4, 1, 2021, 4, 5, 0];
const OID_UCD_MEM_AVAIL_REAL_KB: &[u64] = &[1, 3, 6, 1, 4, 1, 2021, 4, 6, 0];

/// Safety bound for table walks against misbehaving agents.
const MAX_WALK_ROWS: usize = 4096;

/// Owned snapshot of an SNMP value, detached from the response buffer.
#[derive(Debug, Clone)]
enum SnmpValue {
    Int(i64),
    Uint(u64),
    Ticks(u32),
    Text(String),
    Bytes(Vec<u8>),
    Other,
}

impl SnmpValue {
    fn from_value(value: &Value<'_>) -> Self {
        match value {
            Value::Integer(v) => SnmpValue::Int(*v),
            Value::Counter32(v) | Value::Unsigned32(v) => SnmpValue::Uint(*v as u64),
            Value::Counter64(v) => SnmpValue::Uint(*v),
            Value::Timeticks(v) => SnmpValue::Ticks(*v),
            Value::OctetString(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => SnmpValue::Text(text.trim().to_string()),
                Err(_) => SnmpValue::Bytes(bytes.to_vec()),
            },
            _ => SnmpValue::Other,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            SnmpValue::Int(v) if *v >= 0 => Some(*v as u64),
            SnmpValue::Uint(v) => Some(*v),
            SnmpValue::Ticks(v) => Some(*v as u64),
            SnmpValue::Text(text) => text.parse().ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            SnmpValue::Int(v) => Some(*v as f64),
            SnmpValue::Uint(v) => Some(*v as f64),
            SnmpValue::Ticks(v) => Some(*v as f64),
            SnmpValue::Text(text) => text.parse().ok(),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            SnmpValue::Text(text) if !text.is_empty() => Some(text.clone()),
            _ => None,
        }
    }

    fn as_mac(&self) -> Option<String> {
        match self {
            SnmpValue::Bytes(bytes) if bytes.len() == 6 => Some(
                bytes
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(":"),
            ),
            _ => None,
        }
    }
}

fn oid_parts(oid: &Oid<'_>) -> Vec<u64> {
    oid.to_string()
        .split('.')
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Probe for remote SNMP devices.
pub struct SnmpProbe {
    cache: Arc<SessionCache>,
    query_timeout_ms: AtomicU64,
}

impl SnmpProbe {
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            cache: Arc::new(SessionCache::new()),
            query_timeout_ms: AtomicU64::new(query_timeout.as_millis() as u64),
        }
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.load(Ordering::Relaxed).max(1))
    }

    async fn session(&self, ip: Ipv4Addr, community: &str) -> Result<SessionHandle> {
        self.cache
            .get_or_open(ip, community, self.query_timeout())
            .await
    }

    /// One GET with retries; retriable failures are timeouts and transport
    /// errors.
    async fn get_value(&self, session: &SessionHandle, oid_parts: &[u64]) -> Result<SnmpValue> {
        let oid =
            Oid::from(oid_parts).map_err(|e| anyhow!("invalid OID {:?}: {:?}", oid_parts, e))?;

        let mut last_error = anyhow!("no attempts made");
        for _attempt in 0..=SNMP_RETRIES {
            let mut session = session.lock().await;
            match timeout(self.query_timeout(), session.get(&oid)).await {
                Ok(Ok(mut pdu)) => {
                    if let Some((_, value)) = pdu.varbinds.next() {
                        let owned = SnmpValue::from_value(&value);
                        if matches!(owned, SnmpValue::Other) {
                            bail!("agent returned no value for {:?}", oid_parts);
                        }
                        return Ok(owned);
                    }
                    bail!("empty varbind list for {:?}", oid_parts);
                }
                Ok(Err(e)) => last_error = anyhow!("snmp error for {:?}: {:?}", oid_parts, e),
                Err(_) => last_error = anyhow!("timeout querying {:?}", oid_parts),
            }
        }
        Err(last_error)
    }

    /// GETNEXT walk of a subtree. Keys are the OID suffix under `prefix`.
    async fn walk(
        &self,
        session: &SessionHandle,
        prefix: &[u64],
    ) -> Result<Vec<(Vec<u64>, SnmpValue)>> {
        let mut rows = Vec::new();
        let mut cursor: Vec<u64> = prefix.to_vec();

        while rows.len() < MAX_WALK_ROWS {
            let oid = Oid::from(cursor.as_slice())
                .map_err(|e| anyhow!("invalid OID {:?}: {:?}", cursor, e))?;

            // The response borrows the session's receive buffer, so the
            // guard stays held until the varbind is copied out.
            let mut session_guard = session.lock().await;
            let mut pdu = match timeout(self.query_timeout(), session_guard.getnext(&oid)).await {
                Ok(Ok(pdu)) => pdu,
                Ok(Err(e)) => bail!("snmp walk error under {:?}: {:?}", prefix, e),
                Err(_) => bail!("timeout walking {:?}", prefix),
            };

            let Some((next_oid, value)) = pdu.varbinds.next() else {
                break;
            };
            let parts = oid_parts(&next_oid);
            if !parts.starts_with(prefix) || parts == cursor {
                break;
            }

            rows.push((parts[prefix.len()..].to_vec(), SnmpValue::from_value(&value)));
            cursor = parts;
        }

        Ok(rows)
    }

    // -- sub-collections ----------------------------------------------------

    async fn collect_system_inner(
        &self,
        ip: Ipv4Addr,
        community: &str,
    ) -> Result<SystemSection> {
        let session = self.session(ip, community).await?;

        let name = self.get_value(&session, OID_SYS_NAME).await?;
        let mut system = SystemSection {
            hostname: name.as_text().unwrap_or_else(|| ip.to_string()),
            ..Default::default()
        };

        if let Ok(descr) = self.get_value(&session, OID_SYS_DESCR).await {
            system.description = descr.as_text().map(truncate_description);
        }
        if let Ok(uptime) = self.get_value(&session, OID_SYS_UPTIME).await {
            // sysUpTime is centiseconds
            system.uptime_seconds = uptime.as_u64().unwrap_or(0) / 100;
        }
        if let Ok(contact) = self.get_value(&session, OID_SYS_CONTACT).await {
            system.contact = contact.as_text();
        }
        if let Ok(location) = self.get_value(&session, OID_SYS_LOCATION).await {
            system.location = location.as_text();
        }
        if let Ok(processes) = self.get_value(&session, OID_HR_PROCESSES).await {
            system.processes = processes.as_u64().unwrap_or(0) as u32;
        }
        if let Ok(users) = self.get_value(&session, OID_HR_NUM_USERS).await {
            system.users = users.as_u64().unwrap_or(0) as u32;
        }
        if let Ok(memory_kb) = self.get_value(&session, OID_HR_MEMORY_SIZE_KB).await {
            system.total_memory_bytes = memory_kb.as_u64().map(|kb| kb * 1024);
        }

        Ok(system)
    }

    async fn collect_cpu(&self, ip: Ipv4Addr, community: &str) -> Result<CpuSection> {
        let session = self.session(ip, community).await?;

        // Preferred: average over the processor load table.
        if let Ok(loads) = self.walk(&session, OID_HR_PROCESSOR_LOAD).await {
            let values: Vec<f64> = loads.iter().filter_map(|(_, v)| v.as_f64()).collect();
            if !values.is_empty() {
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                return Ok(CpuSection {
                    usage_percent: round_percent(avg),
                });
            }
        }

        // Fallback: scaled 1-minute load average.
        let load = self.get_value(&session, OID_UCD_LOAD_1MIN).await?;
        let load = load
            .as_f64()
            .ok_or_else(|| anyhow!("unparseable load average"))?;
        Ok(CpuSection {
            usage_percent: round_percent((load * 10.0).min(100.0)),
        })
    }

    async fn collect_memory(&self, ip: Ipv4Addr, community: &str) -> Result<UsageSection> {
        let session = self.session(ip, community).await?;

        // Preferred: UCD real-memory counters (kilobytes).
        let ucd_total = self.get_value(&session, OID_UCD_MEM_TOTAL_REAL_KB).await;
        let ucd_avail = self.get_value(&session, OID_UCD_MEM_AVAIL_REAL_KB).await;
        if let (Ok(total_kb), Ok(avail_kb)) = (ucd_total, ucd_avail)
            && let (Some(total_kb), Some(avail_kb)) = (total_kb.as_u64(), avail_kb.as_u64())
            && total_kb > 0
        {
            let total = total_kb * 1024;
            let used = total.saturating_sub(avail_kb * 1024);
            return Ok(UsageSection {
                usage_percent: round_percent(used as f64 / total as f64 * 100.0),
                total_bytes: total,
                used_bytes: used,
            });
        }

        // Fallback: a host-resources storage row describing RAM.
        let rows = self.storage_rows(&session).await?;
        for row in rows.values() {
            let Some(descr) = row.descr.as_deref() else {
                continue;
            };
            let descr_lower = descr.to_lowercase();
            if !descr_lower.contains("memory") && !descr_lower.contains("ram") {
                continue;
            }
            let units = row.alloc_units.unwrap_or(1);
            let (Some(size), Some(used)) = (row.size, row.used) else {
                continue;
            };
            let total = size * units;
            if total == 0 {
                continue;
            }
            let used = used * units;
            return Ok(UsageSection {
                usage_percent: round_percent(used as f64 / total as f64 * 100.0),
                total_bytes: total,
                used_bytes: used,
            });
        }

        bail!("no memory objects available")
    }

    async fn collect_disk(&self, ip: Ipv4Addr, community: &str) -> Result<UsageSection> {
        let session = self.session(ip, community).await?;
        let rows = self.storage_rows(&session).await?;

        let mut total: u64 = 0;
        let mut used: u64 = 0;
        for row in rows.values() {
            let Some(descr) = row.descr.as_deref() else {
                continue;
            };
            if !is_disk_storage(descr) {
                continue;
            }
            let units = row.alloc_units.unwrap_or(1);
            total += row.size.unwrap_or(0) * units;
            used += row.used.unwrap_or(0) * units;
        }

        if total == 0 {
            bail!("no disk storage rows available");
        }

        Ok(UsageSection {
            usage_percent: round_percent(used as f64 / total as f64 * 100.0),
            total_bytes: total,
            used_bytes: used,
        })
    }

    async fn collect_interfaces(
        &self,
        ip: Ipv4Addr,
        community: &str,
    ) -> Result<Vec<SampleInterface>> {
        let session = self.session(ip, community).await?;
        let rows = self.walk(&session, OID_IF_ENTRY).await?;
        if rows.is_empty() {
            bail!("empty interface table");
        }

        let mut interfaces: BTreeMap<u64, SampleInterface> = BTreeMap::new();
        for (suffix, value) in rows {
            // suffix = [column, ifIndex]
            let (Some(&column), Some(&row)) = (suffix.first(), suffix.get(1)) else {
                continue;
            };
            let entry = interfaces.entry(row).or_insert_with(|| SampleInterface {
                index: row as i64,
                ..Default::default()
            });

            match column {
                IF_DESCR => {
                    if let Some(text) = value.as_text() {
                        entry.name = text.clone();
                        entry.description = Some(text);
                    }
                }
                IF_TYPE => entry.iface_type = value.as_u64().unwrap_or(0) as i64,
                IF_SPEED => entry.speed = value.as_u64().unwrap_or(0),
                IF_PHYS_ADDRESS => entry.mac = value.as_mac(),
                IF_ADMIN_STATUS => entry.admin_status = value.as_u64().unwrap_or(0) as i64,
                IF_OPER_STATUS => entry.oper_status = value.as_u64().unwrap_or(0) as i64,
                IF_IN_OCTETS => entry.in_octets = value.as_u64().unwrap_or(0),
                IF_OUT_OCTETS => entry.out_octets = value.as_u64().unwrap_or(0),
                _ => {}
            }
        }

        Ok(interfaces
            .into_values()
            .map(|mut iface| {
                if iface.name.is_empty() {
                    iface.name = format!("if{}", iface.index);
                }
                iface
            })
            .collect())
    }

    async fn storage_rows(&self, session: &SessionHandle) -> Result<BTreeMap<u64, StorageRow>> {
        let rows = self.walk(session, OID_HR_STORAGE_ENTRY).await?;
        let mut storage: BTreeMap<u64, StorageRow> = BTreeMap::new();

        for (suffix, value) in rows {
            let (Some(&column), Some(&row)) = (suffix.first(), suffix.get(1)) else {
                continue;
            };
            let entry = storage.entry(row).or_default();
            match column {
                HR_STORAGE_DESCR => entry.descr = value.as_text(),
                HR_STORAGE_ALLOC_UNITS => entry.alloc_units = value.as_u64(),
                HR_STORAGE_SIZE => entry.size = value.as_u64(),
                HR_STORAGE_USED => entry.used = value.as_u64(),
                _ => {}
            }
        }

        Ok(storage)
    }
}

impl RemoteSampler for SnmpProbe {
    async fn collect_all(&self, ip: Ipv4Addr, community: &str) -> Sample {
        let mut sample = Sample::default();

        let (system, cpu, memory, disk, interfaces) = tokio::join!(
            self.collect_system_inner(ip, community),
            self.collect_cpu(ip, community),
            self.collect_memory(ip, community),
            self.collect_disk(ip, community),
            self.collect_interfaces(ip, community),
        );

        match system {
            Ok(section) => sample.system = Some(section),
            Err(e) => sample.record_error("system", e),
        }
        match memory {
            Ok(section) => sample.memory = Some(section),
            Err(e) => sample.record_error("memory", e),
        }
        match disk {
            Ok(section) => sample.disk = Some(section),
            Err(e) => sample.record_error("disk", e),
        }
        match interfaces {
            Ok(list) => sample.interfaces = list,
            Err(e) => sample.record_error("interfaces", e),
        }

        // CPU goes last: its placeholder step depends on whether anything
        // else answered.
        apply_cpu_reading(&mut sample, cpu);

        if !sample.reachable() {
            // Nothing answered; make the next poll start from a clean session.
            self.cache.invalidate(ip, community).await;
        }

        sample
    }

    async fn collect_system(&self, ip: Ipv4Addr, community: &str) -> Result<SystemSection> {
        let result = self.collect_system_inner(ip, community).await;
        if result.is_err() {
            self.cache.invalidate(ip, community).await;
        }
        result
    }

    fn set_query_timeout(&self, timeout: Duration) {
        self.query_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    async fn close(&self) {
        self.cache.clear().await;
    }
}

/// Final step of the CPU ladder. When neither the processor-load table nor
/// the load average answered, an agent that produced any other section still
/// gets a zero placeholder reading next to the recorded failure. A fully
/// silent device keeps `cpu` empty so it counts as unreachable.
fn apply_cpu_reading(sample: &mut Sample, cpu: Result<CpuSection>) {
    match cpu {
        Ok(section) => sample.cpu = Some(section),
        Err(e) => {
            sample.record_error("cpu", e);
            if sample.reachable() {
                sample.cpu = Some(CpuSection { usage_percent: 0 });
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StorageRow {
    descr: Option<String>,
    alloc_units: Option<u64>,
    size: Option<u64>,
    used: Option<u64>,
}

fn is_disk_storage(descr: &str) -> bool {
    let lower = descr.to_lowercase();
    descr.contains('/') || descr.contains("C:") || lower.contains("disk")
}

fn truncate_description(descr: String) -> String {
    if descr.len() > 200 {
        let mut end = 200;
        while !descr.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &descr[..end])
    } else {
        descr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_storage_matching() {
        assert!(is_disk_storage("/"));
        assert!(is_disk_storage("/var/log"));
        assert!(is_disk_storage("C:\\ Label:System"));
        assert!(is_disk_storage("Fixed Disk"));
        assert!(!is_disk_storage("Physical memory"));
        assert!(!is_disk_storage("Swap space"));
    }

    #[test]
    fn test_snmp_value_conversions() {
        assert_eq!(SnmpValue::Int(42).as_u64(), Some(42));
        assert_eq!(SnmpValue::Int(-1).as_u64(), None);
        assert_eq!(SnmpValue::Text("0.52".to_string()).as_f64(), Some(0.52));
        assert_eq!(
            SnmpValue::Bytes(vec![0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]).as_mac(),
            Some("aa:bb:cc:00:11:22".to_string())
        );
        assert_eq!(SnmpValue::Bytes(vec![1, 2]).as_mac(), None);
    }

    #[test]
    fn test_uptime_centisecond_conversion() {
        let ticks = SnmpValue::Ticks(12345);
        assert_eq!(ticks.as_u64().unwrap() / 100, 123);
    }

    #[test]
    fn test_cpu_placeholder_needs_another_section() {
        // a partially answering agent gets the placeholder reading
        let mut partial = Sample {
            memory: Some(UsageSection {
                usage_percent: 40,
                total_bytes: 1024,
                used_bytes: 410,
            }),
            ..Default::default()
        };
        apply_cpu_reading(&mut partial, Err(anyhow!("no load objects")));
        assert_eq!(partial.cpu.map(|cpu| cpu.usage_percent), Some(0));
        assert_eq!(partial.errors.len(), 1);

        // a silent one stays unreachable
        let mut silent = Sample::default();
        silent.record_error("system", "request timed out");
        apply_cpu_reading(&mut silent, Err(anyhow!("no load objects")));
        assert!(silent.cpu.is_none());
        assert!(!silent.reachable());

        // a real reading passes through untouched
        let mut healthy = Sample::default();
        apply_cpu_reading(&mut healthy, Ok(CpuSection { usage_percent: 37 }));
        assert_eq!(healthy.cpu.map(|cpu| cpu.usage_percent), Some(37));
        assert!(healthy.errors.is_empty());
    }

    #[test]
    fn test_description_truncation() {
        let long = "x".repeat(300);
        let truncated = truncate_description(long);
        assert_eq!(truncated.len(), 203);
        assert!(truncated.ends_with("..."));

        let short = truncate_description("Linux host".to_string());
        assert_eq!(short, "Linux host");
    }
}
