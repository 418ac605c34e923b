//! Data models for the LAN telemetry collector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel id of the device populated from the host OS instead of SNMP.
pub const LOCALHOST_ID: &str = "localhost";

/// Community marker carried by the host device.
pub const LOCAL_COMMUNITY: &str = "local";

/// Device status derived from the most recent poll and unacknowledged alerts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Unknown,
    Online,
    Warning,
    Critical,
    Offline,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Unknown => write!(f, "unknown"),
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Warning => write!(f, "warning"),
            DeviceStatus::Critical => write!(f, "critical"),
            DeviceStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(DeviceStatus::Unknown),
            "online" => Ok(DeviceStatus::Online),
            "warning" => Ok(DeviceStatus::Warning),
            "critical" => Ok(DeviceStatus::Critical),
            "offline" => Ok(DeviceStatus::Offline),
            _ => Err(format!("Unknown device status: {}", s)),
        }
    }
}

/// A monitored endpoint.
///
/// Exactly one device carries [`LOCALHOST_ID`]; no two devices share an `ip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub ip: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    /// SNMP community, or [`LOCAL_COMMUNITY`] for the host device.
    pub community: String,
    pub status: DeviceStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// Canonical minimal constructor to avoid field drift across call-sites.
    pub fn new(id: String, ip: String, hostname: String, community: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            ip,
            hostname,
            description: None,
            location: None,
            contact: None,
            community,
            status: DeviceStatus::Unknown,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCALHOST_ID
    }
}

/// Metric kinds written on every poll.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CpuUsage,
    MemoryUsage,
    DiskUsage,
    MemoryTotal,
    MemoryUsed,
    DiskTotal,
    DiskUsed,
}

impl MetricType {
    /// All kinds, in write order.
    pub const ALL: [MetricType; 7] = [
        MetricType::CpuUsage,
        MetricType::MemoryUsage,
        MetricType::DiskUsage,
        MetricType::MemoryTotal,
        MetricType::MemoryUsed,
        MetricType::DiskTotal,
        MetricType::DiskUsed,
    ];

    pub fn unit(&self) -> MetricUnit {
        match self {
            MetricType::CpuUsage | MetricType::MemoryUsage | MetricType::DiskUsage => {
                MetricUnit::Percent
            }
            _ => MetricUnit::Bytes,
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricType::CpuUsage => write!(f, "cpu_usage"),
            MetricType::MemoryUsage => write!(f, "memory_usage"),
            MetricType::DiskUsage => write!(f, "disk_usage"),
            MetricType::MemoryTotal => write!(f, "memory_total"),
            MetricType::MemoryUsed => write!(f, "memory_used"),
            MetricType::DiskTotal => write!(f, "disk_total"),
            MetricType::DiskUsed => write!(f, "disk_used"),
        }
    }
}

impl std::str::FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu_usage" => Ok(MetricType::CpuUsage),
            "memory_usage" => Ok(MetricType::MemoryUsage),
            "disk_usage" => Ok(MetricType::DiskUsage),
            "memory_total" => Ok(MetricType::MemoryTotal),
            "memory_used" => Ok(MetricType::MemoryUsed),
            "disk_total" => Ok(MetricType::DiskTotal),
            "disk_used" => Ok(MetricType::DiskUsed),
            _ => Err(format!("Unknown metric type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricUnit {
    Percent,
    Bytes,
}

impl std::fmt::Display for MetricUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricUnit::Percent => write!(f, "percent"),
            MetricUnit::Bytes => write!(f, "bytes"),
        }
    }
}

impl std::str::FromStr for MetricUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percent" => Ok(MetricUnit::Percent),
            "bytes" => Ok(MetricUnit::Bytes),
            _ => Err(format!("Unknown metric unit: {}", s)),
        }
    }
}

/// One metric observation. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub device_id: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: MetricUnit,
    pub timestamp: DateTime<Utc>,
}

/// Per-poll system summary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfoRecord {
    pub device_id: String,
    pub uptime_seconds: u64,
    pub processes: u32,
    pub users: u32,
    pub timestamp: DateTime<Utc>,
}

/// Device interface row. The store retains only the latest snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub device_id: String,
    pub index: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub iface_type: i64,
    pub speed: u64,
    pub admin_status: i64,
    pub oper_status: i64,
    pub in_octets: u64,
    pub out_octets: u64,
    pub timestamp: DateTime<Utc>,
}

/// Audit entry for a completed sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub scan_range: String,
    pub total_ips: u32,
    pub discovered_hosts: u32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Configuration table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Compact per-device view published in each `monitoring_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub ip: String,
    pub hostname: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<u8>,
}

/// Per-table row counts and storage footprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub devices: i64,
    pub metrics: i64,
    pub system_info: i64,
    pub network_interfaces: i64,
    pub alerts: i64,
    pub scan_history: i64,
    pub configuration: i64,
    pub db_size_bytes: u64,
}

/// One bucket of a metrics aggregation query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBucket {
    pub bucket: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub sample_count: i64,
}
