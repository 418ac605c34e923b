//! Alert model and lifecycle types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// What a threshold or reachability check fired on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Cpu,
    Memory,
    Disk,
    Network,
    Offline,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::Cpu => write!(f, "cpu"),
            AlertType::Memory => write!(f, "memory"),
            AlertType::Disk => write!(f, "disk"),
            AlertType::Network => write!(f, "network"),
            AlertType::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(AlertType::Cpu),
            "memory" => Ok(AlertType::Memory),
            "disk" => Ok(AlertType::Disk),
            "network" => Ok(AlertType::Network),
            "offline" => Ok(AlertType::Offline),
            _ => Err(format!("Unknown alert type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(AlertSeverity::Warning),
            "critical" => Ok(AlertSeverity::Critical),
            _ => Err(format!("Unknown alert severity: {}", s)),
        }
    }
}

/// An alert through its lifecycle: created, optionally acknowledged, resolved.
///
/// Active means `resolved_at` is unset. `occurrence_count` and
/// `last_occurrence` track dedup hits in memory only; they are not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub device_id: String,
    pub device_ip: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub occurrence_count: u32,
    pub last_occurrence: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Creation request handed to the alert engine.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub device_id: String,
    pub device_ip: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub metadata: Option<Value>,
}

/// Filters accepted by alert listing.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub device_id: Option<String>,
    pub alert_type: Option<AlertType>,
    pub severity: Option<AlertSeverity>,
    pub acknowledged: Option<bool>,
    pub active_only: bool,
}

/// On-demand alert statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStats {
    pub total_active: usize,
    pub by_severity: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
    pub by_device: HashMap<String, usize>,
    pub acknowledged: usize,
    pub unacknowledged: usize,
    pub resolved_last_24h: usize,
}
