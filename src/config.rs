//! Runtime settings for the monitoring engine
//!
//! Layering: compiled defaults, then environment overrides
//! (`LANPULSE_<KEY>`), then values from the store's configuration table.
//! Store values always win once loaded.

use std::collections::BTreeMap;
use std::time::Duration;

/// Worker pool ceiling for per-tick device polls.
pub const MAX_CONCURRENT_POLLS: usize = 16;

/// Delay between scanner batches (congestion avoidance).
pub const SCAN_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Default max in-flight liveness probes per scan.
pub const DEFAULT_SCAN_CONCURRENCY: usize = 50;

/// Per-port connect timeout during port checks.
pub const PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(1000);

/// SNMP retries per query.
pub const SNMP_RETRIES: u32 = 2;

/// SNMP agent port.
pub const SNMP_PORT: u16 = 161;

/// Communities tried, in order, when enriching a discovered host.
pub const DISCOVERY_COMMUNITIES: &[&str] = &["public", "private", "monitoring"];

/// Hour of day (local time) for the daily maintenance job.
pub const MAINTENANCE_HOUR: u32 = 2;

const REFRESH_INTERVAL_RANGE: (u64, u64) = (5, 300);
const SCAN_TIMEOUT_RANGE: (u64, u64) = (1000, 30000);
const SNMP_TIMEOUT_RANGE: (u64, u64) = (1000, 30000);
const HISTORY_DAYS_RANGE: (u32, u32) = (1, 365);

/// Warning/critical percent pair for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPair {
    pub warning: u8,
    pub critical: u8,
}

/// Threshold pairs for the three usage metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub cpu: ThresholdPair,
    pub memory: ThresholdPair,
    pub disk: ThresholdPair,
}

/// Engine settings backed by the §6-style key/value table.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub refresh_interval_secs: u64,
    pub default_community: String,
    pub scan_timeout_ms: u64,
    pub snmp_timeout_ms: u64,
    pub max_history_days: u32,
    pub thresholds: Thresholds,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 10,
            default_community: "public".to_string(),
            scan_timeout_ms: 3000,
            snmp_timeout_ms: 5000,
            max_history_days: 30,
            thresholds: Thresholds {
                cpu: ThresholdPair {
                    warning: 75,
                    critical: 90,
                },
                memory: ThresholdPair {
                    warning: 80,
                    critical: 95,
                },
                disk: ThresholdPair {
                    warning: 85,
                    critical: 95,
                },
            },
        }
    }
}

/// All recognized configuration keys.
pub const CONFIG_KEYS: &[&str] = &[
    "refresh_interval",
    "default_community",
    "scan_timeout",
    "snmp_timeout",
    "max_history_days",
    "cpu_warning_threshold",
    "cpu_critical_threshold",
    "memory_warning_threshold",
    "memory_critical_threshold",
    "disk_warning_threshold",
    "disk_critical_threshold",
];

impl Settings {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        for key in CONFIG_KEYS {
            let env_key = format!("LANPULSE_{}", key.to_uppercase());
            if let Ok(value) = std::env::var(&env_key)
                && let Err(reason) = settings.apply(key, &value)
            {
                tracing::warn!("Ignoring {}={}: {}", env_key, value, reason);
            }
        }
        settings
    }

    /// Seed rows for a freshly created configuration table.
    pub fn seed_entries() -> Vec<(&'static str, String, &'static str)> {
        let defaults = Settings::default();
        vec![
            (
                "refresh_interval",
                defaults.refresh_interval_secs.to_string(),
                "Seconds between polling ticks",
            ),
            (
                "default_community",
                defaults.default_community.clone(),
                "Fallback SNMP community",
            ),
            (
                "scan_timeout",
                defaults.scan_timeout_ms.to_string(),
                "Milliseconds per liveness probe",
            ),
            (
                "snmp_timeout",
                defaults.snmp_timeout_ms.to_string(),
                "Milliseconds per SNMP query",
            ),
            (
                "max_history_days",
                defaults.max_history_days.to_string(),
                "Retention for metrics and system info",
            ),
            (
                "cpu_warning_threshold",
                defaults.thresholds.cpu.warning.to_string(),
                "CPU usage warning percent",
            ),
            (
                "cpu_critical_threshold",
                defaults.thresholds.cpu.critical.to_string(),
                "CPU usage critical percent",
            ),
            (
                "memory_warning_threshold",
                defaults.thresholds.memory.warning.to_string(),
                "Memory usage warning percent",
            ),
            (
                "memory_critical_threshold",
                defaults.thresholds.memory.critical.to_string(),
                "Memory usage critical percent",
            ),
            (
                "disk_warning_threshold",
                defaults.thresholds.disk.warning.to_string(),
                "Disk usage warning percent",
            ),
            (
                "disk_critical_threshold",
                defaults.thresholds.disk.critical.to_string(),
                "Disk usage critical percent",
            ),
        ]
    }

    /// Apply one key/value pair, clamping numeric values into their ranges.
    ///
    /// A threshold write that would break `warning < critical` for its metric
    /// is rejected and the prior value stays in place.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "refresh_interval" => {
                self.refresh_interval_secs = parse_clamped(value, REFRESH_INTERVAL_RANGE)?;
            }
            "default_community" => {
                if value.is_empty() {
                    return Err("community must not be empty".to_string());
                }
                self.default_community = value.to_string();
            }
            "scan_timeout" => {
                self.scan_timeout_ms = parse_clamped(value, SCAN_TIMEOUT_RANGE)?;
            }
            "snmp_timeout" => {
                self.snmp_timeout_ms = parse_clamped(value, SNMP_TIMEOUT_RANGE)?;
            }
            "max_history_days" => {
                self.max_history_days = parse_clamped(value, HISTORY_DAYS_RANGE)?;
            }
            "cpu_warning_threshold" => {
                set_warning(&mut self.thresholds.cpu, value)?;
            }
            "cpu_critical_threshold" => {
                set_critical(&mut self.thresholds.cpu, value)?;
            }
            "memory_warning_threshold" => {
                set_warning(&mut self.thresholds.memory, value)?;
            }
            "memory_critical_threshold" => {
                set_critical(&mut self.thresholds.memory, value)?;
            }
            "disk_warning_threshold" => {
                set_warning(&mut self.thresholds.disk, value)?;
            }
            "disk_critical_threshold" => {
                set_critical(&mut self.thresholds.disk, value)?;
            }
            _ => return Err(format!("unrecognized configuration key: {}", key)),
        }
        Ok(())
    }

    /// Apply a full key/value map, logging and skipping invalid entries.
    pub fn apply_all(&mut self, entries: &BTreeMap<String, String>) {
        for (key, value) in entries {
            if let Err(reason) = self.apply(key, value) {
                tracing::warn!("Ignoring configuration {}={}: {}", key, value, reason);
            }
        }
    }

    /// Current values as the key/value map the control surface returns.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(
            "refresh_interval".to_string(),
            self.refresh_interval_secs.to_string(),
        );
        map.insert(
            "default_community".to_string(),
            self.default_community.clone(),
        );
        map.insert("scan_timeout".to_string(), self.scan_timeout_ms.to_string());
        map.insert("snmp_timeout".to_string(), self.snmp_timeout_ms.to_string());
        map.insert(
            "max_history_days".to_string(),
            self.max_history_days.to_string(),
        );
        map.insert(
            "cpu_warning_threshold".to_string(),
            self.thresholds.cpu.warning.to_string(),
        );
        map.insert(
            "cpu_critical_threshold".to_string(),
            self.thresholds.cpu.critical.to_string(),
        );
        map.insert(
            "memory_warning_threshold".to_string(),
            self.thresholds.memory.warning.to_string(),
        );
        map.insert(
            "memory_critical_threshold".to_string(),
            self.thresholds.memory.critical.to_string(),
        );
        map.insert(
            "disk_warning_threshold".to_string(),
            self.thresholds.disk.warning.to_string(),
        );
        map.insert(
            "disk_critical_threshold".to_string(),
            self.thresholds.disk.critical.to_string(),
        );
        map
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn snmp_timeout(&self) -> Duration {
        Duration::from_millis(self.snmp_timeout_ms)
    }
}

fn parse_clamped<T>(value: &str, range: (T, T)) -> Result<T, String>
where
    T: std::str::FromStr + Ord + Copy,
{
    let parsed: T = value
        .parse()
        .map_err(|_| format!("not a valid number: {}", value))?;
    Ok(parsed.clamp(range.0, range.1))
}

fn parse_percent(value: &str) -> Result<u8, String> {
    let parsed: u8 = value
        .parse()
        .map_err(|_| format!("not a valid percent: {}", value))?;
    Ok(parsed.clamp(1, 100))
}

fn set_warning(pair: &mut ThresholdPair, value: &str) -> Result<(), String> {
    let warning = parse_percent(value)?;
    if warning >= pair.critical {
        return Err(format!(
            "warning {} must stay below critical {}",
            warning, pair.critical
        ));
    }
    pair.warning = warning;
    Ok(())
}

fn set_critical(pair: &mut ThresholdPair, value: &str) -> Result<(), String> {
    let critical = parse_percent(value)?;
    if critical <= pair.warning {
        return Err(format!(
            "critical {} must stay above warning {}",
            critical, pair.warning
        ));
    }
    pair.critical = critical;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_key_table() {
        let settings = Settings::default();
        assert_eq!(settings.refresh_interval_secs, 10);
        assert_eq!(settings.default_community, "public");
        assert_eq!(settings.thresholds.cpu.warning, 75);
        assert_eq!(settings.thresholds.cpu.critical, 90);
        assert_eq!(settings.thresholds.disk.warning, 85);
    }

    #[test]
    fn test_refresh_interval_is_clamped() {
        let mut settings = Settings::default();
        settings.apply("refresh_interval", "1").unwrap();
        assert_eq!(settings.refresh_interval_secs, 5);
        settings.apply("refresh_interval", "9999").unwrap();
        assert_eq!(settings.refresh_interval_secs, 300);
    }

    #[test]
    fn test_threshold_inversion_keeps_prior_value() {
        let mut settings = Settings::default();
        // 95 >= critical 90, must be rejected
        assert!(settings.apply("cpu_warning_threshold", "95").is_err());
        assert_eq!(settings.thresholds.cpu.warning, 75);

        // lowering critical below warning is also rejected
        assert!(settings.apply("cpu_critical_threshold", "50").is_err());
        assert_eq!(settings.thresholds.cpu.critical, 90);
    }

    #[test]
    fn test_apply_all_skips_bad_entries() {
        let mut settings = Settings::default();
        let mut map = BTreeMap::new();
        map.insert("refresh_interval".to_string(), "60".to_string());
        map.insert("cpu_warning_threshold".to_string(), "bogus".to_string());
        settings.apply_all(&map);
        assert_eq!(settings.refresh_interval_secs, 60);
        assert_eq!(settings.thresholds.cpu.warning, 75);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut settings = Settings::default();
        assert!(settings.apply("no_such_key", "1").is_err());
    }

    #[test]
    fn test_map_round_trip() {
        let settings = Settings::default();
        let mut other = Settings::default();
        other.apply("refresh_interval", "120").unwrap();
        other.apply_all(&settings.to_map());
        assert_eq!(other, settings);
    }

    #[test]
    fn test_seed_entries_cover_all_keys() {
        let seeds = Settings::seed_entries();
        assert_eq!(seeds.len(), CONFIG_KEYS.len());
        for key in CONFIG_KEYS {
            assert!(seeds.iter().any(|(k, _, _)| k == key), "missing {}", key);
        }
    }
}
