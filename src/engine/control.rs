//! Inbound control surface
//!
//! Everything the outer HTTP layer calls lands here as plain methods with
//! typed errors. No transport concerns; the caller maps `CoreError` kinds
//! to its own status codes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::Engine;
use crate::alerts::{Alert, AlertFilter, AlertStats};
use crate::config::CONFIG_KEYS;
use crate::error::{CoreError, CoreResult};
use crate::models::{Device, DeviceStatus, DeviceSummary, MetricBucket, MetricSample, MetricType};
use crate::probe::{HostSampler, RemoteSampler, SystemSection};
use crate::scanner::{
    Liveness, RangeValidation, ScanStatus, check_port_list, check_ports, validate_range,
};
use crate::store::{AggregatePeriod, CleanupReport};

/// Device creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDevice {
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub community: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

/// Partial device update; absent fields stay untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceUpdate {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub community: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

/// One device with its latest metric row per type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOverview {
    pub device: Device,
    pub metrics: Vec<MetricSample>,
}

/// Registry view plus latest usage metrics for live dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSnapshot {
    pub summary: DeviceSummary,
    pub metrics: Vec<MetricSample>,
}

/// Canned range templates offered by the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPreset {
    pub name: &'static str,
    pub range: &'static str,
    pub description: &'static str,
}

/// Liveness summary for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub running: bool,
    pub uptime_seconds: u64,
    pub device_count: usize,
    pub active_alerts: usize,
    pub scan_state: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan_time: Option<chrono::DateTime<Utc>>,
    pub store: crate::models::StoreStats,
}

const SCAN_PRESETS: &[ScanPreset] = &[
    ScanPreset {
        name: "Home /24",
        range: "192.168.1.0/24",
        description: "Typical home network",
    },
    ScanPreset {
        name: "Office /24",
        range: "10.0.0.0/24",
        description: "Typical office segment",
    },
    ScanPreset {
        name: "DMZ span",
        range: "192.168.100.1-50",
        description: "First fifty hosts of the DMZ segment",
    },
];

impl<H, R, P> Engine<H, R, P>
where
    H: HostSampler,
    R: RemoteSampler,
    P: Liveness,
{
    // -- devices ------------------------------------------------------------

    pub async fn list_devices(&self) -> Vec<Device> {
        self.devices_snapshot().await
    }

    pub async fn get_device(&self, id: &str) -> CoreResult<Device> {
        let registry = self.registry.read().await;
        registry
            .values()
            .find(|device| device.id == id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("device {}", id)))
    }

    pub async fn add_device(&self, request: NewDevice) -> CoreResult<Device> {
        let ip: std::net::Ipv4Addr = request
            .ip
            .parse()
            .map_err(|_| CoreError::invalid(format!("not an IPv4 address: {}", request.ip)))?;
        let ip = ip.to_string();

        if self.store.get_device_by_ip(&ip)?.is_some() {
            return Err(CoreError::invalid(format!("device with ip {} already exists", ip)));
        }

        let community = match request.community {
            Some(community) => community,
            None => self.settings.read().await.default_community.clone(),
        };

        let mut device = Device::new(
            Uuid::new_v4().to_string(),
            ip.clone(),
            request.hostname.unwrap_or_else(|| ip.clone()),
            community,
        );
        device.description = request.description;
        device.location = request.location;
        device.contact = request.contact;

        self.store.upsert_device(&device)?;
        self.registry
            .write()
            .await
            .insert(device.ip.clone(), device.clone());

        tracing::info!("Device added: {} ({})", device.hostname, device.ip);
        Ok(device)
    }

    pub async fn update_device(
        &self,
        id: &str,
        update: DeviceUpdate,
    ) -> CoreResult<Device> {
        let mut device = self.get_device(id).await?;

        if let Some(hostname) = update.hostname {
            device.hostname = hostname;
        }
        if let Some(community) = update.community {
            if community.is_empty() {
                return Err(CoreError::invalid("community must not be empty"));
            }
            device.community = community;
        }
        if update.description.is_some() {
            device.description = update.description;
        }
        if update.location.is_some() {
            device.location = update.location;
        }
        if update.contact.is_some() {
            device.contact = update.contact;
        }

        self.store.upsert_device(&device)?;
        self.registry
            .write()
            .await
            .insert(device.ip.clone(), device.clone());
        Ok(device)
    }

    pub async fn delete_device(&self, id: &str) -> CoreResult<()> {
        let device = self.get_device(id).await?;
        if device.is_local() {
            return Err(CoreError::invalid("the localhost device cannot be removed"));
        }

        self.store.delete_device(id)?;
        self.registry.write().await.remove(&device.ip);
        tracing::info!("Device deleted: {} ({})", id, device.ip);
        Ok(())
    }

    /// Connectivity test against an arbitrary address/community pair.
    pub async fn test_device(
        &self,
        ip: &str,
        community: Option<&str>,
    ) -> CoreResult<SystemSection> {
        let ip: std::net::Ipv4Addr = ip
            .parse()
            .map_err(|_| CoreError::invalid(format!("not an IPv4 address: {}", ip)))?;
        let community = match community {
            Some(community) => community.to_string(),
            None => self.settings.read().await.default_community.clone(),
        };

        self.remote_probe
            .collect_system(ip, &community)
            .await
            .map_err(|e| CoreError::unreachable(format!("{} did not answer: {:#}", ip, e)))
    }

    /// Poll one device immediately, outside the tick schedule.
    pub async fn collect_device_now(&self, id: &str) -> CoreResult<DeviceSummary> {
        let device = self.get_device(id).await?;
        let settings = self.settings.read().await.clone();
        Ok(self.poll_device(device, &settings).await)
    }

    // -- metrics ------------------------------------------------------------

    pub async fn metrics_overview(&self) -> CoreResult<Vec<DeviceOverview>> {
        let devices = self.devices_snapshot().await;
        let mut overview = Vec::with_capacity(devices.len());
        for device in devices {
            let metrics = self.store.latest_metrics(&device.id, None)?;
            overview.push(DeviceOverview { device, metrics });
        }
        Ok(overview)
    }

    pub async fn device_metrics(&self, id: &str) -> CoreResult<Vec<MetricSample>> {
        self.get_device(id).await?;
        Ok(self.store.latest_metrics(id, None)?)
    }

    pub async fn metrics_history(
        &self,
        id: &str,
        metric_type: MetricType,
        window_hours: u32,
    ) -> CoreResult<Vec<MetricSample>> {
        self.get_device(id).await?;
        Ok(self.store.metrics_history(id, metric_type, window_hours)?)
    }

    pub async fn metrics_aggregated(
        &self,
        id: &str,
        metric_type: MetricType,
        period: &str,
        window_hours: u32,
    ) -> CoreResult<Vec<MetricBucket>> {
        self.get_device(id).await?;
        let period: AggregatePeriod = period
            .parse()
            .map_err(|e: String| CoreError::invalid(e))?;
        Ok(self
            .store
            .metrics_aggregated(id, metric_type, period, window_hours)?)
    }

    pub fn top_usage(&self, metric_type: MetricType, limit: u32) -> CoreResult<Vec<(String, f64)>> {
        Ok(self.store.top_usage(metric_type, limit)?)
    }

    pub async fn realtime(&self, id: &str) -> CoreResult<RealtimeSnapshot> {
        let device = self.get_device(id).await?;
        let metrics = self.store.latest_metrics(
            id,
            Some(&[
                MetricType::CpuUsage,
                MetricType::MemoryUsage,
                MetricType::DiskUsage,
            ]),
        )?;

        let find = |metric_type: MetricType| {
            metrics
                .iter()
                .find(|sample| sample.metric_type == metric_type)
                .map(|sample| sample.value as u8)
        };

        Ok(RealtimeSnapshot {
            summary: DeviceSummary {
                id: device.id.clone(),
                ip: device.ip.clone(),
                hostname: device.hostname.clone(),
                status: device.status,
                cpu_percent: find(MetricType::CpuUsage),
                memory_percent: find(MetricType::MemoryUsage),
                disk_percent: find(MetricType::DiskUsage),
            },
            metrics,
        })
    }

    // -- alerts -------------------------------------------------------------

    pub fn list_alerts(
        &self,
        filter: &AlertFilter,
        limit: u32,
        offset: u32,
    ) -> CoreResult<Vec<Alert>> {
        Ok(self.store.list_alerts(filter, limit, offset)?)
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    pub fn get_alert(&self, id: &str) -> CoreResult<Alert> {
        if let Some(alert) = self.alerts.get(id) {
            return Ok(alert);
        }
        self.store
            .get_alert(id)?
            .ok_or_else(|| CoreError::not_found(format!("alert {}", id)))
    }

    pub async fn ack_alert(&self, id: &str, who: &str) -> CoreResult<Alert> {
        let alert = self.alerts.acknowledge(id, who)?;
        self.refresh_device_status(&alert.device_id).await;
        Ok(alert)
    }

    pub async fn resolve_alert(&self, id: &str, who: Option<&str>) -> CoreResult<Alert> {
        let alert = self.alerts.resolve(id, who)?;
        self.refresh_device_status(&alert.device_id).await;
        Ok(alert)
    }

    pub fn delete_alert(&self, id: &str) -> CoreResult<()> {
        self.alerts.delete(id)
    }

    /// Bulk acknowledge; returns how many were transitioned.
    pub async fn bulk_ack(&self, ids: &[String], who: &str) -> usize {
        let mut acked = 0;
        for id in ids {
            match self.ack_alert(id, who).await {
                Ok(_) => acked += 1,
                Err(e) => tracing::debug!("Bulk ack skipped {}: {}", id, e),
            }
        }
        acked
    }

    /// Bulk resolve; returns how many were transitioned.
    pub async fn bulk_resolve(&self, ids: &[String], who: Option<&str>) -> usize {
        let mut resolved = 0;
        for id in ids {
            match self.resolve_alert(id, who).await {
                Ok(_) => resolved += 1,
                Err(e) => tracing::debug!("Bulk resolve skipped {}: {}", id, e),
            }
        }
        resolved
    }

    pub fn alert_stats(&self) -> AlertStats {
        self.alerts.stats()
    }

    /// Re-derive and persist one device's status after alert transitions.
    async fn refresh_device_status(&self, device_id: &str) {
        let status = {
            let registry = self.registry.read().await;
            let Some(device) = registry.values().find(|device| device.id == device_id) else {
                return;
            };
            if device.status == DeviceStatus::Offline {
                return;
            }
            self.derived_status(device_id)
        };

        if let Err(e) = self.store.update_device_status(device_id, status) {
            tracing::warn!("Failed to persist status for {}: {:#}", device_id, e);
        }
        let mut registry = self.registry.write().await;
        if let Some(device) = registry.values_mut().find(|device| device.id == device_id) {
            device.status = status;
        }
    }

    // -- scanning -----------------------------------------------------------

    pub fn stop_scan(&self) -> CoreResult<()> {
        self.scanner.stop()
    }

    pub fn scan_status(&self) -> ScanStatus {
        self.scanner.status()
    }

    pub fn scan_history(&self, limit: u32) -> CoreResult<Vec<crate::models::ScanRecord>> {
        Ok(self.store.list_scan_history(limit)?)
    }

    pub fn validate_scan_range(&self, spec: &str) -> RangeValidation {
        validate_range(spec)
    }

    pub fn scan_presets(&self) -> &'static [ScanPreset] {
        SCAN_PRESETS
    }

    /// Single-host liveness check; RTT in milliseconds when it answers.
    pub async fn ping_host(&self, ip: &str) -> CoreResult<Option<u64>> {
        let ip: std::net::Ipv4Addr = ip
            .parse()
            .map_err(|_| CoreError::invalid(format!("not an IPv4 address: {}", ip)))?;
        let timeout = self.settings.read().await.scan_timeout();
        Ok(self.pinger.ping(ip, timeout).await)
    }

    /// Port check of one host; defaults to the discovery port list.
    pub async fn port_scan_host(&self, ip: &str, ports: Option<&[u16]>) -> CoreResult<Vec<u16>> {
        let ip: std::net::Ipv4Addr = ip
            .parse()
            .map_err(|_| CoreError::invalid(format!("not an IPv4 address: {}", ip)))?;
        let timeout = crate::config::PORT_CHECK_TIMEOUT;
        Ok(match ports {
            Some(ports) => check_port_list(ip, ports, timeout).await,
            None => check_ports(ip, timeout).await,
        })
    }

    // -- configuration & lifecycle -------------------------------------------

    pub fn get_config(&self) -> CoreResult<Vec<crate::models::ConfigEntry>> {
        Ok(self.store.list_config()?)
    }

    /// Validate, persist, and re-load configuration. Invalid entries reject
    /// the whole update; nothing is written.
    pub async fn update_config(
        &self,
        entries: &BTreeMap<String, String>,
    ) -> CoreResult<BTreeMap<String, String>> {
        // Dry-run against the current settings to catch bad values and
        // unknown keys before any write.
        let mut candidate = self.settings.read().await.clone();
        for (key, value) in entries {
            if !CONFIG_KEYS.contains(&key.as_str()) {
                return Err(CoreError::invalid(format!("unrecognized configuration key: {}", key)));
            }
            candidate
                .apply(key, value)
                .map_err(|reason| CoreError::invalid(format!("{}: {}", key, reason)))?;
        }

        // Persist the clamped values so a later read returns what actually
        // took effect.
        let normalized = candidate.to_map();
        for key in entries.keys() {
            if let Some(value) = normalized.get(key) {
                self.store.set_config(key, value, None)?;
            }
        }

        self.reload_settings().await?;
        tracing::info!("Configuration updated: {} keys", entries.len());
        Ok(self.settings.read().await.to_map())
    }

    pub async fn health(&self) -> CoreResult<HealthReport> {
        let started_at = *self.started_at.lock().expect("started_at lock poisoned");
        let uptime_seconds = started_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(0);

        Ok(HealthReport {
            running: self.is_running(),
            uptime_seconds,
            device_count: self.registry.read().await.len(),
            active_alerts: self.alerts.active_alerts().len(),
            scan_state: self.scanner.status(),
            last_scan_time: *self
                .last_scan_time
                .lock()
                .expect("last_scan_time lock poisoned"),
            store: self.store.stats()?,
        })
    }

    /// Run the retention pass immediately.
    pub async fn run_maintenance(&self) -> CoreResult<CleanupReport> {
        let retention_days = self.settings.read().await.max_history_days;
        Ok(self.store.cleanup(retention_days)?)
    }

}
