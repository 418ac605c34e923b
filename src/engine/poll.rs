//! Per-tick polling pipeline
//!
//! Each cycle snapshots the registry, fans poll tasks onto a bounded worker
//! pool, waits for all of them, and publishes one `monitoring_update`. A
//! cycle that is still running when the next tick fires causes that tick to
//! be skipped rather than queued.

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::Engine;
use crate::alerts::{AlertSeverity, AlertType, NewAlert};
use crate::config::{MAX_CONCURRENT_POLLS, Settings, ThresholdPair};
use crate::events::Event;
use crate::models::{
    Device, DeviceStatus, DeviceSummary, InterfaceRecord, MetricType, SystemInfoRecord,
};
use crate::probe::{HostSampler, RemoteSampler, Sample};
use crate::scanner::Liveness;

impl<H, R, P> Engine<H, R, P>
where
    H: HostSampler,
    R: RemoteSampler,
    P: Liveness,
{
    /// One monitoring cycle. Skipped while a scan or a previous cycle is in
    /// flight.
    pub async fn run_cycle(&self) {
        if self.scanner.is_scanning() {
            tracing::debug!("Skipping cycle: scan in progress");
            return;
        }
        if self.tick_in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("Skipping cycle: previous cycle still running");
            return;
        }

        let start = Instant::now();
        let settings = Arc::new(self.settings.read().await.clone());
        let devices: Vec<Device> = self.registry.read().await.values().cloned().collect();

        // Hard deadline so one wedged device set cannot outlive two ticks.
        let deadline = Duration::from_secs(settings.refresh_interval_secs * 2);
        let summaries = match tokio::time::timeout(
            deadline,
            self.poll_all(devices, Arc::clone(&settings)),
        )
        .await
        {
            Ok(summaries) => summaries,
            Err(_) => {
                tracing::warn!("Monitoring cycle exceeded {}s deadline", deadline.as_secs());
                Vec::new()
            }
        };

        let cycle_ms = start.elapsed().as_millis() as u64;
        self.broadcaster.publish(Event::MonitoringUpdate {
            devices: summaries,
            timestamp: Utc::now(),
            cycle_ms,
        });
        tracing::debug!("Monitoring cycle finished in {}ms", cycle_ms);

        self.tick_in_flight.store(false, Ordering::SeqCst);
    }

    async fn poll_all(
        &self,
        devices: Vec<Device>,
        settings: Arc<Settings>,
    ) -> Vec<DeviceSummary> {
        if devices.is_empty() {
            return Vec::new();
        }

        let pool_size = MAX_CONCURRENT_POLLS.min(devices.len());
        let semaphore = Arc::new(Semaphore::new(pool_size));
        let mut handles = Vec::with_capacity(devices.len());

        for device in devices {
            let engine = self.handle();
            let settings = Arc::clone(&settings);
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };
                if engine.shutdown.is_cancelled() {
                    return None;
                }
                Some(engine.poll_device(device, &settings).await)
            }));
        }

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(e) => tracing::warn!("Poll task panicked: {}", e),
            }
        }
        summaries.sort_by(|a, b| a.ip.cmp(&b.ip));
        summaries
    }

    /// Poll one device and persist the result. A failing device never fails
    /// the tick.
    pub(crate) async fn poll_device(
        &self,
        device: Device,
        settings: &Settings,
    ) -> DeviceSummary {
        let sample = if device.is_local() {
            self.host_probe.sample().await
        } else {
            match device.ip.parse() {
                Ok(ip) => self.remote_probe.collect_all(ip, &device.community).await,
                Err(_) => {
                    let mut sample = Sample::default();
                    sample.record_error("address", format!("unparseable ip {}", device.ip));
                    sample
                }
            }
        };

        if !device.is_local() && !sample.reachable() {
            return self.handle_unreachable(device, &sample).await;
        }

        for error in &sample.errors {
            tracing::debug!("Partial probe failure on {}: {}", device.ip, error);
        }

        self.persist_sample(&device, &sample, settings).await
    }

    async fn handle_unreachable(
        &self,
        device: Device,
        sample: &Sample,
    ) -> DeviceSummary {
        tracing::warn!(
            "Device {} ({}) unreachable: {}",
            device.id,
            device.ip,
            sample.errors.join("; ")
        );

        if let Err(e) = self.store.update_device_status(&device.id, DeviceStatus::Offline) {
            tracing::warn!("Failed to persist offline status for {}: {:#}", device.id, e);
        }

        self.alerts.create(NewAlert {
            device_id: device.id.clone(),
            device_ip: device.ip.clone(),
            alert_type: AlertType::Offline,
            severity: AlertSeverity::Critical,
            message: format!("Device {} ({}) is unreachable", device.hostname, device.ip),
            metadata: None,
        });

        self.broadcaster.publish(Event::HostOffline {
            device_id: device.id.clone(),
            ip: device.ip.clone(),
        });

        {
            let mut registry = self.registry.write().await;
            if let Some(entry) = registry.get_mut(&device.ip) {
                entry.status = DeviceStatus::Offline;
            }
        }

        DeviceSummary {
            id: device.id,
            ip: device.ip,
            hostname: device.hostname,
            status: DeviceStatus::Offline,
            cpu_percent: None,
            memory_percent: None,
            disk_percent: None,
        }
    }

    async fn persist_sample(
        &self,
        device: &Device,
        sample: &Sample,
        settings: &Settings,
    ) -> DeviceSummary {
        let now = Utc::now();
        let mut updated = device.clone();

        // Refresh identity fields from the system group when present.
        if let Some(system) = &sample.system {
            if !system.hostname.is_empty() {
                updated.hostname = system.hostname.clone();
            }
            if system.description.is_some() {
                updated.description = system.description.clone();
            }
            if system.location.is_some() {
                updated.location = system.location.clone();
            }
            if system.contact.is_some() {
                updated.contact = system.contact.clone();
            }
        }

        if let Err(e) = self.store.upsert_device(&updated) {
            tracing::warn!("Failed to upsert device {}: {:#}", updated.id, e);
        }

        if let Some(system) = &sample.system {
            let record = SystemInfoRecord {
                device_id: updated.id.clone(),
                uptime_seconds: system.uptime_seconds,
                processes: system.processes,
                users: system.users,
                timestamp: now,
            };
            if let Err(e) = self.store.insert_system_info(&record) {
                tracing::warn!("Failed to insert system info for {}: {:#}", updated.id, e);
            }
        }

        let metrics = metric_rows(sample);
        if !metrics.is_empty()
            && let Err(e) = self.store.insert_metrics(&updated.id, &metrics)
        {
            tracing::warn!("Failed to insert metrics for {}: {:#}", updated.id, e);
        }

        if !sample.interfaces.is_empty() {
            let rows: Vec<InterfaceRecord> = sample
                .interfaces
                .iter()
                .map(|iface| InterfaceRecord {
                    device_id: updated.id.clone(),
                    index: iface.index,
                    name: iface.name.clone(),
                    description: iface.description.clone(),
                    iface_type: iface.iface_type,
                    speed: iface.speed,
                    admin_status: iface.admin_status,
                    oper_status: iface.oper_status,
                    in_octets: iface.in_octets,
                    out_octets: iface.out_octets,
                    timestamp: now,
                })
                .collect();
            if let Err(e) = self.store.replace_interfaces(&updated.id, &rows) {
                tracing::warn!("Failed to replace interfaces for {}: {:#}", updated.id, e);
            }
        }

        self.check_thresholds(&updated, sample, &settings.thresholds);

        // Reachable again: any standing offline alert clears now.
        self.alerts.auto_resolve(
            &updated.id,
            AlertType::Offline,
            0.0,
            ThresholdPair {
                warning: 0,
                critical: 0,
            },
        );

        let status = self.derived_status(&updated.id);
        updated.status = status;
        updated.last_seen = now;

        if let Err(e) = self.store.update_device_status(&updated.id, status) {
            tracing::warn!("Failed to persist status for {}: {:#}", updated.id, e);
        }

        {
            let mut registry = self.registry.write().await;
            registry.insert(updated.ip.clone(), updated.clone());
        }

        self.broadcaster.publish(Event::HostOnline {
            device_id: updated.id.clone(),
            ip: updated.ip.clone(),
        });

        DeviceSummary {
            id: updated.id,
            ip: updated.ip,
            hostname: updated.hostname,
            status,
            cpu_percent: sample.cpu.map(|cpu| cpu.usage_percent),
            memory_percent: sample.memory.map(|memory| memory.usage_percent),
            disk_percent: sample.disk.map(|disk| disk.usage_percent),
        }
    }

    /// Compare usage readings against the configured thresholds, creating
    /// alerts on the way up and auto-resolving on the way down.
    pub(crate) fn check_thresholds(
        &self,
        device: &Device,
        sample: &Sample,
        thresholds: &crate::config::Thresholds,
    ) {
        let readings = [
            (
                AlertType::Cpu,
                "CPU",
                sample.cpu.map(|cpu| cpu.usage_percent),
                thresholds.cpu,
            ),
            (
                AlertType::Memory,
                "Memory",
                sample.memory.map(|memory| memory.usage_percent),
                thresholds.memory,
            ),
            (
                AlertType::Disk,
                "Disk",
                sample.disk.map(|disk| disk.usage_percent),
                thresholds.disk,
            ),
        ];

        for (alert_type, label, usage, pair) in readings {
            let Some(usage) = usage else {
                continue;
            };

            if usage >= pair.critical {
                self.alerts.create(NewAlert {
                    device_id: device.id.clone(),
                    device_ip: device.ip.clone(),
                    alert_type,
                    severity: AlertSeverity::Critical,
                    message: format!(
                        "{} usage {}% exceeds critical threshold ({}%)",
                        label, usage, pair.critical
                    ),
                    metadata: None,
                });
            } else if usage >= pair.warning {
                self.alerts.create(NewAlert {
                    device_id: device.id.clone(),
                    device_ip: device.ip.clone(),
                    alert_type,
                    severity: AlertSeverity::Warning,
                    message: format!(
                        "{} usage {}% exceeds warning threshold ({}%)",
                        label, usage, pair.warning
                    ),
                    metadata: None,
                });
            } else {
                self.alerts
                    .auto_resolve(&device.id, alert_type, usage as f64, pair);
            }
        }
    }
}

/// Non-null metric rows for one sample, in write order.
fn metric_rows(sample: &Sample) -> Vec<(MetricType, f64)> {
    let mut rows = Vec::new();
    if let Some(cpu) = sample.cpu {
        rows.push((MetricType::CpuUsage, cpu.usage_percent as f64));
    }
    if let Some(memory) = sample.memory {
        rows.push((MetricType::MemoryUsage, memory.usage_percent as f64));
        rows.push((MetricType::MemoryTotal, memory.total_bytes as f64));
        rows.push((MetricType::MemoryUsed, memory.used_bytes as f64));
    }
    if let Some(disk) = sample.disk {
        rows.push((MetricType::DiskUsage, disk.usage_percent as f64));
        rows.push((MetricType::DiskTotal, disk.total_bytes as f64));
        rows.push((MetricType::DiskUsed, disk.used_bytes as f64));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{CpuSection, UsageSection};

    #[test]
    fn test_metric_rows_skip_missing_sections() {
        let mut sample = Sample::default();
        assert!(metric_rows(&sample).is_empty());

        sample.cpu = Some(CpuSection { usage_percent: 40 });
        sample.disk = Some(UsageSection {
            usage_percent: 60,
            total_bytes: 1000,
            used_bytes: 600,
        });

        let rows = metric_rows(&sample);
        assert_eq!(rows.len(), 4);
        assert!(rows.contains(&(MetricType::CpuUsage, 40.0)));
        assert!(rows.contains(&(MetricType::DiskTotal, 1000.0)));
        assert!(!rows.iter().any(|(t, _)| *t == MetricType::MemoryUsage));
    }
}
