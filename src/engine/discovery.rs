//! Scan dispatch and discovered-host registration
//!
//! The engine delegates the sweep to the scanner and consumes discovered
//! hosts from a channel. New devices are enriched over SNMP with an ordered
//! community list, staged, and merged into the registry only after the sweep
//! finishes, so a running cycle never sees a half-registered scan.

use chrono::Utc;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::Engine;
use crate::config::DISCOVERY_COMMUNITIES;
use crate::error::{CoreError, CoreResult};
use crate::models::{Device, DeviceStatus, ScanRecord};
use crate::probe::{HostSampler, RemoteSampler};
use crate::scanner::{DiscoveredHost, Liveness, ScanOptions, parse_range};

impl<H, R, P> Engine<H, R, P>
where
    H: HostSampler,
    R: RemoteSampler,
    P: Liveness,
{
    /// Start a sweep of `range_spec`. Returns once the scan is dispatched;
    /// progress and results stream through the broadcaster. A second scan
    /// while one is running is rejected.
    pub async fn start_scan(
        &self,
        range_spec: &str,
        options: ScanOptions,
    ) -> CoreResult<()> {
        let range = parse_range(range_spec)?;
        if self.scanner.is_scanning() {
            return Err(CoreError::conflict("a scan is already in progress"));
        }

        let engine = self.handle();
        tokio::spawn(async move {
            if let Err(e) = engine.run_scan(range, options).await {
                tracing::warn!("Scan failed: {}", e);
            }
        });

        Ok(())
    }

    pub(crate) async fn run_scan(
        &self,
        range: crate::scanner::IpRange,
        options: ScanOptions,
    ) -> CoreResult<()> {
        let spec = range.spec.clone();
        let (host_tx, mut host_rx) = mpsc::channel::<DiscoveredHost>(64);

        // Enrichment runs while the sweep continues; registrations stage
        // here until completion.
        let enricher = self.handle();
        let consumer = tokio::spawn(async move {
            let mut staged: Vec<Device> = Vec::new();
            while let Some(host) = host_rx.recv().await {
                match enricher.process_discovered_host(host).await {
                    Ok(Some(device)) => staged.push(device),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Failed to register discovered host: {}", e),
                }
            }
            staged
        });

        let outcome = self
            .scanner
            .run(range, options, host_tx, self.shutdown.child_token())
            .await;

        let staged = consumer.await.unwrap_or_default();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.scanner.mark_error(&spec, &e.to_string());
                return Err(e);
            }
        };

        // Merge the staging list in one registry write.
        if !staged.is_empty() {
            let mut registry = self.registry.write().await;
            for device in staged {
                registry.insert(device.ip.clone(), device);
            }
        }

        *self
            .last_scan_time
            .lock()
            .expect("last_scan_time lock poisoned") = Some(outcome.completed_at);

        if !outcome.stopped {
            let record = ScanRecord {
                id: 0,
                scan_range: outcome.range.clone(),
                total_ips: outcome.total_ips,
                discovered_hosts: outcome.discovered.len() as u32,
                duration_ms: outcome.duration_ms,
                started_at: outcome.started_at,
                completed_at: outcome.completed_at,
            };
            if let Err(e) = self.store.append_scan_history(&record) {
                tracing::warn!("Failed to persist scan record: {:#}", e);
            }
        }

        Ok(())
    }

    /// Register or refresh one discovered host. Known IPs are marked online;
    /// unknown ones are probed with the ordered community list and
    /// registered either enriched or bare.
    pub(crate) async fn process_discovered_host(
        &self,
        host: DiscoveredHost,
    ) -> anyhow::Result<Option<Device>> {
        let ip = host.ip.to_string();

        if let Some(existing) = self.store.get_device_by_ip(&ip)? {
            self.store
                .update_device_status(&existing.id, DeviceStatus::Online)?;
            let mut registry = self.registry.write().await;
            if let Some(entry) = registry.get_mut(&ip) {
                entry.status = DeviceStatus::Online;
                entry.last_seen = Utc::now();
            }
            return Ok(None);
        }

        let device = self.enrich_host(host.ip).await;
        self.store.upsert_device(&device)?;
        tracing::info!(
            "Registered discovered host {} as {} ({})",
            device.ip,
            device.hostname,
            device.community
        );
        Ok(Some(device))
    }

    /// Try each discovery community in order; first success wins.
    async fn enrich_host(&self, ip: Ipv4Addr) -> Device {
        for community in DISCOVERY_COMMUNITIES {
            match self.remote_probe.collect_system(ip, community).await {
                Ok(system) => {
                    let mut device = Device::new(
                        Uuid::new_v4().to_string(),
                        ip.to_string(),
                        if system.hostname.is_empty() {
                            ip.to_string()
                        } else {
                            system.hostname.clone()
                        },
                        community.to_string(),
                    );
                    device.description = system.description;
                    device.location = system.location;
                    device.contact = system.contact;
                    device.status = DeviceStatus::Online;
                    return device;
                }
                Err(e) => {
                    tracing::debug!("Community {} failed for {}: {:#}", community, ip, e);
                }
            }
        }

        // No agent answered; register bare with the IP as its name.
        let mut device = Device::new(
            Uuid::new_v4().to_string(),
            ip.to_string(),
            ip.to_string(),
            DISCOVERY_COMMUNITIES[0].to_string(),
        );
        device.status = DeviceStatus::Online;
        device
    }
}
