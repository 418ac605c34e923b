//! Monitoring engine
//!
//! Owns the device registry and orchestrates everything else: the polling
//! ticker, scan dispatch, threshold evaluation, daily maintenance, and the
//! control surface the outer transport calls into. All collaborators are
//! injected; there is no process-wide mutable state outside the store.

mod control;
mod discovery;
mod poll;

pub use control::{
    DeviceOverview, DeviceUpdate, HealthReport, NewDevice, RealtimeSnapshot, ScanPreset,
};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertEngine;
use crate::config::{MAINTENANCE_HOUR, Settings};
use crate::error::{CoreError, CoreResult};
use crate::events::Broadcaster;
use crate::models::{Device, DeviceStatus, LOCAL_COMMUNITY, LOCALHOST_ID};
use crate::probe::{HostProbe, HostSampler, RemoteSampler, SnmpProbe};
use crate::scanner::{IcmpPinger, Liveness, Scanner};
use crate::store::Store;

/// Engine wired with the production probes.
pub type MonitorEngine = Engine<HostProbe, SnmpProbe, IcmpPinger>;

/// The orchestrator. Construct with [`Engine::new`], then call
/// [`Engine::initialize`] exactly once.
pub struct Engine<H, R, P> {
    /// Back-reference for handing owned clones to spawned tasks.
    self_ref: std::sync::Weak<Self>,
    pub(crate) store: Store,
    pub(crate) host_probe: Arc<H>,
    pub(crate) remote_probe: Arc<R>,
    pub(crate) pinger: Arc<P>,
    pub(crate) scanner: Arc<Scanner<P>>,
    pub(crate) alerts: Arc<AlertEngine>,
    pub(crate) broadcaster: Arc<Broadcaster>,
    pub(crate) settings: RwLock<Settings>,
    /// ip → device; written only by the engine.
    pub(crate) registry: RwLock<HashMap<String, Device>>,
    pub(crate) running: AtomicBool,
    pub(crate) tick_in_flight: AtomicBool,
    pub(crate) last_scan_time: std::sync::Mutex<Option<chrono::DateTime<Utc>>>,
    pub(crate) started_at: std::sync::Mutex<Option<chrono::DateTime<Utc>>>,
    pub(crate) shutdown: CancellationToken,
}

impl MonitorEngine {
    /// Production wiring: OS host probe, SNMP remote probe, raw-ICMP pinger.
    pub fn with_defaults(store: Store) -> Arc<Self> {
        let settings = Settings::from_env();
        Engine::new(
            store,
            Arc::new(HostProbe::new()),
            Arc::new(SnmpProbe::new(settings.snmp_timeout())),
            Arc::new(IcmpPinger::new()),
            Arc::new(Broadcaster::new()),
        )
    }
}

impl<H, R, P> Engine<H, R, P>
where
    H: HostSampler,
    R: RemoteSampler,
    P: Liveness,
{
    pub fn new(
        store: Store,
        host_probe: Arc<H>,
        remote_probe: Arc<R>,
        pinger: Arc<P>,
        broadcaster: Arc<Broadcaster>,
    ) -> Arc<Self> {
        let scanner = Arc::new(Scanner::new(Arc::clone(&pinger), Arc::clone(&broadcaster)));
        let alerts = Arc::new(AlertEngine::new(store.clone(), Arc::clone(&broadcaster)));

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            store,
            host_probe,
            remote_probe,
            pinger,
            scanner,
            alerts,
            broadcaster,
            settings: RwLock::new(Settings::from_env()),
            registry: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            tick_in_flight: AtomicBool::new(false),
            last_scan_time: std::sync::Mutex::new(None),
            started_at: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Owned handle for spawned tasks. Valid for as long as any method can
    /// be running.
    pub(crate) fn handle(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("engine already dropped")
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bring the engine up. Order matters: configuration, registry,
    /// localhost, alert hydration, background tasks, then one immediate
    /// monitoring cycle.
    pub async fn initialize(&self) -> CoreResult<()> {
        if self.is_running() {
            return Err(CoreError::conflict("monitoring already running"));
        }

        self.reload_settings().await?;

        self.hydrate_registry().await?;
        self.ensure_localhost_device().await?;
        self.alerts.load()?;

        *self.started_at.lock().expect("started_at lock poisoned") = Some(Utc::now());
        self.running.store(true, Ordering::SeqCst);

        let ticker = self.handle();
        tokio::spawn(async move { ticker.run_ticker().await });

        let maintenance = self.handle();
        tokio::spawn(async move { maintenance.run_maintenance_schedule().await });

        // First cycle right away so dashboards have data before the first
        // tick fires.
        self.run_cycle().await;

        tracing::info!(
            "Engine initialized: {} devices, interval {}s",
            self.registry.read().await.len(),
            self.settings.read().await.refresh_interval_secs
        );

        Ok(())
    }

    /// Load settings: env-layered defaults overridden by store values.
    pub(crate) async fn reload_settings(&self) -> CoreResult<()> {
        let stored = self.store.config_map()?;
        let mut settings = Settings::from_env();
        settings.apply_all(&stored);

        self.remote_probe.set_query_timeout(settings.snmp_timeout());
        *self.settings.write().await = settings;
        Ok(())
    }

    async fn hydrate_registry(&self) -> CoreResult<()> {
        let devices = self.store.list_devices()?;
        let mut registry = self.registry.write().await;
        registry.clear();
        for device in devices {
            registry.insert(device.ip.clone(), device);
        }
        Ok(())
    }

    /// Guarantee the sentinel host device exists in store and registry.
    async fn ensure_localhost_device(&self) -> CoreResult<()> {
        {
            let registry = self.registry.read().await;
            if registry.values().any(|device| device.is_local()) {
                return Ok(());
            }
        }

        let mut ip = crate::probe::primary_ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        // The primary address may already belong to a registered device.
        if self.store.get_device_by_ip(&ip)?.is_some() {
            ip = "127.0.0.1".to_string();
        }
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        let device = Device::new(
            LOCALHOST_ID.to_string(),
            ip,
            hostname,
            LOCAL_COMMUNITY.to_string(),
        );
        self.store.upsert_device(&device)?;
        self.registry
            .write()
            .await
            .insert(device.ip.clone(), device);

        tracing::info!("Registered localhost device");
        Ok(())
    }

    /// Resume a stopped ticker.
    pub async fn start_monitoring(&self) -> CoreResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::conflict("monitoring already running"));
        }
        tracing::info!("Monitoring resumed");
        self.run_cycle().await;
        Ok(())
    }

    /// Pause the ticker; in-flight poll tasks finish on their own.
    pub fn stop_monitoring(&self) -> CoreResult<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::conflict("monitoring not running"));
        }
        tracing::info!("Monitoring paused");
        Ok(())
    }

    /// Graceful shutdown: cancel the ticker and in-flight work, close probe
    /// sessions and subscriber handles.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.remote_probe.close().await;
        self.broadcaster.close_all();
        tracing::info!("Engine shut down");
    }

    /// Ticker loop. The interval is re-read every iteration so configuration
    /// updates apply from the next tick without restarting the task.
    async fn run_ticker(self: Arc<Self>) {
        loop {
            let interval_secs = self.settings.read().await.refresh_interval_secs;
            for _ in 0..interval_secs {
                if self.shutdown.is_cancelled() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            if self.shutdown.is_cancelled() {
                return;
            }
            if !self.is_running() {
                continue;
            }
            self.run_cycle().await;
        }
    }

    /// Daily maintenance at the configured local hour.
    async fn run_maintenance_schedule(self: Arc<Self>) {
        loop {
            let wait = seconds_until_local_hour(MAINTENANCE_HOUR);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
            }

            let retention_days = self.settings.read().await.max_history_days;
            match self.store.cleanup(retention_days) {
                Ok(report) => tracing::info!(
                    "Maintenance: removed {} metrics, {} system info, {} interfaces, {} alerts",
                    report.metrics,
                    report.system_info,
                    report.interfaces,
                    report.alerts
                ),
                Err(e) => tracing::warn!("Maintenance cleanup failed: {:#}", e),
            }
        }
    }

    /// Current device list (registry order is not meaningful; sorted by ip).
    pub async fn devices_snapshot(&self) -> Vec<Device> {
        let registry = self.registry.read().await;
        let mut devices: Vec<Device> = registry.values().cloned().collect();
        devices.sort_by(|a, b| a.ip.cmp(&b.ip));
        devices
    }

    /// Status the registry and store should carry for a device, given its
    /// current unacknowledged alerts.
    pub(crate) fn derived_status(&self, device_id: &str) -> DeviceStatus {
        match self.alerts.device_alert_level(device_id) {
            Some(crate::alerts::AlertSeverity::Critical) => DeviceStatus::Critical,
            Some(crate::alerts::AlertSeverity::Warning) => DeviceStatus::Warning,
            None => DeviceStatus::Online,
        }
    }
}

/// Seconds until the next local occurrence of `hour:00:00`.
fn seconds_until_local_hour(hour: u32) -> u64 {
    use chrono::{Duration as ChronoDuration, Local, Timelike};

    let now = Local::now();
    let today_target = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    let target = if today_target > now {
        today_target
    } else {
        today_target + ChronoDuration::days(1)
    };

    (target - now).num_seconds().max(1) as u64
}
