//! Range sweeps driven through the engine with stubbed liveness.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use lanpulse::{
    Broadcaster, CpuSection, DeviceStatus, Engine, HostSampler, Liveness, RemoteSampler, Sample,
    ScanOptions, ScanState, Store, SystemSection, UsageSection,
};

/// Host probe with a fixed benign sample.
struct QuietHost;

impl HostSampler for QuietHost {
    async fn sample(&self) -> Sample {
        Sample {
            system: Some(SystemSection {
                hostname: "collector".to_string(),
                uptime_seconds: 60,
                ..Default::default()
            }),
            cpu: Some(CpuSection { usage_percent: 5 }),
            memory: Some(UsageSection {
                usage_percent: 30,
                total_bytes: 1024,
                used_bytes: 300,
            }),
            disk: None,
            interfaces: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Remote probe that knows one enrichable agent.
struct OneAgentRemote {
    agent_ip: Ipv4Addr,
}

impl RemoteSampler for OneAgentRemote {
    async fn collect_all(&self, _ip: Ipv4Addr, _community: &str) -> Sample {
        let mut sample = Sample::default();
        sample.record_error("system", "request timed out");
        sample
    }

    async fn collect_system(&self, ip: Ipv4Addr, community: &str) -> anyhow::Result<SystemSection> {
        if ip == self.agent_ip && community == "private" {
            return Ok(SystemSection {
                hostname: "edge-router".to_string(),
                description: Some("stub agent".to_string()),
                location: Some("closet".to_string()),
                uptime_seconds: 123,
                ..Default::default()
            });
        }
        anyhow::bail!("request timed out")
    }
}

/// Remote probe where nothing answers SNMP.
struct SilentRemote;

impl RemoteSampler for SilentRemote {
    async fn collect_all(&self, _ip: Ipv4Addr, _community: &str) -> Sample {
        let mut sample = Sample::default();
        sample.record_error("system", "request timed out");
        sample
    }

    async fn collect_system(
        &self,
        _ip: Ipv4Addr,
        _community: &str,
    ) -> anyhow::Result<SystemSection> {
        anyhow::bail!("request timed out")
    }
}

/// Liveness stub answering for a fixed set.
struct StubPinger {
    alive: HashSet<Ipv4Addr>,
}

impl StubPinger {
    fn new(alive: &[&str]) -> Self {
        Self {
            alive: alive.iter().map(|ip| ip.parse().unwrap()).collect(),
        }
    }
}

impl Liveness for StubPinger {
    async fn ping(&self, ip: Ipv4Addr, _timeout: Duration) -> Option<u64> {
        self.alive.contains(&ip).then_some(3)
    }
}

fn fast_options() -> ScanOptions {
    ScanOptions {
        timeout_ms: 20,
        concurrent: 64,
        include_ports: false,
    }
}

async fn wait_for_scan_end<H, R, P>(engine: &Arc<Engine<H, R, P>>)
where
    H: HostSampler,
    R: RemoteSampler,
    P: Liveness,
{
    for _ in 0..200 {
        let status = engine.scan_status();
        if status.state != ScanState::Scanning && status.state != ScanState::Idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("scan did not finish in time");
}

#[tokio::test]
async fn test_scan_discovers_and_registers_bare_host() {
    let store = Store::in_memory().unwrap();
    let engine = Engine::new(
        store,
        Arc::new(QuietHost),
        Arc::new(SilentRemote),
        Arc::new(StubPinger::new(&["192.168.1.10"])),
        Arc::new(Broadcaster::new()),
    );

    engine
        .start_scan("192.168.1.1-254", fast_options())
        .await
        .expect("scan should dispatch");
    wait_for_scan_end(&engine).await;

    assert_eq!(engine.scan_status().state, ScanState::IdleCompleted);

    // the responsive host was registered with the fallback community and
    // its ip as hostname
    let device = engine
        .store()
        .get_device_by_ip("192.168.1.10")
        .unwrap()
        .expect("discovered host should be registered");
    assert_eq!(device.hostname, "192.168.1.10");
    assert_eq!(device.community, "public");
    assert_eq!(device.status, DeviceStatus::Online);

    // audit row
    let history = engine.scan_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].scan_range, "192.168.1.1-254");
    assert_eq!(history[0].total_ips, 254);
    assert_eq!(history[0].discovered_hosts, 1);
    assert!(history[0].started_at <= history[0].completed_at);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_scan_enriches_host_with_community_ladder() {
    let store = Store::in_memory().unwrap();
    let engine = Engine::new(
        store,
        Arc::new(QuietHost),
        Arc::new(OneAgentRemote {
            agent_ip: "10.0.0.7".parse().unwrap(),
        }),
        Arc::new(StubPinger::new(&["10.0.0.7"])),
        Arc::new(Broadcaster::new()),
    );

    engine
        .start_scan("10.0.0.1-20", fast_options())
        .await
        .unwrap();
    wait_for_scan_end(&engine).await;

    let device = engine
        .store()
        .get_device_by_ip("10.0.0.7")
        .unwrap()
        .expect("enriched host should be registered");
    assert_eq!(device.hostname, "edge-router");
    assert_eq!(device.community, "private");
    assert_eq!(device.location.as_deref(), Some("closet"));

    // registered hosts appear in the registry after completion
    let devices = engine.list_devices().await;
    assert!(devices.iter().any(|d| d.ip == "10.0.0.7"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_known_host_is_marked_online_not_duplicated() {
    let store = Store::in_memory().unwrap();
    let engine = Engine::new(
        store,
        Arc::new(QuietHost),
        Arc::new(SilentRemote),
        Arc::new(StubPinger::new(&["192.168.7.9"])),
        Arc::new(Broadcaster::new()),
    );

    let existing = engine
        .add_device(lanpulse::NewDevice {
            ip: "192.168.7.9".to_string(),
            hostname: Some("printer".to_string()),
            community: Some("public".to_string()),
            description: None,
            location: None,
            contact: None,
        })
        .await
        .unwrap();
    engine
        .store()
        .update_device_status(&existing.id, DeviceStatus::Offline)
        .unwrap();

    engine
        .start_scan("192.168.7.1-20", fast_options())
        .await
        .unwrap();
    wait_for_scan_end(&engine).await;

    let devices = engine.store().list_devices().unwrap();
    let matches: Vec<_> = devices.iter().filter(|d| d.ip == "192.168.7.9").collect();
    assert_eq!(matches.len(), 1, "existing device must not be re-registered");
    assert_eq!(matches[0].id, existing.id);
    assert_eq!(matches[0].status, DeviceStatus::Online);
    assert_eq!(matches[0].hostname, "printer");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_scan_request_is_rejected() {
    let store = Store::in_memory().unwrap();
    let engine = Engine::new(
        store,
        Arc::new(QuietHost),
        Arc::new(SilentRemote),
        Arc::new(StubPinger::new(&[])),
        Arc::new(Broadcaster::new()),
    );

    engine
        .start_scan("172.16.0.0/23", fast_options())
        .await
        .unwrap();

    // let the dispatched scan claim the scanner
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = engine.start_scan("172.16.9.1-5", fast_options()).await;
    assert!(matches!(second, Err(lanpulse::CoreError::Conflict(_))));

    // malformed ranges are rejected up front with Invalid
    let bad = engine.start_scan("not-a-range", fast_options()).await;
    assert!(matches!(bad, Err(lanpulse::CoreError::Invalid(_))));

    wait_for_scan_end(&engine).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_validate_range_surface() {
    let store = Store::in_memory().unwrap();
    let engine = Engine::new(
        store,
        Arc::new(QuietHost),
        Arc::new(SilentRemote),
        Arc::new(StubPinger::new(&[])),
        Arc::new(Broadcaster::new()),
    );

    let validation = engine.validate_scan_range("10.0.0.0/24");
    assert!(validation.valid);
    assert_eq!(validation.total_ips, Some(254));
    assert_eq!(validation.sample_ips.len(), 5);

    let invalid = engine.validate_scan_range("10.0.0.300");
    assert!(!invalid.valid);
    assert!(invalid.error.is_some());

    assert!(!engine.scan_presets().is_empty());
    engine.shutdown().await;
}
