//! Device probing
//!
//! Both probes produce the same normalized [`Sample`]; the engine neither
//! knows nor cares whether it came from the host OS or an SNMP agent.
//! Probes never fail outright: missing sections stay `None` and the reason
//! lands in `errors`.

mod host;
mod remote;
mod session;

pub use host::{HostProbe, primary_ipv4};
pub use remote::SnmpProbe;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Identity and system-group facts for one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSection {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_memory_bytes: Option<u64>,
    pub processes: u32,
    pub users: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CpuSection {
    pub usage_percent: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageSection {
    pub usage_percent: u8,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// One interface as seen by a probe. Host probes fill addresses and the
/// loopback flag; SNMP probes fill the ifTable counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleInterface {
    pub index: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addrs: Vec<String>,
    pub iface_type: i64,
    pub speed: u64,
    pub admin_status: i64,
    pub oper_status: i64,
    pub in_octets: u64,
    pub out_octets: u64,
    #[serde(default)]
    pub internal: bool,
}

/// Normalized output of one probe run against one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<UsageSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<UsageSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<SampleInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Sample {
    /// True when at least one sub-collection produced data.
    pub fn reachable(&self) -> bool {
        self.system.is_some()
            || self.cpu.is_some()
            || self.memory.is_some()
            || self.disk.is_some()
            || !self.interfaces.is_empty()
    }

    pub fn record_error(&mut self, context: &str, error: impl std::fmt::Display) {
        self.errors.push(format!("{}: {}", context, error));
    }
}

/// Probe for the machine the collector runs on.
pub trait HostSampler: Send + Sync + 'static {
    fn sample(&self) -> impl Future<Output = Sample> + Send;
}

/// Probe for remote devices over the management protocol.
pub trait RemoteSampler: Send + Sync + 'static {
    /// Collect every section; sections fail independently.
    fn collect_all(
        &self,
        ip: Ipv4Addr,
        community: &str,
    ) -> impl Future<Output = Sample> + Send;

    /// System group only; used for connectivity tests and scan enrichment.
    fn collect_system(
        &self,
        ip: Ipv4Addr,
        community: &str,
    ) -> impl Future<Output = anyhow::Result<SystemSection>> + Send;

    /// Apply a new per-query timeout (configuration reload).
    fn set_query_timeout(&self, _timeout: std::time::Duration) {}

    /// Release any held sessions (shutdown).
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Round half-up to an integer percent, clamped to [0, 100].
pub(crate) fn round_percent(value: f64) -> u8 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    (value + 0.5).floor().min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sample_is_unreachable() {
        let mut sample = Sample::default();
        assert!(!sample.reachable());
        sample.record_error("cpu", "timed out");
        assert!(!sample.reachable());
        assert_eq!(sample.errors.len(), 1);

        sample.cpu = Some(CpuSection { usage_percent: 3 });
        assert!(sample.reachable());
    }

    #[test]
    fn test_round_percent() {
        assert_eq!(round_percent(49.5), 50);
        assert_eq!(round_percent(49.4), 49);
        assert_eq!(round_percent(-3.0), 0);
        assert_eq!(round_percent(250.0), 100);
        assert_eq!(round_percent(f64::NAN), 0);
    }
}
