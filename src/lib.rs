//! lanpulse — LAN telemetry collector
//!
//! This crate is the monitoring core behind the dashboard:
//! - IP range sweeps with bounded concurrency for host discovery
//! - Periodic SNMP polling of remote devices and OS probing of the host
//! - Threshold-driven alerting with dedup and auto-resolution
//! - SQLite persistence for devices, metrics, alerts, and scan history
//! - Live event fan-out to dashboard subscribers

pub mod alerts;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod probe;
pub mod scanner;
pub mod store;

pub use alerts::{Alert, AlertEngine, AlertFilter, AlertSeverity, AlertStats, AlertType, NewAlert};
pub use config::{Settings, ThresholdPair, Thresholds};
pub use engine::{
    DeviceOverview, DeviceUpdate, Engine, HealthReport, MonitorEngine, NewDevice,
    RealtimeSnapshot, ScanPreset,
};
pub use error::{CoreError, CoreResult};
pub use events::{Broadcaster, Envelope, Event, SubscriberId};
pub use models::{
    Device, DeviceStatus, DeviceSummary, InterfaceRecord, LOCAL_COMMUNITY, LOCALHOST_ID,
    MetricBucket, MetricSample, MetricType, MetricUnit, ScanRecord, StoreStats, SystemInfoRecord,
};
pub use probe::{
    CpuSection, HostProbe, HostSampler, RemoteSampler, Sample, SampleInterface, SnmpProbe,
    SystemSection, UsageSection,
};
pub use scanner::{
    DiscoveredHost, IcmpPinger, IpRange, Liveness, RangeValidation, ScanOptions, ScanState,
    ScanStatus, Scanner, parse_range, validate_range,
};
pub use store::{AggregatePeriod, CleanupReport, Store};
