//! Network sweeps: range parsing, liveness probing, port checks

mod ping;
mod ports;
mod range;
mod sweep;

pub use ping::{IcmpPinger, Liveness};
pub use ports::{SCAN_PORTS, check_port_list, check_ports, service_name};
pub use range::{IpRange, RangeValidation, parse_range, validate_range};
pub use sweep::{DiscoveredHost, ScanOptions, ScanOutcome, ScanState, ScanStatus, Scanner};
