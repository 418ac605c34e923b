//! TCP port checks for responsive hosts

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Fixed port target list for discovery scans.
pub const SCAN_PORTS: &[(u16, &str)] = &[
    (22, "ssh"),
    (23, "telnet"),
    (53, "dns"),
    (80, "http"),
    (443, "https"),
    (161, "snmp"),
    (162, "snmp-trap"),
    (3389, "rdp"),
];

/// Service label for a known scan port.
pub fn service_name(port: u16) -> Option<&'static str> {
    SCAN_PORTS
        .iter()
        .find(|(candidate, _)| *candidate == port)
        .map(|(_, name)| *name)
}

/// Probe one host's scan ports concurrently; returns the open ones sorted.
pub async fn check_ports(ip: Ipv4Addr, connect_timeout: Duration) -> Vec<u16> {
    let mut handles = Vec::with_capacity(SCAN_PORTS.len());
    for &(port, _) in SCAN_PORTS {
        handles.push(tokio::spawn(async move {
            check_port(ip, port, connect_timeout).await.then_some(port)
        }));
    }

    let mut open = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Some(port)) => open.push(port),
            Ok(None) => {}
            Err(e) => tracing::warn!("Port check task failed for {}: {}", ip, e),
        }
    }
    open.sort_unstable();
    open
}

/// Probe an arbitrary port list (control surface port-scan operation).
pub async fn check_port_list(
    ip: Ipv4Addr,
    ports: &[u16],
    connect_timeout: Duration,
) -> Vec<u16> {
    let mut handles = Vec::with_capacity(ports.len());
    for &port in ports {
        handles.push(tokio::spawn(async move {
            check_port(ip, port, connect_timeout).await.then_some(port)
        }));
    }

    let mut open = Vec::new();
    for handle in handles {
        if let Ok(Some(port)) = handle.await {
            open.push(port);
        }
    }
    open.sort_unstable();
    open
}

async fn check_port(ip: Ipv4Addr, port: u16, connect_timeout: Duration) -> bool {
    let addr = SocketAddr::new(IpAddr::V4(ip), port);
    matches!(
        tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
