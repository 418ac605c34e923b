//! ICMP liveness probing
//!
//! The sweep talks to a [`Liveness`] implementation so tests can stub
//! reachability; the real one uses a shared raw-ICMP client.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use surge_ping::{Client, Config, PingIdentifier, PingSequence};

/// Liveness probe: round-trip time in milliseconds, or `None` when the host
/// did not answer within the timeout.
pub trait Liveness: Send + Sync + 'static {
    fn ping(&self, ip: Ipv4Addr, timeout: Duration) -> impl Future<Output = Option<u64>> + Send;
}

/// Generates a ping identifier from the clock.
fn ping_id() -> u16 {
    use std::time::SystemTime;
    let duration = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    ((duration.as_nanos() % 0xFFFF) as u16).wrapping_add(1)
}

/// Raw-ICMP liveness prober backed by one shared socket client.
#[derive(Clone)]
pub struct IcmpPinger {
    client: Option<Arc<Client>>,
}

impl IcmpPinger {
    /// Opening the raw socket can fail without privileges; the prober then
    /// reports every host as unreachable instead of erroring per ping.
    pub fn new() -> Self {
        let client = match Client::new(&Config::default()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!("ICMP client unavailable ({}), liveness probing disabled", e);
                None
            }
        };
        Self { client }
    }
}

impl Default for IcmpPinger {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness for IcmpPinger {
    async fn ping(&self, ip: Ipv4Addr, timeout: Duration) -> Option<u64> {
        let client = self.client.as_ref()?;
        let payload = [0u8; 56];

        let start = Instant::now();
        let mut pinger = client.pinger(IpAddr::V4(ip), PingIdentifier(ping_id())).await;
        pinger.timeout(timeout);
        match pinger.ping(PingSequence(0), &payload).await {
            Ok((_packet, _rtt)) => Some(start.elapsed().as_millis() as u64),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_id_is_nonzero() {
        for _ in 0..64 {
            assert_ne!(ping_id(), 0);
        }
    }
}
