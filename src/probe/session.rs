//! SNMP session cache
//!
//! Sessions are keyed by `(ip, community)` and reused across polls. A
//! session that produced a protocol-level error is evicted so the next poll
//! opens a fresh one.

use anyhow::{Context, Result, anyhow};
use snmp2::AsyncSession;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::SNMP_PORT;

pub(crate) type SessionHandle = Arc<Mutex<AsyncSession>>;

/// 32-bit starting request id, seeded from the clock.
fn request_id() -> i32 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos & 0x7FFF_FFFF) as i32
}

pub(crate) struct SessionCache {
    sessions: Mutex<HashMap<(Ipv4Addr, String), SessionHandle>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse the cached session for this `(ip, community)` or open one.
    pub async fn get_or_open(
        &self,
        ip: Ipv4Addr,
        community: &str,
        open_timeout: Duration,
    ) -> Result<SessionHandle> {
        let key = (ip, community.to_string());
        let mut sessions = self.sessions.lock().await;

        if let Some(handle) = sessions.get(&key) {
            return Ok(Arc::clone(handle));
        }

        let addr = format!("{}:{}", ip, SNMP_PORT);
        let session = timeout(
            open_timeout,
            AsyncSession::new_v2c(&addr, community.as_bytes(), request_id()),
        )
        .await
        .with_context(|| format!("Timed out opening SNMP session to {}", addr))?
        .map_err(|e| anyhow!("Failed to open SNMP session to {}: {:?}", addr, e))?;

        let handle = Arc::new(Mutex::new(session));
        sessions.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop the cached session so the next use reopens it.
    pub async fn invalidate(&self, ip: Ipv4Addr, community: &str) {
        let key = (ip, community.to_string());
        if self.sessions.lock().await.remove(&key).is_some() {
            tracing::debug!("Invalidated SNMP session for {} ({})", ip, community);
        }
    }

    pub async fn clear(&self) {
        self.sessions.lock().await.clear();
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_non_negative() {
        for _ in 0..32 {
            assert!(request_id() >= 0);
        }
    }

    #[tokio::test]
    async fn test_invalidate_unknown_key_is_noop() {
        let cache = SessionCache::new();
        cache.invalidate("192.0.2.1".parse().unwrap(), "public").await;
        assert_eq!(cache.len().await, 0);
    }
}
