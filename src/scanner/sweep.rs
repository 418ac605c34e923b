//! Batched range sweep
//!
//! Partitions the address list into batches of `concurrent`, probes each
//! batch in parallel, and pauses briefly between batches. One sweep at a
//! time; a stop request takes effect at the next batch boundary without
//! interrupting in-flight probes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ping::Liveness;
use super::ports::check_ports;
use super::range::IpRange;
use crate::config::{DEFAULT_SCAN_CONCURRENCY, PORT_CHECK_TIMEOUT, SCAN_BATCH_DELAY};
use crate::error::{CoreError, CoreResult};
use crate::events::{Broadcaster, Event};

/// Options for one sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    pub timeout_ms: u64,
    pub concurrent: usize,
    pub include_ports: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            concurrent: DEFAULT_SCAN_CONCURRENCY,
            include_ports: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    IdleCompleted,
    IdleStopped,
    IdleError,
}

/// Live status of the scanner, exposed to the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatus {
    pub state: ScanState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    pub percent: u8,
    pub scanned: u32,
    pub total: u32,
    pub found: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            state: ScanState::Idle,
            range: None,
            percent: 0,
            scanned: 0,
            total: 0,
            found: 0,
            started_at: None,
        }
    }
}

/// One responsive host found by a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredHost {
    pub ip: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_ports: Vec<u16>,
}

/// Result of one finished (or stopped) sweep.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub range: String,
    pub total_ips: u32,
    pub discovered: Vec<DiscoveredHost>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub stopped: bool,
}

/// Sweeps an IP range with bounded concurrency.
pub struct Scanner<P> {
    pinger: Arc<P>,
    broadcaster: Arc<Broadcaster>,
    scanning: AtomicBool,
    stop_requested: AtomicBool,
    status: std::sync::Mutex<ScanStatus>,
}

impl<P: Liveness> Scanner<P> {
    pub fn new(pinger: Arc<P>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            pinger,
            broadcaster,
            scanning: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            status: std::sync::Mutex::new(ScanStatus::default()),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ScanStatus {
        self.status.lock().expect("scan status lock poisoned").clone()
    }

    /// Request a stop; the current batch finishes first.
    pub fn stop(&self) -> CoreResult<()> {
        if !self.is_scanning() {
            return Err(CoreError::conflict("no scan in progress"));
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run one sweep. Discovered hosts stream into `host_tx` as they are
    /// found; the full set comes back in the outcome. `scan_completed` (or
    /// `scan_stopped`) is emitted strictly after every `host_discovered`.
    pub async fn run(
        &self,
        range: IpRange,
        options: ScanOptions,
        host_tx: mpsc::Sender<DiscoveredHost>,
        cancel: CancellationToken,
    ) -> CoreResult<ScanOutcome> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::conflict("a scan is already in progress"));
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let started_at = Utc::now();
        let start = Instant::now();
        let total = range.ips.len() as u32;
        let probe_timeout = Duration::from_millis(options.timeout_ms.max(1));
        let concurrent = options.concurrent.max(1);

        self.set_status(|status| {
            *status = ScanStatus {
                state: ScanState::Scanning,
                range: Some(range.spec.clone()),
                total,
                started_at: Some(started_at),
                ..ScanStatus::default()
            };
        });

        self.broadcaster.publish(Event::ScanStarted {
            range: range.spec.clone(),
            total_ips: total,
        });
        tracing::info!("Scan started: {} ({} addresses)", range.spec, total);

        let mut discovered: Vec<DiscoveredHost> = Vec::new();
        let mut scanned: u32 = 0;
        let mut stopped = false;

        for batch in range.ips.chunks(concurrent) {
            if cancel.is_cancelled() || self.stop_requested.load(Ordering::SeqCst) {
                stopped = true;
                break;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for &ip in batch {
                let pinger = Arc::clone(&self.pinger);
                handles.push(tokio::spawn(async move {
                    (ip, pinger.ping(ip, probe_timeout).await)
                }));
            }

            for handle in handles {
                let (ip, rtt_ms) = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!("Liveness probe task failed: {}", e);
                        continue;
                    }
                };

                scanned += 1;
                let percent = (scanned as u64 * 100 / total.max(1) as u64) as u8;
                let alive = rtt_ms.is_some();

                self.set_status(|status| {
                    status.scanned = scanned;
                    status.percent = percent;
                });
                self.broadcaster.publish(Event::ScanProgress {
                    percent,
                    ip: ip.to_string(),
                    result: alive,
                });

                if !alive {
                    continue;
                }

                let open_ports = if options.include_ports {
                    check_ports(ip, PORT_CHECK_TIMEOUT).await
                } else {
                    Vec::new()
                };

                let host = DiscoveredHost {
                    ip,
                    rtt_ms,
                    open_ports,
                };

                self.set_status(|status| status.found += 1);
                self.broadcaster.publish(Event::HostDiscovered {
                    ip: ip.to_string(),
                    rtt_ms: host.rtt_ms,
                    ports: if host.open_ports.is_empty() {
                        None
                    } else {
                        Some(host.open_ports.clone())
                    },
                });

                // The receiver going away must not kill the sweep.
                let _ = host_tx.send(host.clone()).await;
                discovered.push(host);
            }

            tokio::time::sleep(SCAN_BATCH_DELAY).await;
        }

        let completed_at = Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;
        let found = discovered.len() as u32;

        if stopped {
            self.set_status(|status| status.state = ScanState::IdleStopped);
            self.broadcaster.publish(Event::ScanStopped {
                range: range.spec.clone(),
            });
            tracing::info!("Scan stopped: {} after {} addresses", range.spec, scanned);
        } else {
            self.set_status(|status| {
                status.state = ScanState::IdleCompleted;
                status.percent = 100;
            });
            self.broadcaster.publish(Event::ScanCompleted {
                range: range.spec.clone(),
                total_scanned: total,
                total_found: found,
                duration_ms,
            });
            tracing::info!(
                "Scan completed: {} found {} of {} in {}ms",
                range.spec,
                found,
                total,
                duration_ms
            );
        }

        self.scanning.store(false, Ordering::SeqCst);

        Ok(ScanOutcome {
            range: range.spec,
            total_ips: total,
            discovered,
            duration_ms,
            started_at,
            completed_at,
            stopped,
        })
    }

    /// Record an internal failure (used by the engine when a dispatched scan
    /// dies unexpectedly).
    pub fn mark_error(&self, range: &str, message: &str) {
        self.set_status(|status| status.state = ScanState::IdleError);
        self.scanning.store(false, Ordering::SeqCst);
        self.broadcaster.publish(Event::ScanError {
            range: range.to_string(),
            message: message.to_string(),
        });
    }

    fn set_status(&self, update: impl FnOnce(&mut ScanStatus)) {
        let mut status = self.status.lock().expect("scan status lock poisoned");
        update(&mut status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::range::parse_range;
    use std::collections::HashSet;

    /// Liveness stub answering for a fixed set of addresses.
    struct StubPinger {
        alive: HashSet<Ipv4Addr>,
    }

    impl Liveness for StubPinger {
        async fn ping(&self, ip: Ipv4Addr, _timeout: Duration) -> Option<u64> {
            self.alive.contains(&ip).then_some(2)
        }
    }

    fn scanner_with(alive: &[&str]) -> (Arc<Scanner<StubPinger>>, Arc<Broadcaster>) {
        let broadcaster = Arc::new(Broadcaster::new());
        let pinger = Arc::new(StubPinger {
            alive: alive.iter().map(|ip| ip.parse().unwrap()).collect(),
        });
        (
            Arc::new(Scanner::new(pinger, Arc::clone(&broadcaster))),
            broadcaster,
        )
    }

    #[tokio::test]
    async fn test_sweep_finds_stubbed_host() {
        let (scanner, broadcaster) = scanner_with(&["192.168.1.10"]);
        let (_sub, mut events) = broadcaster.subscribe();
        let (tx, mut rx) = mpsc::channel(16);

        let outcome = scanner
            .run(
                parse_range("192.168.1.1-20").unwrap(),
                ScanOptions {
                    timeout_ms: 50,
                    concurrent: 8,
                    include_ports: false,
                },
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.total_ips, 20);
        assert_eq!(outcome.discovered.len(), 1);
        assert_eq!(outcome.discovered[0].ip.to_string(), "192.168.1.10");
        assert!(!outcome.stopped);

        let streamed = rx.recv().await.unwrap();
        assert_eq!(streamed.ip.to_string(), "192.168.1.10");

        // scan_completed arrives after host_discovered
        let mut saw_discovered = false;
        while let Ok(envelope) = events.try_recv() {
            match envelope.kind.as_str() {
                "host_discovered" => saw_discovered = true,
                "scan_completed" => {
                    assert!(saw_discovered, "completion must follow discovery");
                    assert_eq!(envelope.data["range"], "192.168.1.1-20");
                    assert_eq!(envelope.data["total_found"], 1);
                }
                _ => {}
            }
        }
        assert_eq!(scanner.status().state, ScanState::IdleCompleted);
    }

    #[tokio::test]
    async fn test_concurrent_scan_is_rejected() {
        let (scanner, _broadcaster) = scanner_with(&[]);
        let (tx, _rx) = mpsc::channel(16);

        let range = parse_range("10.0.0.1-200").unwrap();
        let runner = Arc::clone(&scanner);
        let options = ScanOptions {
            timeout_ms: 20,
            concurrent: 5,
            include_ports: false,
        };
        let first = tokio::spawn(async move {
            runner
                .run(range, options, tx, CancellationToken::new())
                .await
        });

        // Give the first scan a moment to claim the scanner.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx2, _rx2) = mpsc::channel(16);
        let second = scanner
            .run(
                parse_range("10.0.1.1-5").unwrap(),
                ScanOptions::default(),
                tx2,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(second, Err(CoreError::Conflict(_))));

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_at_batch_boundary() {
        let (scanner, _broadcaster) = scanner_with(&[]);
        let (tx, _rx) = mpsc::channel(16);

        let runner = Arc::clone(&scanner);
        let range = parse_range("10.0.0.0/23").unwrap();
        let handle = tokio::spawn(async move {
            runner
                .run(
                    range,
                    ScanOptions {
                        timeout_ms: 30,
                        concurrent: 4,
                        include_ports: false,
                    },
                    tx,
                    CancellationToken::new(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        scanner.stop().unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.stopped);
        assert!(outcome.discovered.is_empty());
        assert_eq!(scanner.status().state, ScanState::IdleStopped);
        // Stop on an idle scanner is a conflict.
        assert!(scanner.stop().is_err());
    }
}
