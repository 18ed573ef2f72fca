pub mod tcp;
pub mod results;
pub mod service_detection;
pub mod protocol_detectors;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, Subject};
use crate::config::ScannerConfig;
use crate::network::resolve_target;
pub use results::{
    OpenPort, PortResult, PortState, Protocol, Report, ScanRequest, ScanStats, ScanSummary,
    ServiceRecord,
};
pub use service_detection::FingerprintEngine;
use tcp::{Prober, TcpConnectProber, TAG_RESOLVE_FAILED};

/// Scan execution engine: bounded-concurrency connect probes, one streamed
/// `PortResult` per port.
pub struct Scanner {
    timeout: Duration,
    parallelism: usize,
    default_ports: Vec<u16>,
    prober: Arc<dyn Prober>,
    shutdown: CancellationToken,
}

impl Scanner {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            timeout: config.probe_timeout(),
            parallelism: config.parallelism.max(1),
            default_ports: config.default_ports.clone(),
            prober: Arc::new(TcpConnectProber),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    /// Once `token` fires, ports still waiting for a probe slot are skipped.
    /// Probes already in flight run to their deadline.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// The ports a request will actually probe.
    pub fn ports_for(&self, request: &ScanRequest) -> Vec<u16> {
        if request.ports.is_empty() {
            self.default_ports.clone()
        } else {
            request.ports.clone()
        }
    }

    /// Start probing and stream results as they complete, in no particular
    /// order. The receiver yields `None` once every port has been probed.
    pub fn scan(&self, request: &ScanRequest) -> mpsc::Receiver<PortResult> {
        let ports = self.ports_for(request);
        let (tx, rx) = mpsc::channel(ports.len().max(1));

        let scan_id = request.id.clone();
        let target = request.target.clone();
        let prober = self.prober.clone();
        let deadline = self.timeout;
        let shutdown = self.shutdown.clone();
        let semaphore = Arc::new(Semaphore::new(self.parallelism));

        tokio::spawn(async move {
            let ip = match resolve_target(&target).await {
                Ok(ip) => ip,
                Err(e) => {
                    warn!(scan_id = %scan_id, target = %target, error = %e, "Target did not resolve, every port reported closed");
                    for port in ports {
                        let result = port_result(&scan_id, &target, port, PortState::Closed, Some(TAG_RESOLVE_FAILED));
                        if tx.send(result).await.is_err() {
                            break;
                        }
                    }
                    return;
                }
            };

            for port in ports {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!(scan_id = %scan_id, "Shutdown requested, not starting further probes");
                        break;
                    }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let tx = tx.clone();
                let prober = prober.clone();
                let scan_id = scan_id.clone();
                let target = target.clone();

                tokio::spawn(async move {
                    let outcome = prober.probe(SocketAddr::new(ip, port), deadline).await;
                    drop(permit);

                    match outcome.state {
                        PortState::Open => info!(scan_id = %scan_id, target = %target, port, "Found open port"),
                        state => debug!(scan_id = %scan_id, target = %target, port, %state, reason = ?outcome.reason, "Port probe finished"),
                    }

                    let result = port_result(&scan_id, &target, port, outcome.state, outcome.reason);
                    if tx.send(result).await.is_err() {
                        debug!(scan_id = %scan_id, port, "Result receiver dropped");
                    }
                });
            }
        });

        rx
    }

    /// Run a request to completion, publishing every result on `scan.result` as
    /// it arrives and a `ScanSummary` on `scan.completed` at the end.
    pub async fn execute(&self, request: &ScanRequest, bus: &MessageBus) -> ScanSummary {
        let started = Instant::now();
        let mut results = self.scan(request);
        let mut probed = 0;
        let mut open = 0;

        while let Some(result) = results.recv().await {
            probed += 1;
            if result.is_open() {
                open += 1;
            }
            if let Err(e) = bus.publish(Subject::ScanResult, &result) {
                error!(scan_id = %result.scan_id, port = result.port, error = %e, "Failed to publish scan result");
            }
        }

        let summary = ScanSummary {
            scan_id: request.id.clone(),
            target: request.target.clone(),
            probed,
            open,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            scan_id = %summary.scan_id,
            target = %summary.target,
            probed,
            open,
            elapsed_ms = summary.elapsed_ms,
            "Completed port scan"
        );

        if let Err(e) = bus.publish(Subject::ScanCompleted, &summary) {
            error!(scan_id = %summary.scan_id, error = %e, "Failed to publish scan completion");
        }

        summary
    }
}

fn port_result(
    scan_id: &str,
    target: &str,
    port: u16,
    state: PortState,
    reason: Option<&'static str>,
) -> PortResult {
    PortResult {
        scan_id: scan_id.to_string(),
        target: target.to_string(),
        port,
        protocol: Protocol::Tcp,
        state,
        error: reason.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::DEFAULT_PORTS;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tcp::ProbeOutcome;

    /// Sleeps instead of connecting and records peak concurrency.
    #[derive(Default)]
    struct CountingProber {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        open_ports: Vec<u16>,
    }

    #[async_trait]
    impl Prober for CountingProber {
        async fn probe(&self, addr: SocketAddr, _deadline: Duration) -> ProbeOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.open_ports.contains(&addr.port()) {
                ProbeOutcome::open()
            } else if addr.port() % 2 == 0 {
                ProbeOutcome::filtered(tcp::TAG_TIMEOUT)
            } else {
                ProbeOutcome::closed(tcp::TAG_CONNECTION_REFUSED)
            }
        }
    }

    fn scanner_with(prober: Arc<CountingProber>, parallelism: usize) -> Scanner {
        let config = ScannerConfig {
            parallelism,
            ..ScannerConfig::default()
        };
        Scanner::new(&config).with_prober(prober)
    }

    async fn collect(mut rx: mpsc::Receiver<PortResult>) -> Vec<PortResult> {
        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallelism_bounds_outstanding_probes() {
        let prober = Arc::new(CountingProber::default());
        let scanner = scanner_with(prober.clone(), 5);
        let request = ScanRequest::new("bound", "127.0.0.1", (1000..1060).collect());

        let results = collect(scanner.scan(&request)).await;

        assert_eq!(results.len(), 60);
        let peak = prober.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak concurrency {peak} exceeded limit");
        assert!(peak >= 2, "probes never overlapped");
    }

    #[tokio::test]
    async fn test_one_result_per_port_with_states() {
        let prober = Arc::new(CountingProber {
            open_ports: vec![22],
            ..Default::default()
        });
        let scanner = scanner_with(prober, 3);
        let request = ScanRequest::new("states", "127.0.0.1", vec![21, 22, 80]);

        let results = collect(scanner.scan(&request)).await;
        assert_eq!(results.len(), 3);

        let ports: HashSet<u16> = results.iter().map(|r| r.port).collect();
        assert_eq!(ports, HashSet::from([21, 22, 80]));

        for result in &results {
            assert_eq!(result.scan_id, "states");
            assert_eq!(result.protocol, Protocol::Tcp);
            match result.port {
                22 => {
                    assert_eq!(result.state, PortState::Open);
                    assert!(result.error.is_none());
                }
                80 => {
                    assert_eq!(result.state, PortState::Filtered);
                    assert_eq!(result.error.as_deref(), Some("timeout"));
                }
                _ => {
                    assert_eq!(result.state, PortState::Closed);
                    assert_eq!(result.error.as_deref(), Some("connection_refused"));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_empty_port_list_uses_default_set() {
        let scanner = scanner_with(Arc::new(CountingProber::default()), 10);
        let request = ScanRequest::new("defaults", "127.0.0.1", vec![]);

        let results = collect(scanner.scan(&request)).await;
        assert_eq!(results.len(), DEFAULT_PORTS.len());

        let ports: HashSet<u16> = results.iter().map(|r| r.port).collect();
        assert_eq!(ports, DEFAULT_PORTS.iter().copied().collect());
    }

    #[tokio::test]
    async fn test_cancelled_scan_starts_no_probes() {
        let prober = Arc::new(CountingProber::default());
        let token = CancellationToken::new();
        token.cancel();
        let scanner = scanner_with(prober.clone(), 2).with_shutdown(token);

        let results = collect(scanner.scan(&ScanRequest::new("x", "127.0.0.1", vec![1, 2, 3]))).await;
        assert!(results.is_empty());
        assert_eq!(prober.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_publishes_results_then_completion() {
        let bus = MessageBus::new(64);
        let mut results = bus.subscribe::<PortResult>(Subject::ScanResult);
        let mut completions = bus.subscribe::<ScanSummary>(Subject::ScanCompleted);

        let prober = Arc::new(CountingProber {
            open_ports: vec![443],
            ..Default::default()
        });
        let scanner = scanner_with(prober, 4);
        let request = ScanRequest::new("exec", "127.0.0.1", vec![80, 443, 8080]);

        let summary = scanner.execute(&request, &bus).await;
        assert_eq!(summary.probed, 3);
        assert_eq!(summary.open, 1);

        for _ in 0..3 {
            assert_eq!(results.next().await.unwrap().scan_id, "exec");
        }
        assert_eq!(completions.next().await.unwrap(), summary);
    }
}
