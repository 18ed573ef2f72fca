// Wires the scanner, fingerprint engine and aggregator to the bus.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::aggregator::{Aggregator, AggregatorStats};
use crate::bus::{MessageBus, Subject};
use crate::config::Config;
use crate::error::BusError;
use crate::scanner::{FingerprintEngine, PortResult, Report, ScanRequest, Scanner, ServiceRecord};
use crate::sink::ReportSink;

/// What `Pipeline::shutdown` did.
#[derive(Debug)]
pub struct ShutdownSummary {
    /// Reports produced by force-finalization.
    pub reports: Vec<Report>,
    pub abandoned_fingerprints: usize,
    pub stats: AggregatorStats,
}

pub struct Pipeline {
    bus: MessageBus,
    aggregator: Aggregator,
    fingerprints: Arc<FingerprintEngine>,
    scans: TaskTracker,
    /// Stops intake and any probe that has not started yet.
    cancel: CancellationToken,
    /// Tells the fingerprint worker to start tasks for what is queued and exit.
    fingerprint_drain: CancellationToken,
    /// Tells the aggregation worker to ingest what is queued and exit.
    aggregation_drain: CancellationToken,
    grace: Duration,
    intake: JoinHandle<()>,
    fingerprint_worker: JoinHandle<()>,
    aggregation_worker: JoinHandle<()>,
}

impl Pipeline {
    pub fn start(config: &Config, sink: Arc<dyn ReportSink>) -> Self {
        let scanner = Scanner::new(&config.scanner);
        let engine = FingerprintEngine::new(&config.fingerprint);
        Self::start_with(config, sink, scanner, engine)
    }

    /// Start with a caller-built scanner and fingerprint engine.
    pub fn start_with(
        config: &Config,
        sink: Arc<dyn ReportSink>,
        scanner: Scanner,
        engine: FingerprintEngine,
    ) -> Self {
        let bus = MessageBus::new(config.bus.capacity);
        let aggregator = Aggregator::new(&config.aggregation, sink);
        let fingerprints = Arc::new(engine);
        let scans = TaskTracker::new();
        let cancel = CancellationToken::new();
        let fingerprint_drain = CancellationToken::new();
        let aggregation_drain = CancellationToken::new();

        let scanner = Arc::new(scanner.with_shutdown(cancel.clone()));

        let intake = spawn_intake(bus.clone(), scanner, scans.clone(), cancel.clone());
        let fingerprint_worker =
            spawn_fingerprint_worker(bus.clone(), fingerprints.clone(), fingerprint_drain.clone());
        let aggregation_worker = spawn_aggregation_worker(&bus, aggregator.clone(), aggregation_drain.clone());

        info!(
            parallelism = config.scanner.parallelism,
            threshold = config.aggregation.result_threshold,
            timeout_ms = config.aggregation.timeout_ms,
            "Pipeline started"
        );

        Self {
            bus,
            aggregator,
            fingerprints,
            scans,
            cancel,
            fingerprint_drain,
            aggregation_drain,
            grace: config.fingerprint.shutdown_grace(),
            intake,
            fingerprint_worker,
            aggregation_worker,
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Publish a request on `scan.request`.
    pub fn submit(&self, request: &ScanRequest) -> Result<(), BusError> {
        self.bus.publish(Subject::ScanRequest, request)?;
        Ok(())
    }

    /// Stop intake and unstarted probes, let running scans finish, give
    /// fingerprint tasks the grace period, deliver everything already queued
    /// to the aggregator and force-finalize whatever is still open.
    pub async fn shutdown(self) -> ShutdownSummary {
        info!("Shutting down pipeline");
        self.cancel.cancel();
        self.scans.close();

        if let Err(e) = self.intake.await {
            error!(error = %e, "Intake worker failed");
        }
        self.scans.wait().await;
        debug!("All scans finished");

        // Open ports still queued for the fingerprint worker get their tasks
        // before the engine stops accepting work.
        self.fingerprint_drain.cancel();
        if let Err(e) = self.fingerprint_worker.await {
            error!(error = %e, "Fingerprint worker failed");
        }
        let abandoned_fingerprints = self.fingerprints.shutdown(self.grace).await;

        self.aggregation_drain.cancel();
        if let Err(e) = self.aggregation_worker.await {
            error!(error = %e, "Aggregation worker failed");
        }

        let reports = self.aggregator.finalize_all().await;
        let stats = self.aggregator.stats();
        info!(
            force_finalized = reports.len(),
            finalized = stats.finalized,
            persist_failures = stats.persist_failures,
            abandoned_fingerprints,
            "Pipeline stopped"
        );

        ShutdownSummary {
            reports,
            abandoned_fingerprints,
            stats,
        }
    }
}

fn spawn_intake(
    bus: MessageBus,
    scanner: Arc<Scanner>,
    scans: TaskTracker,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut requests = bus.subscribe::<ScanRequest>(Subject::ScanRequest);

    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                next = requests.next() => match next {
                    Ok(request) => request,
                    Err(e) => {
                        error!(error = %e, "Request subscription lost");
                        break;
                    }
                },
            };

            info!(scan_id = %request.id, target = %request.target, ports = request.ports.len(), "Scan request accepted");
            let scanner = scanner.clone();
            let bus = bus.clone();
            scans.spawn(async move {
                scanner.execute(&request, &bus).await;
            });
        }
        debug!("Intake stopped");
    })
}

fn spawn_fingerprint_worker(
    bus: MessageBus,
    engine: Arc<FingerprintEngine>,
    drain: CancellationToken,
) -> JoinHandle<()> {
    let mut results = bus.subscribe::<PortResult>(Subject::ScanResult);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = drain.cancelled() => break,
                next = results.next() => match next {
                    Ok(result) if result.is_open() => {
                        engine.spawn(result, &bus);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Result subscription lost");
                        break;
                    }
                },
            }
        }

        let mut drained = 0;
        while let Some(result) = results.try_next() {
            if engine.spawn(result, &bus) {
                drained += 1;
            }
        }
        debug!(drained, "Fingerprint worker stopped");
    })
}

fn spawn_aggregation_worker(bus: &MessageBus, aggregator: Aggregator, drain: CancellationToken) -> JoinHandle<()> {
    let mut results = bus.subscribe::<PortResult>(Subject::ScanResult);
    let mut services = bus.subscribe::<ServiceRecord>(Subject::ServiceDetected);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = drain.cancelled() => break,
                next = results.next() => match next {
                    Ok(result) => {
                        aggregator.ingest_port_result(result).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Result subscription lost");
                        break;
                    }
                },
                next = services.next() => match next {
                    Ok(record) => {
                        aggregator.ingest_service_record(record);
                    }
                    Err(e) => {
                        error!(error = %e, "Service subscription lost");
                        break;
                    }
                },
            }
        }

        let mut drained = 0;
        while let Some(result) = results.try_next() {
            aggregator.ingest_port_result(result).await;
            drained += 1;
        }
        while let Some(record) = services.try_next() {
            aggregator.ingest_service_record(record);
            drained += 1;
        }
        debug!(drained, "Aggregation worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregationConfig, ScannerConfig};
    use crate::scanner::tcp::{ProbeOutcome, Prober};
    use crate::scanner::ScanSummary;
    use crate::sink::ChannelSink;
    use async_trait::async_trait;
    use std::net::SocketAddr;

    /// Everything is closed.
    struct RefusingProber;

    #[async_trait]
    impl Prober for RefusingProber {
        async fn probe(&self, _addr: SocketAddr, _deadline: Duration) -> ProbeOutcome {
            ProbeOutcome::closed("connection_refused")
        }
    }

    fn config(threshold: usize) -> Config {
        Config {
            aggregation: AggregationConfig {
                result_threshold: threshold,
                ..AggregationConfig::default()
            },
            ..Config::default()
        }
    }

    fn start(config: &Config) -> (Pipeline, tokio::sync::mpsc::UnboundedReceiver<Report>) {
        let (sink, rx) = ChannelSink::new();
        let scanner = Scanner::new(&ScannerConfig::default()).with_prober(Arc::new(RefusingProber));
        let engine = FingerprintEngine::new(&config.fingerprint);
        (Pipeline::start_with(config, Arc::new(sink), scanner, engine), rx)
    }

    #[tokio::test]
    async fn test_threshold_report_through_bus() {
        let (pipeline, mut rx) = start(&config(3));
        pipeline
            .submit(&ScanRequest::new("t1", "127.0.0.1", vec![1, 2, 3]))
            .unwrap();

        let report = rx.recv().await.unwrap();
        assert_eq!(report.scan_id, "t1");
        assert_eq!(report.stats.total, 3);
        assert_eq!(report.stats.closed, 3);

        let summary = pipeline.shutdown().await;
        assert!(summary.reports.is_empty());
        assert_eq!(summary.stats.finalized, 1);
    }

    #[tokio::test]
    async fn test_shutdown_force_finalizes_open_scans() {
        let (pipeline, mut rx) = start(&config(20));
        let mut completed = pipeline.bus().subscribe::<ScanSummary>(Subject::ScanCompleted);

        pipeline
            .submit(&ScanRequest::new("t2", "127.0.0.1", vec![]))
            .unwrap();
        let done = completed.next().await.unwrap();
        assert_eq!(done.probed, 15);

        let summary = pipeline.shutdown().await;
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].stats.total, 15);
        assert_eq!(rx.recv().await.unwrap().scan_id, "t2");
        assert_eq!(summary.stats.active, 0);
    }

    #[tokio::test]
    async fn test_malformed_request_does_not_stop_intake() {
        let (pipeline, mut rx) = start(&config(2));
        pipeline.bus().publish_raw(Subject::ScanRequest, b"{\"id\":".to_vec());
        pipeline
            .submit(&ScanRequest::new("t3", "127.0.0.1", vec![80, 443]))
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().scan_id, "t3");
        pipeline.shutdown().await;
    }
}
