// Aggregation and report synthesis.
//
// Every trigger goes through `claim`, which checks the trigger and removes the
// aggregate under the registry lock; whoever removes the entry finalizes.
// Lock order is always registry, then aggregate.

pub mod report;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::AggregationConfig;
use crate::scanner::results::{PortResult, Report, ServiceRecord};
use crate::sink::ReportSink;
use crate::utils::RecentSet;
pub use report::build_report;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Threshold,
    Timeout,
    Expired,
    Shutdown,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Threshold => "threshold",
            Trigger::Timeout => "timeout",
            Trigger::Expired => "expired",
            Trigger::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub active: usize,
    pub finalized: u64,
    pub persist_failures: u64,
    pub duplicates_dropped: u64,
    pub late_dropped: u64,
}

#[derive(Clone)]
pub struct Aggregator {
    shared: Arc<Shared>,
}

struct Shared {
    threshold: usize,
    timeout: Duration,
    sink: Arc<dyn ReportSink>,
    registry: Mutex<Registry>,
    finalized: AtomicU64,
    persist_failures: AtomicU64,
    duplicates_dropped: AtomicU64,
    late_dropped: AtomicU64,
}

struct Registry {
    active: HashMap<String, Arc<Mutex<ScanAggregate>>>,
    /// Recently finalized scan ids; results for these are stragglers.
    finalized: RecentSet<String>,
    next_serial: u64,
}

struct ScanAggregate {
    /// Distinguishes this instance from any earlier aggregate with the same id.
    serial: u64,
    target: String,
    started: Instant,
    results: Vec<PortResult>,
    seen_ports: HashSet<u16>,
    services: HashMap<u16, ServiceRecord>,
    timer: Option<JoinHandle<()>>,
    /// Set by the winning claim. Holders of a stale handle must not touch it.
    closed: bool,
}

/// What a successful claim takes out of the registry.
struct ClosedAggregate {
    target: String,
    started: Instant,
    results: Vec<PortResult>,
    services: HashMap<u16, ServiceRecord>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Aggregator {
    pub fn new(config: &AggregationConfig, sink: Arc<dyn ReportSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                threshold: config.result_threshold.max(1),
                timeout: config.timeout(),
                sink,
                registry: Mutex::new(Registry {
                    active: HashMap::new(),
                    finalized: RecentSet::new(config.tombstone_capacity),
                    next_serial: 0,
                }),
                finalized: AtomicU64::new(0),
                persist_failures: AtomicU64::new(0),
                duplicates_dropped: AtomicU64::new(0),
                late_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Accept one port result. Returns the report if this result completed
    /// the scan.
    pub async fn ingest_port_result(&self, result: PortResult) -> Option<Report> {
        let scan_id = result.scan_id.clone();
        let port = result.port;

        let entry = {
            let mut registry = lock(&self.shared.registry);
            if registry.finalized.contains(&scan_id) {
                self.shared.late_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(scan_id = %scan_id, port, "Dropping result for finalized scan");
                return None;
            }
            match registry.active.get(&scan_id) {
                Some(entry) => entry.clone(),
                None => self.open_aggregate(&mut registry, &result),
            }
        };

        let count = {
            let mut aggregate = lock(&entry);
            if aggregate.closed {
                self.shared.late_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(scan_id = %scan_id, port, "Dropping result, scan finalized concurrently");
                return None;
            }
            if !aggregate.seen_ports.insert(port) {
                self.shared.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(scan_id = %scan_id, port, "Dropping duplicate port result");
                return None;
            }
            aggregate.results.push(result);
            aggregate.results.len()
        };

        if count >= self.shared.threshold {
            return self.finalize(&scan_id, None, Trigger::Threshold).await;
        }
        None
    }

    /// Attach a service record to its live aggregate; the latest record for a
    /// port replaces any earlier one. Returns false if the record was dropped.
    pub fn ingest_service_record(&self, record: ServiceRecord) -> bool {
        let entry = lock(&self.shared.registry).active.get(&record.scan_id).cloned();

        let Some(entry) = entry else {
            self.shared.late_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(scan_id = %record.scan_id, port = record.port, "Dropping service record without live scan");
            return false;
        };

        let mut aggregate = lock(&entry);
        if aggregate.closed {
            self.shared.late_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let port = record.port;
        if aggregate.services.insert(port, record).is_some() {
            debug!(port, "Replaced earlier service record");
        }
        true
    }

    /// Fire the timeout trigger for `scan_id` now.
    pub async fn expire(&self, scan_id: &str) -> Option<Report> {
        self.finalize(scan_id, None, Trigger::Expired).await
    }

    /// Force-finalize every live aggregate.
    pub async fn finalize_all(&self) -> Vec<Report> {
        let scan_ids: Vec<String> = {
            let registry = lock(&self.shared.registry);
            registry.active.keys().cloned().collect()
        };
        if !scan_ids.is_empty() {
            info!(count = scan_ids.len(), "Force-finalizing open scans");
        }

        join_all(scan_ids.iter().map(|id| self.finalize(id, None, Trigger::Shutdown)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            active: lock(&self.shared.registry).active.len(),
            finalized: self.shared.finalized.load(Ordering::Relaxed),
            persist_failures: self.shared.persist_failures.load(Ordering::Relaxed),
            duplicates_dropped: self.shared.duplicates_dropped.load(Ordering::Relaxed),
            late_dropped: self.shared.late_dropped.load(Ordering::Relaxed),
        }
    }

    fn open_aggregate(&self, registry: &mut Registry, first: &PortResult) -> Arc<Mutex<ScanAggregate>> {
        registry.next_serial += 1;
        let serial = registry.next_serial;

        let entry = Arc::new(Mutex::new(ScanAggregate {
            serial,
            target: first.target.clone(),
            started: Instant::now(),
            results: Vec::new(),
            seen_ports: HashSet::new(),
            services: HashMap::new(),
            timer: Some(self.arm_timer(first.scan_id.clone(), serial)),
            closed: false,
        }));
        registry.active.insert(first.scan_id.clone(), entry.clone());

        debug!(scan_id = %first.scan_id, target = %first.target, serial, "Opened aggregate");
        entry
    }

    fn arm_timer(&self, scan_id: String, serial: u64) -> JoinHandle<()> {
        let aggregator = self.clone();
        let timeout = self.shared.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            aggregator.finalize(&scan_id, Some(serial), Trigger::Timeout).await;
        })
    }

    /// The single critical section deciding finalization: the trigger check
    /// and the registry removal happen under one registry lock.
    fn claim(&self, scan_id: &str, serial: Option<u64>, trigger: Trigger) -> Option<ClosedAggregate> {
        let mut registry = lock(&self.shared.registry);
        let entry = registry.active.get(scan_id)?.clone();
        let mut aggregate = lock(&entry);

        if matches!(serial, Some(serial) if serial != aggregate.serial) {
            return None;
        }
        if trigger == Trigger::Threshold && aggregate.results.len() < self.shared.threshold {
            return None;
        }

        registry.active.remove(scan_id);
        registry.finalized.insert(scan_id.to_string());
        aggregate.closed = true;

        if let Some(timer) = aggregate.timer.take() {
            // The timer task may be the caller; it must not cancel itself.
            if trigger != Trigger::Timeout {
                timer.abort();
            }
        }

        Some(ClosedAggregate {
            target: std::mem::take(&mut aggregate.target),
            started: aggregate.started,
            results: std::mem::take(&mut aggregate.results),
            services: std::mem::take(&mut aggregate.services),
        })
    }

    async fn finalize(&self, scan_id: &str, serial: Option<u64>, trigger: Trigger) -> Option<Report> {
        let Some(closed) = self.claim(scan_id, serial, trigger) else {
            debug!(scan_id = %scan_id, trigger = trigger.as_str(), "No live aggregate to finalize");
            return None;
        };
        self.shared.finalized.fetch_add(1, Ordering::Relaxed);

        let report = build_report(
            scan_id,
            &closed.target,
            &closed.results,
            &closed.services,
            closed.started.elapsed(),
            Utc::now(),
        );

        info!(
            scan_id = %report.scan_id,
            target = %report.target,
            trigger = trigger.as_str(),
            total = report.stats.total,
            open = report.stats.open,
            duration_ms = report.duration_ms,
            "Report generated"
        );

        if let Err(e) = self.shared.sink.persist(&report).await {
            self.shared.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!(scan_id = %report.scan_id, sink = self.shared.sink.name(), error = %e, "Failed to persist report");
        }

        Some(report)
    }
}
