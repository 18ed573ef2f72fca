use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::scanner::results::{OpenPort, PortResult, PortState, Report, ScanStats, ServiceRecord};

/// Synthesize the report for a closed aggregate.
///
/// `results` holds at most one entry per port. Every open port picks up the
/// service record stored for it, if any.
pub fn build_report(
    scan_id: &str,
    target: &str,
    results: &[PortResult],
    services: &HashMap<u16, ServiceRecord>,
    duration: Duration,
    timestamp: DateTime<Utc>,
) -> Report {
    let mut stats = ScanStats {
        total: results.len(),
        ..ScanStats::default()
    };

    let mut open_ports = Vec::new();
    for result in results {
        match result.state {
            PortState::Open => {
                stats.open += 1;
                let service = services.get(&result.port);
                open_ports.push(OpenPort {
                    port: result.port,
                    service: service.map(|s| s.service_name.clone()),
                    version: service.and_then(|s| s.version.clone()),
                });
            }
            PortState::Closed => stats.closed += 1,
            PortState::Filtered => stats.filtered += 1,
        }
    }
    open_ports.sort_by_key(|p| p.port);

    Report {
        scan_id: scan_id.to_string(),
        target: target.to_string(),
        timestamp,
        duration_ms: duration.as_millis() as u64,
        open_ports,
        stats,
    }
}
