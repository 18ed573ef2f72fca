use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, Subject};
use crate::config::FingerprintConfig;
use crate::scanner::protocol_detectors::database_detectors::{
    MongoDbDetector, MySqlDetector, PostgresDetector, RedisDetector,
};
use crate::scanner::protocol_detectors::system_detectors::{BannerGrabber, SshDetector};
use crate::scanner::protocol_detectors::web_detectors::HttpDetector;
use crate::scanner::protocol_detectors::{ProtocolDetectionResult, ProtocolDetector};
use crate::scanner::results::{PortResult, ServiceRecord};
use crate::utils::RecentSet;

/// Confidence of a record that only carries the well-known port name.
pub const WELL_KNOWN_CONFIDENCE: f32 = 0.5;

const UNKNOWN_SERVICE: &str = "unknown";

/// How many (scan id, port) pairs are remembered to suppress duplicate work.
const CLAIM_CAPACITY: usize = 65_536;

/// Conventional service name for a port, used until a probe says otherwise.
pub fn well_known_service(port: u16) -> Option<&'static str> {
    let name = match port {
        21 => "FTP",
        22 => "SSH",
        23 => "Telnet",
        25 => "SMTP",
        80 => "HTTP",
        110 => "POP3",
        143 => "IMAP",
        443 => "HTTPS",
        445 => "SMB",
        1433 => "MSSQL",
        3306 => "MySQL",
        3389 => "RDP",
        5432 => "PostgreSQL",
        5900 => "VNC",
        6379 => "Redis",
        8080 => "HTTP-Proxy",
        8443 => "HTTPS-Alt",
        27017 => "MongoDB",
        _ => return None,
    };
    Some(name)
}

/// Names and versions the service behind each open port. Every open port gets
/// its own task; the engine never touches aggregation state and only talks to
/// the rest of the pipeline through `service.detected`.
pub struct FingerprintEngine {
    timeout: Duration,
    service_names: HashMap<u16, String>,
    handlers: HashMap<u16, Arc<dyn ProtocolDetector>>,
    fallback: Arc<dyn ProtocolDetector>,
    claimed: Mutex<RecentSet<(String, u16)>>,
    tracker: TaskTracker,
}

impl FingerprintEngine {
    pub fn new(config: &FingerprintConfig) -> Self {
        let mut engine = Self {
            timeout: config.probe_timeout(),
            service_names: HashMap::new(),
            handlers: HashMap::new(),
            fallback: Arc::new(BannerGrabber::new(config.banner_limit)),
            claimed: Mutex::new(RecentSet::new(CLAIM_CAPACITY)),
            tracker: TaskTracker::new(),
        };
        engine.load_default_handlers();
        engine
    }

    fn load_default_handlers(&mut self) {
        let http: Arc<dyn ProtocolDetector> = Arc::new(HttpDetector::http());
        let https: Arc<dyn ProtocolDetector> = Arc::new(HttpDetector::https());

        self.handlers.insert(22, Arc::new(SshDetector));
        self.handlers.insert(80, http.clone());
        self.handlers.insert(8080, http);
        self.handlers.insert(443, https.clone());
        self.handlers.insert(8443, https);
        self.handlers.insert(3306, Arc::new(MySqlDetector));
        self.handlers.insert(5432, Arc::new(PostgresDetector));
        self.handlers.insert(6379, Arc::new(RedisDetector));
        self.handlers.insert(27017, Arc::new(MongoDbDetector));
    }

    /// Route `port` to `detector`, optionally overriding its well-known name.
    pub fn register(&mut self, port: u16, service_name: Option<&str>, detector: Arc<dyn ProtocolDetector>) {
        if let Some(name) = service_name {
            self.service_names.insert(port, name.to_string());
        }
        self.handlers.insert(port, detector);
    }

    pub fn service_name(&self, port: u16) -> Option<&str> {
        self.service_names
            .get(&port)
            .map(String::as_str)
            .or_else(|| well_known_service(port))
    }

    /// Fingerprint one port result. Returns `None` for anything that is not
    /// open, and for ports where nothing could be learned and no well-known
    /// name applies.
    pub async fn fingerprint(&self, result: &PortResult) -> Option<ServiceRecord> {
        if !result.is_open() {
            return None;
        }

        let detector = self
            .handlers
            .get(&result.port)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());

        let detection = match detector.probe(&result.target, result.port, self.timeout).await {
            Ok(detection) => detection,
            Err(e) => {
                debug!(
                    scan_id = %result.scan_id,
                    target = %result.target,
                    port = result.port,
                    detector = detector.name(),
                    error = %e,
                    "Fingerprint probe failed"
                );
                None
            }
        };

        self.merge(result, detection)
    }

    fn merge(&self, result: &PortResult, detection: Option<ProtocolDetectionResult>) -> Option<ServiceRecord> {
        let default_name = self.service_name(result.port);

        let (service_name, confidence, version, banner) = match detection {
            Some(ProtocolDetectionResult {
                service_name: Some(name),
                confidence,
                version,
                banner,
            }) => (name, confidence, version, banner),
            Some(unidentified) => match default_name {
                Some(name) => (name.to_string(), WELL_KNOWN_CONFIDENCE, None, unidentified.banner),
                None => (
                    UNKNOWN_SERVICE.to_string(),
                    unidentified.confidence,
                    None,
                    unidentified.banner,
                ),
            },
            None => (default_name?.to_string(), WELL_KNOWN_CONFIDENCE, None, None),
        };

        Some(ServiceRecord {
            scan_id: result.scan_id.clone(),
            target: result.target.clone(),
            port: result.port,
            service_name,
            version,
            banner,
            confidence,
        })
    }

    /// Start a fingerprint task for an open port and publish its record on
    /// `service.detected`. Returns false when nothing was started: the port is
    /// not open, the engine is shutting down, or this (scan id, port) was
    /// already fingerprinted.
    pub fn spawn(self: &Arc<Self>, result: PortResult, bus: &MessageBus) -> bool {
        if !result.is_open() {
            return false;
        }
        if self.tracker.is_closed() {
            debug!(scan_id = %result.scan_id, port = result.port, "Shutting down, fingerprint skipped");
            return false;
        }
        if !self.claim(&result) {
            debug!(scan_id = %result.scan_id, port = result.port, "Duplicate open port, fingerprint skipped");
            return false;
        }

        let engine = Arc::clone(self);
        let bus = bus.clone();
        self.tracker.spawn(async move {
            let Some(record) = engine.fingerprint(&result).await else {
                return;
            };

            info!(
                scan_id = %record.scan_id,
                target = %record.target,
                port = record.port,
                service = %record.service_name,
                version = record.version.as_deref().unwrap_or("-"),
                confidence = record.confidence,
                "Service detected"
            );

            if let Err(e) = bus.publish(Subject::ServiceDetected, &record) {
                error!(scan_id = %record.scan_id, port = record.port, error = %e, "Failed to publish service record");
            }
        });
        true
    }

    fn claim(&self, result: &PortResult) -> bool {
        match self.claimed.lock() {
            Ok(mut claimed) => claimed.insert((result.scan_id.clone(), result.port)),
            Err(poisoned) => poisoned.into_inner().insert((result.scan_id.clone(), result.port)),
        }
    }

    /// Fingerprint tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait up to `grace` for running tasks. Returns
    /// how many were abandoned; they keep running detached and whatever they
    /// publish later is dropped by the aggregator.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.tracker.close();

        if timeout(grace, self.tracker.wait()).await.is_ok() {
            debug!("All fingerprint tasks finished");
            return 0;
        }

        let abandoned = self.in_flight();
        warn!(abandoned, grace_ms = grace.as_millis() as u64, "Abandoning fingerprint tasks after grace period");
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::scanner::protocol_detectors::test_support::{closed_port, fake_server};
    use crate::scanner::results::{PortState, Protocol};
    use async_trait::async_trait;

    fn open_result(scan_id: &str, port: u16) -> PortResult {
        PortResult {
            scan_id: scan_id.to_string(),
            target: "127.0.0.1".to_string(),
            port,
            protocol: Protocol::Tcp,
            state: PortState::Open,
            error: None,
        }
    }

    fn engine() -> FingerprintEngine {
        FingerprintEngine::new(&FingerprintConfig {
            probe_timeout_ms: 500,
            ..FingerprintConfig::default()
        })
    }

    /// Takes a fixed time and then fails, like a service that never answers.
    struct StallingDetector(Duration);

    #[async_trait]
    impl ProtocolDetector for StallingDetector {
        fn name(&self) -> &str {
            "stall"
        }

        fn detect(&self, _response: &[u8]) -> Option<ProtocolDetectionResult> {
            None
        }

        async fn probe(
            &self,
            _target: &str,
            _port: u16,
            deadline: Duration,
        ) -> Result<Option<ProtocolDetectionResult>, ProbeError> {
            tokio::time::sleep(self.0).await;
            Err(ProbeError::Timeout { stage: "read", timeout: deadline })
        }
    }

    #[test]
    fn test_well_known_table() {
        assert_eq!(well_known_service(22), Some("SSH"));
        assert_eq!(well_known_service(8080), Some("HTTP-Proxy"));
        assert_eq!(well_known_service(27017), Some("MongoDB"));
        assert_eq!(well_known_service(9999), None);
    }

    #[tokio::test]
    async fn test_ssh_banner_names_and_versions_service() {
        let port = fake_server(Some(b"SSH-2.0-OpenSSH_8.9\r\n".to_vec()), vec![]).await;
        let mut engine = engine();
        engine.register(port, Some("SSH"), Arc::new(SshDetector));

        let record = engine.fingerprint(&open_result("d", port)).await.unwrap();
        assert_eq!(record.service_name, "SSH");
        assert_eq!(record.version.as_deref(), Some("8.9"));
        assert_eq!(record.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_probe_failure_keeps_well_known_name() {
        let port = closed_port().await;
        let mut engine = engine();
        engine.register(port, Some("MySQL"), Arc::new(MySqlDetector));

        let record = engine.fingerprint(&open_result("f", port)).await.unwrap();
        assert_eq!(record.service_name, "MySQL");
        assert!(record.version.is_none());
        assert_eq!(record.confidence, WELL_KNOWN_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_failed_tls_handshake_keeps_https_name() {
        // Plain TCP service that never answers the ClientHello.
        let port = fake_server(None, vec![]).await;
        let mut engine = engine();
        engine.register(port, Some("HTTPS"), Arc::new(HttpDetector::https()));

        let record = engine.fingerprint(&open_result("t", port)).await.unwrap();
        assert_eq!(record.service_name, "HTTPS");
        assert!(record.version.is_none());
        assert_eq!(record.confidence, WELL_KNOWN_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_unnamed_port_without_answer_yields_nothing() {
        let port = closed_port().await;
        assert!(well_known_service(port).is_none());
        assert!(engine().fingerprint(&open_result("z", port)).await.is_none());
    }

    #[tokio::test]
    async fn test_generic_banner_without_keyword_is_unknown() {
        let port = fake_server(Some(b"welcome to nothing in particular\r\n".to_vec()), vec![]).await;
        let record = engine().fingerprint(&open_result("u", port)).await.unwrap();
        assert_eq!(record.service_name, "unknown");
        assert_eq!(record.banner.as_deref(), Some("welcome to nothing in particular"));
    }

    #[tokio::test]
    async fn test_closed_port_is_not_fingerprinted() {
        let mut result = open_result("c", 22);
        result.state = PortState::Closed;
        assert!(engine().fingerprint(&result).await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_publishes_once_per_port() {
        let port = fake_server(Some(b"SSH-2.0-OpenSSH_9.6\r\n".to_vec()), vec![]).await;
        let mut engine = engine();
        engine.register(port, None, Arc::new(SshDetector));
        let engine = Arc::new(engine);

        let bus = MessageBus::new(16);
        let mut records = bus.subscribe::<ServiceRecord>(Subject::ServiceDetected);

        assert!(engine.spawn(open_result("p", port), &bus));
        assert!(!engine.spawn(open_result("p", port), &bus));
        assert_eq!(engine.shutdown(Duration::from_secs(2)).await, 0);

        let record = records.next().await.unwrap();
        assert_eq!(record.version.as_deref(), Some("9.6"));
        assert!(records.try_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_after_grace() {
        let mut engine = engine();
        engine.register(4000, None, Arc::new(StallingDetector(Duration::from_secs(60))));
        engine.register(4001, None, Arc::new(StallingDetector(Duration::from_millis(10))));
        let engine = Arc::new(engine);
        let bus = MessageBus::new(16);

        assert!(engine.spawn(open_result("g", 4000), &bus));
        assert!(engine.spawn(open_result("g", 4001), &bus));
        assert_eq!(engine.in_flight(), 2);

        assert_eq!(engine.shutdown(Duration::from_secs(5)).await, 1);
        assert_eq!(engine.in_flight(), 1);
        assert!(!engine.spawn(open_result("g", 4002), &bus));
    }
}
