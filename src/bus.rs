// In-process message transport: JSON payloads on broadcast channels,
// fire-and-forget and at-most-once.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::error::BusError;

type Payload = Arc<[u8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// `ScanRequest` from the intake surface.
    ScanRequest,
    /// `PortResult`, one per probed port.
    ScanResult,
    /// `ServiceRecord`, at most one per open port.
    ServiceDetected,
    /// `ScanSummary`, once per request after its last probe.
    ScanCompleted,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::ScanRequest => "scan.request",
            Subject::ScanResult => "scan.result",
            Subject::ServiceDetected => "service.detected",
            Subject::ScanCompleted => "scan.completed",
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct MessageBus {
    scan_request: broadcast::Sender<Payload>,
    scan_result: broadcast::Sender<Payload>,
    service_detected: broadcast::Sender<Payload>,
    scan_completed: broadcast::Sender<Payload>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            scan_request: broadcast::channel(capacity).0,
            scan_result: broadcast::channel(capacity).0,
            service_detected: broadcast::channel(capacity).0,
            scan_completed: broadcast::channel(capacity).0,
        }
    }

    fn sender(&self, subject: Subject) -> &broadcast::Sender<Payload> {
        match subject {
            Subject::ScanRequest => &self.scan_request,
            Subject::ScanResult => &self.scan_result,
            Subject::ServiceDetected => &self.service_detected,
            Subject::ScanCompleted => &self.scan_completed,
        }
    }

    /// Encode and publish a message. Returns how many subscribers it reached.
    pub fn publish<T: Serialize>(&self, subject: Subject, message: &T) -> Result<usize, BusError> {
        let payload = serde_json::to_vec(message).map_err(|source| BusError::Encode {
            subject: subject.as_str(),
            source,
        })?;
        Ok(self.publish_raw(subject, payload))
    }

    /// Publish an already encoded payload as-is.
    pub fn publish_raw(&self, subject: Subject, payload: Vec<u8>) -> usize {
        match self.sender(subject).send(payload.into()) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(subject = subject.as_str(), "No subscribers, message dropped");
                0
            }
        }
    }

    pub fn subscribe<T: DeserializeOwned>(&self, subject: Subject) -> Subscription<T> {
        Subscription {
            subject,
            receiver: self.sender(subject).subscribe(),
            malformed: 0,
            lost: 0,
            _message: PhantomData,
        }
    }
}

/// A typed view of one subject. Payloads that fail to decode are logged and
/// skipped rather than surfaced.
pub struct Subscription<T> {
    subject: Subject,
    receiver: broadcast::Receiver<Payload>,
    malformed: u64,
    lost: u64,
    _message: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    /// Wait for the next well-formed message. Only fails once every publisher
    /// is gone, which is a transport fault.
    pub async fn next(&mut self) -> Result<T, BusError> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => {
                    if let Some(message) = self.decode(&payload) {
                        return Ok(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return Err(BusError::Closed(self.subject.as_str())),
            }
        }
    }

    /// Take the next queued message without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(payload) => {
                    if let Some(message) = self.decode(&payload) {
                        return Some(message);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of payloads dropped because they did not decode.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Number of messages lost because this subscriber lagged.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    fn decode(&mut self, payload: &[u8]) -> Option<T> {
        match serde_json::from_slice(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                self.malformed += 1;
                warn!(
                    subject = self.subject.as_str(),
                    error = %e,
                    bytes = payload.len(),
                    "Dropping malformed message"
                );
                None
            }
        }
    }

    fn record_lag(&mut self, skipped: u64) {
        self.lost += skipped;
        warn!(
            subject = self.subject.as_str(),
            skipped,
            "Subscriber lagged, messages lost"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::results::ScanRequest;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = MessageBus::new(16);
        let mut first = bus.subscribe::<ScanRequest>(Subject::ScanRequest);
        let mut second = bus.subscribe::<ScanRequest>(Subject::ScanRequest);

        let request = ScanRequest::new("a", "127.0.0.1", vec![22]);
        assert_eq!(bus.publish(Subject::ScanRequest, &request).unwrap(), 2);

        assert_eq!(first.next().await.unwrap(), request);
        assert_eq!(second.next().await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let bus = MessageBus::new(16);
        let mut sub = bus.subscribe::<ScanRequest>(Subject::ScanRequest);

        bus.publish_raw(Subject::ScanRequest, b"{ definitely not json".to_vec());
        bus.publish_raw(Subject::ScanRequest, br#"{"id": 7}"#.to_vec());
        let request = ScanRequest::new("b", "host", vec![]);
        bus.publish(Subject::ScanRequest, &request).unwrap();

        assert_eq!(sub.next().await.unwrap(), request);
        assert_eq!(sub.malformed(), 2);
    }

    #[test]
    fn test_publish_without_subscribers_is_not_an_error() {
        let bus = MessageBus::new(4);
        let request = ScanRequest::new("c", "host", vec![]);
        assert_eq!(bus.publish(Subject::ScanRequest, &request).unwrap(), 0);
    }

    #[test]
    fn test_lagging_subscriber_loses_oldest() {
        let bus = MessageBus::new(2);
        let mut sub = bus.subscribe::<ScanRequest>(Subject::ScanRequest);
        for i in 0..5 {
            bus.publish(Subject::ScanRequest, &ScanRequest::new(i.to_string(), "h", vec![]))
                .unwrap();
        }

        assert_eq!(sub.try_next().unwrap().id, "3");
        assert_eq!(sub.try_next().unwrap().id, "4");
        assert!(sub.try_next().is_none());
        assert_eq!(sub.lost(), 3);
    }

    #[tokio::test]
    async fn test_closed_bus_is_a_transport_fault() {
        let bus = MessageBus::new(4);
        let mut sub = bus.subscribe::<ScanRequest>(Subject::ScanRequest);
        drop(bus);
        assert!(matches!(sub.next().await, Err(BusError::Closed("scan.request"))));
    }
}
