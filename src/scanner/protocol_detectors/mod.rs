// Protocol detection handlers used by the fingerprint engine.
// Each handler opens its own connection and bounds every step by the same deadline.

pub mod database_detectors;
pub mod web_detectors;
pub mod system_detectors;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::error::ProbeError;

/// Confidence of a positive protocol match.
pub const MATCH_CONFIDENCE: f32 = 0.9;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolDetectionResult {
    /// `None` when the peer answered but could not be identified.
    pub service_name: Option<String>,
    pub confidence: f32,
    pub version: Option<String>,
    pub banner: Option<String>,
}

impl ProtocolDetectionResult {
    pub fn matched(service_name: &str) -> Self {
        Self {
            service_name: Some(service_name.to_string()),
            confidence: MATCH_CONFIDENCE,
            version: None,
            banner: None,
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }
}

#[async_trait]
pub trait ProtocolDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Classify a response already read off the wire.
    fn detect(&self, response: &[u8]) -> Option<ProtocolDetectionResult>;

    /// Run the full exchange against `target:port`. `Ok(None)` means the peer
    /// talked but did not match; `Err` means the exchange itself failed.
    async fn probe(
        &self,
        target: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Option<ProtocolDetectionResult>, ProbeError>;
}

pub(crate) async fn connect(target: &str, port: u16, deadline: Duration) -> Result<TcpStream, ProbeError> {
    match timeout(deadline, TcpStream::connect((target, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProbeError::io("connect", e)),
        Err(_) => Err(ProbeError::Timeout { stage: "connect", timeout: deadline }),
    }
}

pub(crate) async fn write_all<S>(stream: &mut S, data: &[u8], deadline: Duration) -> Result<(), ProbeError>
where
    S: AsyncWrite + Unpin,
{
    match timeout(deadline, stream.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ProbeError::io("write", e)),
        Err(_) => Err(ProbeError::Timeout { stage: "write", timeout: deadline }),
    }
}

/// A single read of at most `limit` bytes. An empty buffer means the peer
/// closed the connection.
pub(crate) async fn read_some<S>(stream: &mut S, limit: usize, deadline: Duration) -> Result<Vec<u8>, ProbeError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; limit];
    match timeout(deadline, stream.read(&mut buffer)).await {
        Ok(Ok(n)) => {
            buffer.truncate(n);
            Ok(buffer)
        }
        Ok(Err(e)) => Err(ProbeError::io("read", e)),
        Err(_) => Err(ProbeError::Timeout { stage: "read", timeout: deadline }),
    }
}

/// Keep reading until `complete` accepts the buffer, the peer closes, `limit`
/// bytes arrived or the deadline passes. Whatever arrived before a timeout or
/// a mid-stream error is returned as a partial response.
pub(crate) async fn read_until<S, F>(
    stream: &mut S,
    limit: usize,
    deadline: Duration,
    complete: F,
) -> Result<Vec<u8>, ProbeError>
where
    S: AsyncRead + Unpin,
    F: Fn(&[u8]) -> bool,
{
    let mut data = Vec::new();
    let mut chunk = vec![0u8; limit.min(4096).max(1)];
    let until = tokio::time::Instant::now() + deadline;

    while data.len() < limit && !complete(&data) {
        match tokio::time::timeout_at(until, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => data.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) if data.is_empty() => return Err(ProbeError::io("read", e)),
            Err(_) if data.is_empty() => {
                return Err(ProbeError::Timeout { stage: "read", timeout: deadline })
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }

    data.truncate(limit);
    Ok(data)
}

/// First line of a response, lossily decoded and trimmed.
pub(crate) fn first_line(response: &[u8]) -> String {
    let text = String::from_utf8_lossy(response);
    text.lines().next().unwrap_or("").trim().to_string()
}

/// Clamp a banner to `limit` characters, appending an ellipsis when cut.
pub(crate) fn truncate_banner(banner: &str, limit: usize) -> String {
    if banner.chars().count() > limit {
        let mut cut: String = banner.chars().take(limit).collect();
        cut.push_str("...");
        cut
    } else {
        banner.to_string()
    }
}
