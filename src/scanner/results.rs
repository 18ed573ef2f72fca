use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request to scan one target. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub id: String,
    pub target: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl ScanRequest {
    pub fn new(id: impl Into<String>, target: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            ports,
        }
    }
}

/// Outcome of probing a single port. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortResult {
    pub scan_id: String,
    pub target: String,
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PortResult {
    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// What the fingerprint engine learned about one open port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub scan_id: String,
    pub target: String,
    pub port: u16,
    #[serde(rename = "service")]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    pub confidence: f32,
}

/// Emitted by the scanner once every port of a request has been probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub target: String,
    pub probed: usize,
    pub open: usize,
    pub elapsed_ms: u64,
}

/// The single report synthesized for a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub scan_id: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub open_ports: Vec<OpenPort>,
    #[serde(rename = "statistics")]
    pub stats: ScanStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    #[serde(rename = "total_ports")]
    pub total: usize,
    #[serde(rename = "open_ports")]
    pub open: usize,
    #[serde(rename = "closed_ports")]
    pub closed: usize,
    #[serde(rename = "filtered_ports", default)]
    pub filtered: usize,
}
