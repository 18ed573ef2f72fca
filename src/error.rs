// Error types shared by the engines. Per-port and per-probe failures are
// data, not errors.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {field} - {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid<S: Into<String>>(field: &'static str, message: S) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Faults of the message transport. These are infrastructure problems, not
/// scan outcomes.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to encode message for {subject}: {source}")]
    Encode {
        subject: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("subject {0} is closed")]
    Closed(&'static str),
}

/// Report handoff failures. The aggregate is already gone when one of these is
/// raised, so callers only log and count them.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to encode report {scan_id}: {source}")]
    Encode {
        scan_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write report {scan_id}: {source}")]
    Io {
        scan_id: String,
        #[source]
        source: io::Error,
    },

    #[error("report sink is closed, report {0} was not delivered")]
    Closed(String),

    #[error("{failed} of {total} report sinks failed for {scan_id}")]
    Partial {
        scan_id: String,
        failed: usize,
        total: usize,
    },
}

/// Fingerprint probe failures. They are logged and swallowed by the fingerprint
/// engine; the service record keeps its well-known default.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("{stage} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("{stage} failed: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(#[from] native_tls::Error),
}

impl ProbeError {
    pub fn io(stage: &'static str, source: io::Error) -> Self {
        Self::Io { stage, source }
    }

    pub fn is_connection_reset(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::ConnectionReset)
    }
}

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("empty target")]
    Empty,

    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("invalid IP range {range}: {reason}")]
    InvalidRange { range: String, reason: String },

    #[error("failed to resolve hostname {host}: {reason}")]
    Unresolved { host: String, reason: String },
}
