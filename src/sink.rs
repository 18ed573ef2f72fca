// Report sinks. Each report is handed over once and never retried.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::error::PersistenceError;
use crate::scanner::results::Report;

#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    async fn persist(&self, report: &Report) -> Result<(), PersistenceError>;
}

/// Forwards reports to an in-process receiver.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Report>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReportSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn persist(&self, report: &Report) -> Result<(), PersistenceError> {
        self.tx
            .send(report.clone())
            .map_err(|_| PersistenceError::Closed(report.scan_id.clone()))
    }
}

/// Appends one JSON document per line.
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        debug!(path = %path.display(), "Opened report log");
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl ReportSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json-lines"
    }

    async fn persist(&self, report: &Report) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(report).map_err(|source| PersistenceError::Encode {
            scan_id: report.scan_id.clone(),
            source,
        })?;
        line.push(b'\n');

        let io_error = |source: std::io::Error| PersistenceError::Io {
            scan_id: report.scan_id.clone(),
            source,
        };

        // One lock per line keeps concurrent finalizations from interleaving.
        let mut file = self.file.lock().await;
        file.write_all(&line).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)
    }
}

/// Hands every report to each inner sink; fails if any of them failed.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ReportSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn persist(&self, report: &Report) -> Result<(), PersistenceError> {
        let outcomes = join_all(self.sinks.iter().map(|sink| sink.persist(report))).await;

        let mut failed = 0;
        for (sink, outcome) in self.sinks.iter().zip(outcomes) {
            if let Err(e) = outcome {
                failed += 1;
                error!(scan_id = %report.scan_id, sink = sink.name(), error = %e, "Report sink failed");
            }
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(PersistenceError::Partial {
                scan_id: report.scan_id.clone(),
                failed,
                total: self.sinks.len(),
            })
        }
    }
}
