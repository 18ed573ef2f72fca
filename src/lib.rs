pub mod aggregator;
pub mod bus;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod scanner;
pub mod sink;
pub mod utils;

pub use aggregator::{Aggregator, AggregatorStats};
pub use bus::{MessageBus, Subject};
pub use config::Config;
pub use pipeline::{Pipeline, ShutdownSummary};
pub use scanner::{FingerprintEngine, PortResult, PortState, Report, ScanRequest, Scanner, ServiceRecord};
pub use sink::{ChannelSink, FanoutSink, JsonLinesSink, ReportSink};
