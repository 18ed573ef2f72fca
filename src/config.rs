// Runtime configuration: a JSON file layered over the defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::utils::DEFAULT_PORTS;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub fingerprint: FingerprintConfig,
    pub aggregation: AggregationConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Connect deadline for a single port probe.
    pub probe_timeout_ms: u64,
    /// Number of probe slots shared by all ports of one scan.
    pub parallelism: usize,
    /// Ports probed when a request carries none.
    pub default_ports: Vec<u16>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 1000,
            parallelism: 10,
            default_ports: DEFAULT_PORTS.to_vec(),
        }
    }
}

impl ScannerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Deadline applied separately to connect, write and read.
    pub probe_timeout_ms: u64,
    /// How long shutdown waits for in-flight fingerprint tasks.
    pub shutdown_grace_ms: u64,
    /// Maximum banner length in characters before an ellipsis is appended.
    pub banner_limit: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2000,
            shutdown_grace_ms: 5000,
            banner_limit: 200,
        }
    }
}

impl FingerprintConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Number of accepted port results that finalizes a scan.
    pub result_threshold: usize,
    /// Time after the first port result that finalizes a scan.
    pub timeout_ms: u64,
    /// How many finalized scan ids are remembered to reject stragglers.
    pub tombstone_capacity: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            result_threshold: 20,
            timeout_ms: 30_000,
            tombstone_capacity: 10_000,
        }
    }
}

impl AggregationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Messages buffered per subject before slow subscribers start losing them.
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl Config {
    /// Load from `path` if given, else from the user config directory if a file
    /// exists there, else fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("reconscope");
        path.push("config.json");
        Some(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner.probe_timeout_ms == 0 {
            return Err(ConfigError::invalid("scanner.probe_timeout_ms", "must be greater than 0"));
        }
        if self.scanner.parallelism == 0 {
            return Err(ConfigError::invalid("scanner.parallelism", "must be greater than 0"));
        }
        if self.scanner.default_ports.is_empty() {
            return Err(ConfigError::invalid("scanner.default_ports", "must not be empty"));
        }
        if self.scanner.default_ports.contains(&0) {
            return Err(ConfigError::invalid("scanner.default_ports", "port 0 is not scannable"));
        }
        if self.fingerprint.probe_timeout_ms == 0 {
            return Err(ConfigError::invalid("fingerprint.probe_timeout_ms", "must be greater than 0"));
        }
        if self.aggregation.result_threshold == 0 {
            return Err(ConfigError::invalid("aggregation.result_threshold", "must be greater than 0"));
        }
        if self.aggregation.timeout_ms == 0 {
            return Err(ConfigError::invalid("aggregation.timeout_ms", "must be greater than 0"));
        }
        if self.bus.capacity == 0 {
            return Err(ConfigError::invalid("bus.capacity", "must be greater than 0"));
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}
