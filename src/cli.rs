use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use reconscope::config::Config;

#[derive(Parser, Debug)]
#[command(name = "reconscope")]
#[command(version)]
#[command(about = "TCP reconnaissance with service fingerprinting and per-scan reports", long_about = None)]
pub struct Cli {
    #[arg(required = true, help = "Target IP, hostname, IP range (IP1-IP2), or CIDR (192.168.1.0/24). Can be specified multiple times.")]
    pub target: Vec<String>,

    #[arg(short, long, allow_hyphen_values = true, help = "Ports to scan: -p22,80,443, -p1-1000, -ptop100 or -p- for all ports. Defaults to the built-in top ports.")]
    pub ports: Option<String>,

    #[arg(long, value_name = "MS", help = "Connect timeout per port probe in milliseconds (default: 1000)")]
    pub timeout: Option<u64>,

    #[arg(long, value_name = "N", help = "Concurrent port probes per scan (default: 10)")]
    pub parallel: Option<usize>,

    #[arg(long, value_name = "MS", help = "Deadline for each fingerprint connect/write/read in milliseconds (default: 2000)")]
    pub fingerprint_timeout: Option<u64>,

    #[arg(long, value_name = "N", help = "Port results that complete a scan report (default: 20)")]
    pub threshold: Option<usize>,

    #[arg(long, value_name = "MS", help = "Time after the first result at which a report is finalized regardless (default: 30000)")]
    pub aggregation_timeout: Option<u64>,

    #[arg(long, help = "JSON configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Append every report as a JSON line to this file")]
    pub report_log: Option<PathBuf>,

    #[arg(short = 'o', long, value_enum, default_value = "human", help = "Output format")]
    pub output_format: OutputFormat,

    #[arg(short = 'f', long, help = "Output file path")]
    pub output_file: Option<PathBuf>,

    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub log_json: bool,
}

impl Cli {
    /// Layer command line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(timeout) = self.timeout {
            config.scanner.probe_timeout_ms = timeout;
        }
        if let Some(parallel) = self.parallel {
            config.scanner.parallelism = parallel;
        }
        if let Some(timeout) = self.fingerprint_timeout {
            config.fingerprint.probe_timeout_ms = timeout;
        }
        if let Some(threshold) = self.threshold {
            config.aggregation.result_threshold = threshold;
        }
        if let Some(timeout) = self.aggregation_timeout {
            config.aggregation.timeout_ms = timeout;
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum OutputFormat {
    #[value(name = "human", help = "Human-readable output")]
    Human,
    #[value(name = "json", help = "JSON output")]
    Json,
    #[value(name = "csv", help = "CSV output")]
    Csv,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_only_given_flags() {
        let cli = Cli::parse_from(["reconscope", "10.0.0.1", "--parallel", "50", "--threshold", "5"]);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.scanner.parallelism, 50);
        assert_eq!(config.aggregation.result_threshold, 5);
        assert_eq!(config.scanner.probe_timeout_ms, 1000);
        assert_eq!(config.aggregation.timeout_ms, 30_000);
    }

    #[test]
    fn test_all_ports_flag() {
        let cli = Cli::parse_from(["reconscope", "-p-", "host.example"]);
        assert_eq!(cli.ports.as_deref(), Some("-"));
        assert_eq!(cli.target, vec!["host.example"]);
    }
}
