mod cli;
mod output;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::output::OutputWriter;
use reconscope::bus::Subject;
use reconscope::config::Config;
use reconscope::network::expand_targets;
use reconscope::pipeline::Pipeline;
use reconscope::scanner::{PortResult, Report, ScanRequest, ScanSummary};
use reconscope::sink::{ChannelSink, FanoutSink, JsonLinesSink, ReportSink};
use reconscope::utils::parse_ports;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_json);
    if cli.no_color {
        colored::control::set_override(false);
    }

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let ports = match &cli.ports {
        Some(spec) => parse_ports(spec)?,
        None => Vec::new(),
    };
    let targets = expand_targets(&cli.target.join(","))?;
    let requests: Vec<ScanRequest> = targets
        .into_iter()
        .map(|target| ScanRequest::new(new_scan_id(), target, ports.clone()))
        .collect();

    let (channel, mut reports_rx) = ChannelSink::new();
    let sink: Arc<dyn ReportSink> = match &cli.report_log {
        Some(path) => {
            let log = JsonLinesSink::open(path)
                .await
                .with_context(|| format!("failed to open report log {}", path.display()))?;
            Arc::new(FanoutSink::new(vec![Arc::new(channel), Arc::new(log)]))
        }
        None => Arc::new(channel),
    };

    let writer = OutputWriter::new(cli.output_format, cli.output_file.clone());
    let pipeline = Pipeline::start(&config, sink);
    let mut port_results = pipeline.bus().subscribe::<PortResult>(Subject::ScanResult);
    let mut completions = pipeline.bus().subscribe::<ScanSummary>(Subject::ScanCompleted);

    let ports_per_scan = if ports.is_empty() {
        config.scanner.default_ports.len()
    } else {
        ports.len()
    };
    let progress = ProgressBar::new((requests.len() * ports_per_scan) as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {pos}/{len} ports probed {msg}")?,
    );
    progress.enable_steady_tick(Duration::from_millis(120));

    for request in &requests {
        pipeline.submit(request)?;
    }
    info!(scans = requests.len(), ports = ports_per_scan, "Submitted scan requests");

    let mut reports: Vec<Report> = Vec::new();
    let mut completed = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while completed < requests.len() {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                progress.suspend(|| eprintln!("{}", "Interrupted, finalizing open scans".yellow()));
                break;
            }
            next = port_results.next() => {
                if next.is_ok() {
                    progress.inc(1);
                }
            }
            next = completions.next() => {
                if next.is_ok() {
                    completed += 1;
                    progress.set_message(format!("({}/{} scans)", completed, requests.len()));
                }
            }
            Some(report) = reports_rx.recv() => {
                emit(&writer, &progress, &report);
                reports.push(report);
            }
        }
    }

    progress.finish_and_clear();
    let summary = pipeline.shutdown().await;

    // Force-finalized reports went through the channel sink as well.
    while let Ok(report) = reports_rx.try_recv() {
        emit(&writer, &progress, &report);
        reports.push(report);
    }

    if summary.stats.persist_failures > 0 {
        warn!(failures = summary.stats.persist_failures, "Some reports could not be persisted");
    }
    if summary.abandoned_fingerprints > 0 {
        warn!(abandoned = summary.abandoned_fingerprints, "Fingerprinting did not finish for some ports");
    }

    writer.finish(&reports)?;
    Ok(())
}

fn emit(writer: &OutputWriter, progress: &ProgressBar, report: &Report) {
    if writer.streams() {
        progress.suspend(|| print!("{}", writer.render_report(report)));
    }
}

fn new_scan_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "reconscope=debug" } else { "reconscope=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
