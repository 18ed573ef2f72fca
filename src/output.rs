use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::*;

use crate::cli::OutputFormat;
use reconscope::scanner::Report;

pub struct OutputWriter {
    format: OutputFormat,
    file: Option<PathBuf>,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, file: Option<PathBuf>) -> Self {
        Self { format, file }
    }

    /// Human output to a terminal is printed report by report as scans
    /// finish; everything else is written once at the end.
    pub fn streams(&self) -> bool {
        self.format == OutputFormat::Human && self.file.is_none()
    }

    pub fn render_report(&self, report: &Report) -> String {
        format_report_human(report)
    }

    pub fn finish(&self, reports: &[Report]) -> Result<()> {
        let output = match self.format {
            OutputFormat::Human if self.streams() => format_summary(reports),
            OutputFormat::Human => {
                let mut output: String = reports.iter().map(format_report_human).collect();
                output.push_str(&format_summary(reports));
                output
            }
            OutputFormat::Json => format_json(reports)?,
            OutputFormat::Csv => format_csv(reports),
        };

        match &self.file {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("failed to create output file {}", path.display()))?;
                let mut writer = BufWriter::new(file);
                writer.write_all(output.as_bytes())?;
                writer.flush()?;
            }
            None => {
                print!("{}", output);
                io::stdout().flush()?;
            }
        }

        Ok(())
    }
}

fn format_report_human(report: &Report) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "{} {} {} {} {} {}\n",
        "▶".truecolor(0, 255, 65).bold(),
        report.target.truecolor(255, 255, 255).bold(),
        "•".truecolor(64, 64, 64),
        format!("{} open", report.stats.open).truecolor(0, 212, 255).bold(),
        format!(
            "• {} closed • {} filtered",
            report.stats.closed, report.stats.filtered
        )
        .truecolor(128, 128, 128),
        format!("({}ms, scan {})", report.duration_ms, report.scan_id).truecolor(64, 64, 64),
    ));

    for port in &report.open_ports {
        let service = match (&port.service, &port.version) {
            (Some(service), Some(version)) => format!("{} {}", service, version),
            (Some(service), None) => service.clone(),
            (None, _) => "unidentified".to_string(),
        };

        output.push_str(&format!(
            "  {} {} {} {}\n",
            port.port.to_string().truecolor(255, 255, 255).bold(),
            "●".truecolor(0, 255, 65),
            "open".truecolor(0, 255, 65),
            service.truecolor(128, 128, 128)
        ));
    }

    output.push('\n');
    output
}

fn format_summary(reports: &[Report]) -> String {
    let hosts_with_open_ports = reports.iter().filter(|r| r.stats.open > 0).count();
    let total_open_ports: usize = reports.iter().map(|r| r.stats.open).sum();
    let total_ports: usize = reports.iter().map(|r| r.stats.total).sum();

    if hosts_with_open_ports == 0 {
        format!(
            "{} {}\n",
            "⚠".truecolor(255, 140, 0).bold(),
            format!("No open ports detected ({} reports, {} ports probed)", reports.len(), total_ports)
                .truecolor(128, 128, 128)
        )
    } else {
        format!(
            "{} {} {} {} {} {}\n",
            "⚡".truecolor(0, 255, 65).bold(),
            "Scan complete:".truecolor(0, 255, 65).bold(),
            format!("{} of {} hosts", hosts_with_open_ports, reports.len()).truecolor(255, 255, 255).bold(),
            "•".truecolor(64, 64, 64),
            format!("{} open ports", total_open_ports).truecolor(255, 255, 255).bold(),
            format!("({} probed)", total_ports).truecolor(128, 128, 128)
        )
    }
}

fn format_json(reports: &[Report]) -> Result<String> {
    let mut json = serde_json::to_string_pretty(reports)?;
    json.push('\n');
    Ok(json)
}

fn format_csv(reports: &[Report]) -> String {
    let mut csv = String::from("scan_id,target,port,service,version,duration_ms\n");

    for report in reports {
        for port in &report.open_ports {
            csv.push_str(&format!(
                "{},{},{},{},{},{}\n",
                csv_field(&report.scan_id),
                csv_field(&report.target),
                port.port,
                csv_field(port.service.as_deref().unwrap_or("")),
                csv_field(port.version.as_deref().unwrap_or("")),
                report.duration_ms
            ));
        }
    }

    csv
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
