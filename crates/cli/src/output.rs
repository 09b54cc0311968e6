//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use ptp_lib::cleanup::{CleanupReport, RetainCandidate};
use ptp_lib::report::{sanitize_ip, truncate_blob, FleetReport, HUMAN_BLOB_LIMIT};
use ptp_lib::Verdict;

/// Output format for the final report
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables (default)
    #[default]
    Table,
    /// JSON on stdout
    Json,
    /// YAML on stdout
    Yaml,
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Row for the per-instance results table
#[derive(Tabled)]
struct VerdictRow {
    #[tabled(rename = "Type")]
    instance_type: String,
    #[tabled(rename = "#")]
    ordinal: String,
    #[tabled(rename = "Instance ID")]
    instance_id: String,
    #[tabled(rename = "AZ")]
    availability_zone: String,
    #[tabled(rename = "Arch")]
    architecture: String,
    #[tabled(rename = "Driver")]
    driver: String,
    #[tabled(rename = "Clock")]
    clock_device: String,
    #[tabled(rename = "PTP")]
    status: String,
    #[tabled(rename = "Duration")]
    duration: String,
}

fn verdict_row(verdict: &Verdict) -> VerdictRow {
    let handle = verdict.instance.as_ref();
    VerdictRow {
        instance_type: verdict.instance_type.clone(),
        ordinal: format!("{}/{}", verdict.ordinal, verdict.type_total),
        instance_id: handle
            .map(|h| h.instance_id.clone())
            .unwrap_or_else(|| "-".into()),
        availability_zone: handle
            .map(|h| h.availability_zone.clone())
            .unwrap_or_else(|| "-".into()),
        architecture: handle
            .map(|h| h.architecture.to_string())
            .unwrap_or_else(|| "-".into()),
        driver: verdict
            .driver
            .version_string()
            .unwrap_or("unknown")
            .to_string(),
        clock_device: verdict
            .evidence
            .clock_device
            .clone()
            .unwrap_or_else(|| "-".into()),
        status: if verdict.supported {
            "SUPPORTED".green().bold().to_string()
        } else {
            "NOT SUPPORTED".red().to_string()
        },
        duration: format!("{:.1}s", verdict.duration_seconds),
    }
}

/// Render the final fleet report in the chosen format.
pub fn print_report(report: &FleetReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Yaml => println!("{}", report.to_yaml()?),
        OutputFormat::Table => print_report_tables(report),
    }
    Ok(())
}

fn print_report_tables(report: &FleetReport) {
    println!();
    println!("{}", "PTP Instance Test Summary".bold());
    println!("{}", "=".repeat(70));
    println!("Total instances tested:  {}", report.total_instances);
    println!(
        "PTP supported:           {}",
        report.supported.to_string().green()
    );
    println!(
        "PTP unsupported:         {}",
        report.unsupported.to_string().red()
    );
    println!("Total duration:          {:.1}s", report.elapsed_seconds);
    if let Some(group) = &report.placement_group {
        println!("Placement group:         {group}");
    }
    println!();

    let rows: Vec<VerdictRow> = report.verdicts.iter().map(verdict_row).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{table}");

    // Failure details, truncated for the terminal; the JSON/YAML export
    // carries the full diagnostics.
    for verdict in report.verdicts.iter().filter(|v| !v.supported) {
        println!();
        println!(
            "{} {} #{}",
            "Diagnostics for".bold(),
            verdict.instance_type,
            verdict.ordinal
        );
        if let Some(message) = &verdict.error_message {
            println!("  Error: {}", message.red());
        }
        if let Some(handle) = &verdict.instance {
            println!("  Private IP: {}", sanitize_ip(&handle.private_ip));
            if let Some(public_ip) = &handle.public_ip {
                println!("  Public IP: {}", sanitize_ip(public_ip));
            }
        }
        for (key, value) in verdict.evidence.diagnostics.iter() {
            let flattened = value.replace('\n', " | ");
            println!("  {}: {}", key.cyan(), truncate_blob(&flattened, HUMAN_BLOB_LIMIT));
        }
    }
}

/// Row for the retention selection listing
#[derive(Tabled)]
struct CandidateRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Instance ID")]
    instance_id: String,
    #[tabled(rename = "Type")]
    instance_type: String,
    #[tabled(rename = "AZ")]
    availability_zone: String,
    #[tabled(rename = "Subnet")]
    subnet_id: String,
    #[tabled(rename = "Clock")]
    clock_device: String,
    #[tabled(rename = "Ordinal")]
    ordinal: u32,
}

/// Print the supported instances offered for retention.
pub fn print_candidates(candidates: &[RetainCandidate]) {
    println!();
    println!(
        "{}",
        format!(
            "{} instance(s) with functional PTP:",
            candidates.len()
        )
        .bold()
    );

    let rows: Vec<CandidateRow> = candidates
        .iter()
        .map(|c| CandidateRow {
            index: c.index,
            instance_id: c.instance_id.clone(),
            instance_type: c.instance_type.clone(),
            availability_zone: c.availability_zone.clone(),
            subnet_id: c.subnet_id.clone(),
            clock_device: c.clock_device.clone().unwrap_or_else(|| "-".into()),
            ordinal: c.ordinal,
        })
        .collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{table}");
}

/// Print the cleanup outcome.
pub fn print_cleanup(report: &CleanupReport) {
    println!();
    println!("{}", "Cleanup".bold());
    println!(
        "  Terminated: {}  Kept: {}  Unconfirmed: {}",
        report.terminated.len(),
        report.kept.len(),
        report.failed.len()
    );
    for instance_id in &report.kept {
        print_success(&format!("kept {instance_id}"));
    }
    for instance_id in &report.failed {
        print_warning(&format!(
            "termination of {instance_id} unconfirmed; follow up manually"
        ));
    }
}
