//! PTP instance tester CLI
//!
//! Launches ephemeral EC2 instances, configures PTP hardware clock
//! support over SSH, verifies chrony synchronization, and cleans up based
//! on the results.

mod config;
mod output;
mod prompt;
mod validate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::FileConfig;
use output::OutputFormat;
use prompt::{RetentionPolicy, TerminalChooser};
use ptp_lib::{
    aggregate, AuditLog, AwsEc2, CleanupReconciler, CloudControl, FleetError, FleetRequest,
    FleetScheduler, InstanceRunner, SchedulerConfig, ShellAdapter, Ssh2Factory,
};

/// Test PTP hardware clock support across EC2 instance types
#[derive(Parser)]
#[command(name = "ptp-scout")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Comma-separated instance types with optional quantity
    /// (e.g. c7i.large,m7i.xlarge:2)
    #[arg(long, short = 't')]
    instance_types: Option<String>,

    /// Subnet to launch into (subnet-xxxxxxxx)
    #[arg(long)]
    subnet_id: Option<String>,

    /// EC2 key pair name
    #[arg(long)]
    key_name: Option<String>,

    /// Path to the SSH private key for the key pair
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// AWS region
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// AWS credentials profile
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// AMI override (defaults to the latest Amazon Linux 2023 for the
    /// instance architecture)
    #[arg(long)]
    ami_id: Option<String>,

    /// Security group for the launched instances
    #[arg(long)]
    security_group_id: Option<String>,

    /// Placement group to launch into
    #[arg(long)]
    placement_group: Option<String>,

    /// Remote SSH username
    #[arg(long)]
    ssh_username: Option<String>,

    /// Configuration file (YAML or JSON); CLI arguments override it
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Output format for the final report
    #[arg(long, short = 'f', default_value = "table")]
    format: OutputFormat,

    /// Write the full JSON report to a file
    #[arg(long)]
    output_json: Option<PathBuf>,

    /// Write the full YAML report to a file
    #[arg(long)]
    output_yaml: Option<PathBuf>,

    /// Keep every supported instance without prompting
    #[arg(long, conflicts_with = "terminate_all")]
    keep_all: bool,

    /// Terminate every instance without prompting
    #[arg(long)]
    terminate_all: bool,

    /// Answer yes to confirmation prompts
    #[arg(long, short = 'y')]
    yes: bool,

    /// Worker count (1 = sequential, the default)
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(fmt::layer().with_target(false))
        .init();

    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let request = build_request(&cli)?;

    let api = AwsEc2::connect(&request.region, request.profile.as_deref())
        .await
        .context("failed to initialize cloud clients")?;
    let audit = Arc::new(AuditLog::new());
    let cloud = Arc::new(CloudControl::new(Arc::new(api), audit));

    let factory = Ssh2Factory::new(&request.private_key_path)
        .context("failed to prepare ssh key material")?;
    let shell = Arc::new(ShellAdapter::new(Arc::new(factory)));

    let runner = Arc::new(InstanceRunner::new(cloud.clone(), shell));
    let scheduler = FleetScheduler::new(cloud.clone(), runner).with_config(SchedulerConfig {
        concurrency: cli.concurrency.max(1),
        ..SchedulerConfig::default()
    });

    let retention = if cli.keep_all {
        RetentionPolicy::KeepAll
    } else if cli.terminate_all {
        RetentionPolicy::TerminateAll
    } else {
        RetentionPolicy::Prompt
    };
    let chooser = TerminalChooser::new(cli.yes, retention);

    // A user interrupt stops new jobs from starting; in-flight pipelines
    // run to their verdict and cleanup still happens.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight work, then cleaning up");
            let _ = shutdown_tx.send(true);
        }
    });

    let started = Instant::now();
    let verdicts = match scheduler.run(&request, &chooser, shutdown_rx).await {
        Ok(verdicts) => verdicts,
        Err(FleetError::Aborted) => {
            output::print_info("aborted; no instances were launched");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    let cleanup = CleanupReconciler::new(cloud.clone())
        .reconcile(&verdicts, &chooser)
        .await;

    let report = aggregate(
        verdicts,
        request.placement_group.clone(),
        started.elapsed().as_secs_f64(),
        &cleanup.kept,
    );

    output::print_report(&report, cli.format)?;
    output::print_cleanup(&cleanup);

    if let Some(path) = &cli.output_json {
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        output::print_success(&format!("JSON report written to {}", path.display()));
    }
    if let Some(path) = &cli.output_yaml {
        std::fs::write(path, report.to_yaml()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        output::print_success(&format!("YAML report written to {}", path.display()));
    }

    let orphans = cloud.audit().orphans();
    if !orphans.is_empty() {
        output::print_warning(&format!(
            "orphaned instances left running: {}",
            orphans.join(", ")
        ));
    }

    // Per-instance PTP failures do not affect the exit code; only fatal
    // setup errors do, and those returned early above.
    Ok(())
}

/// Merge CLI arguments over the optional config file into a validated
/// fleet request.
fn build_request(cli: &Cli) -> Result<FleetRequest> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let specs = match &cli.instance_types {
        Some(list) => validate::parse_spec_list(list)?,
        None => file
            .specs()?
            .context("instance_types is required (via --instance-types or config file)")?,
    };

    let subnet_id = cli
        .subnet_id
        .clone()
        .or(file.subnet_id)
        .context("subnet_id is required")?;
    validate::validate_subnet_id(&subnet_id)?;

    let key_name = cli
        .key_name
        .clone()
        .or(file.key_name)
        .context("key_name is required")?;

    let private_key_path = cli
        .private_key
        .clone()
        .or(file.private_key_path)
        .context("private_key is required")?;
    if !private_key_path.is_file() {
        bail!(
            "private key file not found: {}",
            private_key_path.display()
        );
    }

    let region = cli
        .region
        .clone()
        .or(file.region)
        .context("region is required (via --region, AWS_REGION, or config file)")?;
    validate::validate_region(&region)?;

    let ami_id = cli.ami_id.clone().or(file.ami_id);
    if let Some(ami) = &ami_id {
        validate::validate_ami_id(ami)?;
    }

    let security_group_id = cli.security_group_id.clone().or(file.security_group_id);
    if let Some(group) = &security_group_id {
        validate::validate_security_group_id(group)?;
    }

    Ok(FleetRequest {
        specs,
        subnet_id,
        key_name,
        private_key_path,
        region,
        profile: cli.profile.clone().or(file.profile),
        ami_id,
        security_group_id,
        placement_group: cli.placement_group.clone().or(file.placement_group),
        ssh_username: cli
            .ssh_username
            .clone()
            .or(file.ssh_username)
            .unwrap_or_else(|| "ec2-user".to_string()),
    })
}
