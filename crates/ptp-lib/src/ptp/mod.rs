//! PTP configuration protocol
//!
//! A linear state machine executed remotely over a shell session:
//!
//! 1. detect-arch: record the kernel-reported architecture
//! 2. check-driver-version: parse the ENA module version; < 2.10.0 is a
//!    clean skip, not an error
//! 3. ensure-phc-enabled: guarantee the driver exposes a PTP hardware
//!    clock; may trigger a driver rebuild whose reload drops the session
//! 4. ensure-device-symlink: /dev/ptp_ena via a udev rule
//! 5. install-chrony: idempotent package installation
//! 6. configure-chrony: one PHC refclock line, restart, enable
//! 7. stabilize: bounded settle interval
//! 8. verify: diagnostic-only evidence collection
//!
//! Any state may short-circuit the machine to verification with a
//! classified failure; evidence gathered so far rides along. The session
//! drop in state 3 is surfaced to the caller as
//! [`PhcOutcome::EnabledNeedsReconnect`]; the protocol never reconnects
//! on its own. The instance runner owns that policy.

pub(crate) mod chrony;
pub(crate) mod diagnose;
pub(crate) mod driver;
pub(crate) mod phc;
pub(crate) mod verify;

pub use phc::{fetch_reload_log, verify_post_reload, PhcOutcome, RELOAD_LOG_PATH, RELOAD_SCRIPT_PATH};
pub use verify::verify;

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::models::{Architecture, CommandOutcome, DiagnosticBundle, DriverInfo, OutcomeKind};
use crate::ssh::RemoteSession;

/// Timeout for ordinary diagnostic commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for package-manager operations.
pub const PACKAGE_TIMEOUT: Duration = Duration::from_secs(300);
/// Timeout for driver source checkout.
pub const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(180);
/// Timeout for driver compilation.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(300);
/// Settle interval for chrony to poll the hardware clock.
pub const STABILIZE_INTERVAL: Duration = Duration::from_secs(5);

/// Classified failure that short-circuits the state machine.
#[derive(Debug, Error)]
pub enum ConfigFailure {
    #[error("driver module probe failed: {0}")]
    DriverProbe(String),

    #[error("build dependency installation failed")]
    BuildDeps,

    #[error("driver source checkout failed")]
    SourceCheckout,

    #[error("driver build failed")]
    DriverBuild,

    #[error("driver install failed: {0}")]
    DriverInstall(String),

    #[error("failed to stage reload script: {0}")]
    ReloadStaging(String),

    #[error("package installation failed")]
    PackageInstall,

    #[error("udev rule installation failed: {0}")]
    UdevRule(String),

    #[error("chrony configuration failed: {0}")]
    ChronyConfig(String),

    #[error("remote command '{command}' {kind}")]
    Interrupted {
        command: String,
        kind: &'static str,
    },
}

/// Everything states 1–3 established.
#[derive(Debug)]
pub struct Prepared {
    pub architecture: Architecture,
    pub interface: String,
    pub driver: DriverInfo,
    pub phc: PhcOutcome,
}

/// Result of running states 1–3.
#[derive(Debug)]
pub enum Prepare {
    /// Proceed to states 4–7 (after a reconnect when the outcome says so).
    Ready(Prepared),
    /// Driver below the minimum version; skip configuration entirely.
    SkipIncompatible(DriverInfo),
    /// A state failed; go straight to verification with this classification.
    Failed {
        driver: DriverInfo,
        failure: ConfigFailure,
    },
}

/// Run states 1–3 against a fresh session.
pub async fn prepare(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> Prepare {
    // State 1: architecture and primary interface.
    let architecture = driver::detect_architecture(session).await;
    let interface = driver::detect_interface(session).await;
    diagnostics.insert(crate::models::evidence::DETECTED_INTERFACE, interface.clone());
    info!(architecture = %architecture, interface = %interface, "Remote host identified");

    // State 2: driver version gate.
    let driver = match driver::probe(session, diagnostics).await {
        Ok(info) => info,
        Err(failure) => {
            warn!(error = %failure, "Driver probe failed");
            return Prepare::Failed {
                driver: DriverInfo::unknown(),
                failure,
            };
        }
    };

    if !driver.compatible {
        info!(
            version = driver.version_string().unwrap_or("unknown"),
            "Driver below minimum version for hardware clock support, skipping configuration"
        );
        return Prepare::SkipIncompatible(driver);
    }

    // State 3: hardware clock enablement.
    match phc::ensure_phc_enabled(session, &interface, diagnostics).await {
        Ok(phc) => Prepare::Ready(Prepared {
            architecture,
            interface,
            driver,
            phc,
        }),
        Err(failure) => {
            warn!(error = %failure, "Hardware clock enablement failed");
            Prepare::Failed { driver, failure }
        }
    }
}

/// Run states 4–7 against a valid session.
pub async fn apply(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> Result<(), ConfigFailure> {
    // State 4: stable device name.
    if !chrony::ensure_device_symlink(session, diagnostics).await? {
        warn!("Device symlink could not be verified, continuing");
    }

    // State 5.
    chrony::install_packages(session, diagnostics).await?;

    // State 6.
    chrony::configure_refclock(session, diagnostics).await?;

    // State 7.
    info!(
        settle_secs = STABILIZE_INTERVAL.as_secs(),
        "Waiting for chrony to poll the hardware clock"
    );
    tokio::time::sleep(STABILIZE_INTERVAL).await;

    Ok(())
}

/// Run a command, turning timeouts and transport losses into classified
/// failures. Non-zero exits pass through for the caller to interpret.
pub(crate) async fn run(
    session: &mut dyn RemoteSession,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutcome, ConfigFailure> {
    let outcome = session.exec(command, timeout).await;
    match outcome.kind {
        OutcomeKind::Timeout => Err(ConfigFailure::Interrupted {
            command: command.to_string(),
            kind: "timed out",
        }),
        OutcomeKind::TransportError => Err(ConfigFailure::Interrupted {
            command: command.to_string(),
            kind: "lost its transport",
        }),
        _ => Ok(outcome),
    }
}

/// Condensed transcript of a failed command for the diagnostic bundle.
pub(crate) fn transcript(outcome: &CommandOutcome) -> String {
    let mut text = String::new();
    if !outcome.stdout.trim().is_empty() {
        text.push_str(outcome.stdout.trim_end());
    }
    if !outcome.stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(outcome.stderr.trim_end());
    }
    if text.is_empty() {
        text.push_str(&format!("(no output, exit code {})", outcome.exit_code));
    }
    text
}
