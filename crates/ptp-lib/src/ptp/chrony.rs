//! States 4–6: device symlink, package installation, chrony refclock

use std::time::Duration;

use tracing::{info, warn};

use super::{run, transcript, ConfigFailure, COMMAND_TIMEOUT, PACKAGE_TIMEOUT};
use crate::models::{evidence, DiagnosticBundle};
use crate::ssh::RemoteSession;

/// Stable device name chrony is pointed at.
pub const PTP_SYMLINK: &str = "/dev/ptp_ena";

const UDEV_RULES_FILE: &str = "/etc/udev/rules.d/53-ec2-network-interfaces.rules";
const UDEV_RULE: &str =
    r#"SUBSYSTEM=="ptp", ATTR{clock_name}=="ena-ptp-*", SYMLINK += "ptp_ena""#;

const CHRONY_CONF: &str = "/etc/chrony.conf";
const CHRONY_BACKUP: &str = "/etc/chrony.conf.backup";

/// The single refclock line appended to chrony.conf.
pub const REFCLOCK_LINE: &str = "refclock PHC /dev/ptp_ena poll 0 delay 0.000010 prefer";

/// State 4: guarantee `/dev/ptp_ena` resolves. Device indices depend on
/// hardware initialization order, so chrony is configured against a udev
/// symlink rather than a bare `/dev/ptpN`.
pub(crate) async fn ensure_device_symlink(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> Result<bool, ConfigFailure> {
    let listing = run(session, "ls -l /dev/ptp* 2>&1", COMMAND_TIMEOUT).await?;
    diagnostics.insert(evidence::PTP_DEVICE_LISTING, listing.stdout.clone());

    if listing.stdout.contains(PTP_SYMLINK) {
        info!("Device symlink already present");
        return Ok(true);
    }

    info!(rule = UDEV_RULE, "Installing udev rule for the device symlink");
    let rule = run(
        session,
        &format!("echo '{UDEV_RULE}' | sudo tee -a {UDEV_RULES_FILE}"),
        COMMAND_TIMEOUT,
    )
    .await?;
    if !rule.success() {
        return Err(ConfigFailure::UdevRule(transcript(&rule)));
    }

    let trigger = run(
        session,
        "sudo udevadm control --reload-rules && sudo udevadm trigger",
        COMMAND_TIMEOUT,
    )
    .await?;
    if !trigger.success() {
        return Err(ConfigFailure::UdevRule(transcript(&trigger)));
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    let check = run(
        session,
        &format!("ls -l {PTP_SYMLINK} 2>&1"),
        COMMAND_TIMEOUT,
    )
    .await?;
    if check.success() && check.stdout.contains(PTP_SYMLINK) {
        info!("Device symlink created");
        Ok(true)
    } else {
        warn!("Device symlink did not appear after udev trigger");
        Ok(false)
    }
}

/// State 5: make sure chrony and ethtool are installed. The package
/// manager is idempotent about already-installed packages.
pub(crate) async fn install_packages(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> Result<(), ConfigFailure> {
    info!("Ensuring chrony and ethtool are installed");
    let outcome = run(
        session,
        "sudo yum install -y chrony ethtool",
        PACKAGE_TIMEOUT,
    )
    .await?;

    if !outcome.success() {
        diagnostics.insert("package_install", transcript(&outcome));
        return Err(ConfigFailure::PackageInstall);
    }
    Ok(())
}

/// State 6: point chrony at the hardware clock. The original configuration
/// is preserved at `/etc/chrony.conf.backup`; the refclock line is only
/// appended once.
pub(crate) async fn configure_refclock(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> Result<(), ConfigFailure> {
    let backup = run(
        session,
        &format!("test -f {CHRONY_BACKUP} || sudo cp {CHRONY_CONF} {CHRONY_BACKUP}"),
        COMMAND_TIMEOUT,
    )
    .await?;
    if !backup.success() {
        return Err(ConfigFailure::ChronyConfig(format!(
            "could not back up {CHRONY_CONF}: {}",
            transcript(&backup)
        )));
    }

    let check = run(
        session,
        &format!("grep -q 'refclock PHC' {CHRONY_CONF} && echo present || echo absent"),
        COMMAND_TIMEOUT,
    )
    .await?;

    if check.stdout.contains("absent") {
        info!(line = REFCLOCK_LINE, "Appending PHC refclock to chrony.conf");
        let append = run(
            session,
            &format!("echo '{REFCLOCK_LINE}' | sudo tee -a {CHRONY_CONF}"),
            COMMAND_TIMEOUT,
        )
        .await?;
        if !append.success() {
            return Err(ConfigFailure::ChronyConfig(transcript(&append)));
        }
    } else {
        info!("PHC refclock already configured");
    }

    let restart = run(
        session,
        "sudo systemctl restart chronyd && sudo systemctl enable chronyd",
        Duration::from_secs(60),
    )
    .await?;
    if !restart.success() {
        diagnostics.insert("chronyd_restart", transcript(&restart));
        return Err(ConfigFailure::ChronyConfig(format!(
            "chronyd restart failed: {}",
            restart.stderr.trim()
        )));
    }

    info!("chronyd restarted and enabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refclock_line_shape() {
        assert!(REFCLOCK_LINE.starts_with("refclock PHC /dev/ptp_ena"));
        assert!(REFCLOCK_LINE.contains("poll 0"));
        assert!(REFCLOCK_LINE.contains("delay 0.000010"));
        assert!(REFCLOCK_LINE.ends_with("prefer"));
    }

    #[test]
    fn test_udev_rule_shape() {
        assert!(UDEV_RULE.contains(r#"SUBSYSTEM=="ptp""#));
        assert!(UDEV_RULE.contains(r#"ATTR{clock_name}=="ena-ptp-*""#));
        assert!(UDEV_RULE.contains(r#"SYMLINK += "ptp_ena""#));
        // Single quotes would break the remote echo wrapping.
        assert!(!UDEV_RULE.contains('\''));
    }
}
