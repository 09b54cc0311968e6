//! State 8: diagnostic-only verification
//!
//! Collects the clock evidence the verdict is built from. Nothing in here
//! mutates remote state.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use super::phc::SYSFS_CLOCKS_CMD;
use super::{chrony, diagnose, driver, COMMAND_TIMEOUT};
use crate::models::{evidence, ClockEvidence, DiagnosticBundle, DriverInfo};
use crate::ssh::RemoteSession;

fn clock_index_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"/sys/class/ptp/(ptp\d+)/clock_name").expect("valid clock index pattern")
    })
}

fn tracking_offset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"System time\s+:\s+([0-9.]+) seconds (fast|slow)")
            .expect("valid tracking pattern")
    })
}

/// Collect [`ClockEvidence`] from a live session. `diagnostics` carries
/// everything earlier states recorded and is folded into the result.
pub async fn verify(
    session: &mut dyn RemoteSession,
    driver_info: &DriverInfo,
    mut diagnostics: DiagnosticBundle,
) -> ClockEvidence {
    info!("Verifying time synchronization stack");

    // Registered hardware clocks.
    let clocks = session.exec(SYSFS_CLOCKS_CMD, COMMAND_TIMEOUT).await;
    diagnostics.insert(evidence::PTP_SYSFS, clocks.stdout.clone());
    let hardware_clock_present = clocks.success() && clocks.stdout.contains("ena-ptp");

    // Device nodes and the stable symlink.
    let listing = session.exec("ls -l /dev/ptp* 2>&1", COMMAND_TIMEOUT).await;
    diagnostics.insert(evidence::PTP_DEVICE_LISTING, listing.stdout.clone());
    let ptp_ena_symlink_present = listing.stdout.contains(chrony::PTP_SYMLINK);

    let clock_device = if hardware_clock_present {
        if ptp_ena_symlink_present {
            Some(chrony::PTP_SYMLINK.to_string())
        } else {
            clock_index_pattern()
                .captures(&clocks.stdout)
                .map(|captures| format!("/dev/{}", &captures[1]))
        }
    } else {
        None
    };

    // Interface hardware timestamping capabilities.
    let interface = driver::detect_interface(session).await;
    diagnostics.insert(evidence::DETECTED_INTERFACE, interface.clone());
    let caps = session
        .exec(&format!("sudo ethtool -T {interface} 2>&1"), COMMAND_TIMEOUT)
        .await;
    diagnostics.insert(evidence::HWSTAMP_CAPS, caps.stdout.clone());

    // Is the PHC chrony's preferred source?
    let sources = session.exec("chronyc sources 2>&1", COMMAND_TIMEOUT).await;
    diagnostics.insert(evidence::CHRONY_SOURCES, sources.stdout.clone());
    let chrony_using_phc = sources.success() && phc_preferred(&sources.stdout);

    let tracking = session.exec("chronyc tracking 2>&1", COMMAND_TIMEOUT).await;
    diagnostics.insert(evidence::CHRONY_TRACKING, tracking.stdout.clone());
    let chrony_synchronized = tracking.success() && tracking.stdout.contains("Reference ID");
    let time_offset_ns = parse_tracking_offset(&tracking.stdout);

    if chrony_using_phc {
        info!(
            clock_device = clock_device.as_deref().unwrap_or("-"),
            offset_ns = time_offset_ns,
            "chrony is using the hardware clock as preferred source"
        );
    } else {
        warn!("chrony is not using the hardware clock as preferred source");
    }

    // Legacy extension: if a PTP daemon is managed as a service on this
    // host, capture its health for the recommendation generator.
    diagnose::service_diagnostics(session, &mut diagnostics).await;

    if !driver_info.compatible {
        diagnostics.insert(
            evidence::DRIVER_INFO,
            format!(
                "version: {} (below minimum 2.10.0)",
                driver_info.version_string().unwrap_or("unknown")
            ),
        );
    }

    ClockEvidence {
        hardware_clock_present,
        ptp_ena_symlink_present,
        chrony_using_phc,
        chrony_synchronized,
        clock_device,
        time_offset_ns,
        diagnostics,
    }
}

/// True when a PHC refclock entry carries chrony's "currently selected"
/// marker. Refclocks print with mode `#`; the `*` in the state column
/// marks the source the daemon is synchronized to.
pub(crate) fn phc_preferred(sources: &str) -> bool {
    sources.lines().any(|line| {
        let mut chars = line.chars();
        matches!((chars.next(), chars.next()), (Some('#'), Some('*'))) && line.contains("PHC")
    })
}

/// Extract the current offset from `chronyc tracking`, in nanoseconds.
/// Positive means the system clock is ahead of the reference.
pub(crate) fn parse_tracking_offset(tracking: &str) -> Option<f64> {
    let captures = tracking_offset_pattern().captures(tracking)?;
    let seconds: f64 = captures[1].parse().ok()?;
    let nanoseconds = seconds * 1e9;
    Some(if &captures[2] == "slow" {
        -nanoseconds
    } else {
        nanoseconds
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCES_PREFERRED: &str = "\
MS Name/IP address         Stratum Poll Reach LastRx Last sample
===============================================================================
#* PHC0                          0   0   377     1     +2ns[   +1ns] +/- 5031ns
^- 169.254.169.123               3   4   377    16   +18us[  +18us] +/-  451us
";

    const SOURCES_NOT_PREFERRED: &str = "\
MS Name/IP address         Stratum Poll Reach LastRx Last sample
===============================================================================
#? PHC0                          0   0     0     -     +0ns[   +0ns] +/-    0ns
^* 169.254.169.123               3   4   377    16   +18us[  +18us] +/-  451us
";

    const TRACKING_FAST: &str = "\
Reference ID    : 50484330 (PHC0)
Stratum         : 1
System time     : 0.000000015 seconds fast of NTP time
RMS offset      : 0.000000031 seconds
";

    const TRACKING_SLOW: &str = "\
Reference ID    : A9FEA97B (169.254.169.123)
System time     : 0.000002500 seconds slow of NTP time
";

    #[test]
    fn test_phc_preferred_marker() {
        assert!(phc_preferred(SOURCES_PREFERRED));
        assert!(!phc_preferred(SOURCES_NOT_PREFERRED));
        assert!(!phc_preferred(""));
    }

    #[test]
    fn test_phc_preferred_ignores_ntp_selection() {
        // A selected NTP server must not count as a preferred PHC.
        let ntp_only = "^* 169.254.169.123  3  4  377  16  +18us[+18us] +/- 451us";
        assert!(!phc_preferred(ntp_only));
    }

    #[test]
    fn test_parse_tracking_offset_fast() {
        let offset = parse_tracking_offset(TRACKING_FAST).unwrap();
        assert!((offset - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_tracking_offset_slow() {
        let offset = parse_tracking_offset(TRACKING_SLOW).unwrap();
        assert!((offset + 2500.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_tracking_offset_missing() {
        assert!(parse_tracking_offset("no tracking output").is_none());
    }

    #[test]
    fn test_clock_index_extraction() {
        let captures = clock_index_pattern()
            .captures("/sys/class/ptp/ptp3/clock_name: ena-ptp-0000:00:05.0")
            .unwrap();
        assert_eq!(&captures[1], "ptp3");
    }
}
