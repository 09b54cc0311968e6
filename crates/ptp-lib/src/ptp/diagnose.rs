//! Legacy service diagnostics and recommendation generation
//!
//! The chrony-only path is the verification of record; these checks only
//! run when a ptp4l/phc2sys systemd unit is actually managed on the host
//! (images configured by older tooling). Their output feeds the
//! recommendation strings surfaced in failed verdicts.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::COMMAND_TIMEOUT;
use crate::models::{evidence, DiagnosticBundle};
use crate::ssh::RemoteSession;

const SERVICES: &[&str] = &["ptp4l", "phc2sys"];

/// Substring systemd prints for a unit stuck in a restart loop.
const CRASH_LOOP_MARKER: &str = "activating (auto-restart)";

fn exit_status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"code=exited, status=(\d+)").expect("valid exit status pattern")
    })
}

/// Capture status, logs, linker dependencies and a dry-run for any managed
/// PTP daemon, then derive recommendations.
pub(crate) async fn service_diagnostics(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) {
    for service in SERVICES {
        let probe = session
            .exec(
                &format!("systemctl list-unit-files {service}.service --no-legend 2>/dev/null"),
                COMMAND_TIMEOUT,
            )
            .await;
        if !probe.success() || probe.stdout.trim().is_empty() {
            debug!(service = %service, "No managed unit, skipping service diagnostics");
            continue;
        }

        let status = session
            .exec(
                &format!("systemctl status {service} --no-pager 2>&1"),
                COMMAND_TIMEOUT,
            )
            .await;
        diagnostics.append(
            evidence::SERVICE_STATUS,
            &format!("--- {service} ---\n{}", status.stdout.trim_end()),
        );

        let crash_looping = status.stdout.contains(CRASH_LOOP_MARKER);
        let exit_status = extract_exit_status(&status.stdout);

        let logs = session
            .exec(
                &format!("sudo journalctl -u {service} -n 50 --no-pager 2>&1"),
                COMMAND_TIMEOUT,
            )
            .await;
        diagnostics.append(
            evidence::SERVICE_LOGS,
            &format!("--- {service} ---\n{}", logs.stdout.trim_end()),
        );

        let binary = session
            .exec(&format!("command -v {service}"), COMMAND_TIMEOUT)
            .await;
        let mut dependencies = String::new();
        if binary.success() && !binary.stdout.trim().is_empty() {
            let deps = session
                .exec(
                    &format!("ldd {} 2>&1", binary.stdout.trim()),
                    COMMAND_TIMEOUT,
                )
                .await;
            dependencies = deps.stdout;
            diagnostics.append(
                evidence::SERVICE_DEPS,
                &format!("--- {service} ---\n{}", dependencies.trim_end()),
            );
        }

        // A dry-run invocation shows immediate startup failures without
        // touching the managed unit.
        let dry_run = session
            .exec(&format!("sudo {service} -v 2>&1 | head -5"), COMMAND_TIMEOUT)
            .await;
        diagnostics.append(
            evidence::SERVICE_STATUS,
            &format!("--- {service} dry-run ---\n{}", dry_run.stdout.trim_end()),
        );

        let recommendations =
            recommendations(service, crash_looping, exit_status, &dependencies);
        if !recommendations.is_empty() {
            diagnostics.append(evidence::RECOMMENDATIONS, &recommendations.join("\n"));
        }
    }
}

/// Pull the last exit status out of a systemd status blob.
pub(crate) fn extract_exit_status(status: &str) -> Option<i32> {
    exit_status_pattern()
        .captures(status)
        .and_then(|captures| captures[1].parse().ok())
}

/// Turn raw service evidence into actionable recommendation strings.
pub(crate) fn recommendations(
    service: &str,
    crash_looping: bool,
    exit_status: Option<i32>,
    dependencies: &str,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if crash_looping {
        recommendations.push(format!(
            "{service} is crash-looping; inspect `journalctl -u {service}` for the failing invocation"
        ));
    }

    if let Some(code) = exit_status {
        if code != 0 {
            recommendations.push(format!("{service} last exited with status {code}"));
        }
    }

    for line in dependencies.lines() {
        if line.contains("=> not found") {
            if let Some(library) = line.split_whitespace().next() {
                recommendations.push(format!("missing library {library} required by {service}"));
            }
        }
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_CRASH_LOOP: &str = "\
● ptp4l.service - Precision Time Protocol (PTP) daemon
   Loaded: loaded (/etc/systemd/system/ptp4l.service; enabled)
   Active: activating (auto-restart) (Result: exit-code) since Mon 2025-06-02
  Process: 2231 ExecStart=/usr/local/sbin/ptp4l -f /etc/ptp4l.conf (code=exited, status=127)
";

    #[test]
    fn test_extract_exit_status() {
        assert_eq!(extract_exit_status(STATUS_CRASH_LOOP), Some(127));
        assert_eq!(extract_exit_status("Active: active (running)"), None);
    }

    #[test]
    fn test_crash_loop_recommendation() {
        let recs = recommendations("ptp4l", true, Some(127), "");
        assert_eq!(recs.len(), 2);
        assert!(recs[0].contains("crash-looping"));
        assert!(recs[1].contains("status 127"));
    }

    #[test]
    fn test_missing_library_recommendation() {
        let deps = "\
\tlinux-vdso.so.1 (0x00007ffc63bf0000)
\tlibm.so.6 => /lib64/libm.so.6 (0x00007f2a1c000000)
\tlibfancy.so.2 => not found
";
        let recs = recommendations("ptp4l", false, Some(0), deps);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0], "missing library libfancy.so.2 required by ptp4l");
    }

    #[test]
    fn test_healthy_service_no_recommendations() {
        assert!(recommendations("phc2sys", false, None, "").is_empty());
    }
}
