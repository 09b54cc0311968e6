//! Remote host identification and ENA driver probing

use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use super::{run, ConfigFailure, COMMAND_TIMEOUT};
use crate::models::{evidence, Architecture, DiagnosticBundle, DriverInfo, MIN_DRIVER_VERSION};
use crate::ssh::RemoteSession;

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)").expect("valid version pattern"))
}

/// State 1: ask the kernel for the machine architecture.
pub(crate) async fn detect_architecture(session: &mut dyn RemoteSession) -> Architecture {
    let outcome = session.exec("uname -m", COMMAND_TIMEOUT).await;
    if !outcome.success() {
        warn!(stderr = %outcome.stderr.trim(), "Architecture detection failed");
        return Architecture::Unknown;
    }
    let architecture = Architecture::from_uname(&outcome.stdout);
    if architecture == Architecture::Unknown {
        warn!(machine = %outcome.stdout.trim(), "Unrecognized machine name");
    }
    architecture
}

/// Find the primary ENA interface. Nitro instances use predictable names
/// like `enp39s0`; fall back to the first non-loopback UP interface, then
/// `eth0` for very old images.
pub(crate) async fn detect_interface(session: &mut dyn RemoteSession) -> String {
    let outcome = session
        .exec(
            "ip -o link show | grep -E 'enp[0-9]+s[0-9]+' | head -1 | awk '{print $2}' | tr -d ':'",
            COMMAND_TIMEOUT,
        )
        .await;
    if outcome.success() && !outcome.stdout.trim().is_empty() {
        return outcome.stdout.trim().to_string();
    }

    let outcome = session
        .exec(
            "ip -o link show up | grep -v 'lo:' | head -1 | awk '{print $2}' | tr -d ':'",
            COMMAND_TIMEOUT,
        )
        .await;
    if outcome.success() && !outcome.stdout.trim().is_empty() {
        return outcome.stdout.trim().to_string();
    }

    warn!("Could not detect network interface, falling back to eth0");
    "eth0".to_string()
}

/// State 2: read and parse the installed ENA module version.
pub(crate) async fn probe(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> Result<DriverInfo, ConfigFailure> {
    let outcome = run(
        session,
        "modinfo ena | grep '^version:' | awk '{print $2}'",
        COMMAND_TIMEOUT,
    )
    .await?;

    if !outcome.success() {
        return Err(ConfigFailure::DriverProbe(
            outcome.stderr.trim().to_string(),
        ));
    }

    let raw = outcome.stdout.trim();
    if raw.is_empty() {
        return Err(ConfigFailure::DriverProbe(
            "no version in module information".into(),
        ));
    }

    let info = parse(raw);
    diagnostics.insert(evidence::DRIVER_INFO, format!("version: {raw}"));
    info!(
        version = %raw,
        compatible = info.compatible,
        "ENA driver version detected"
    );
    Ok(info)
}

/// Parse a raw version string like `2.10.0` or `2.10.0g` into a triple and
/// compare it against the minimum required version.
pub fn parse(raw: &str) -> DriverInfo {
    let version = version_pattern().captures(raw).and_then(|captures| {
        let major = captures[1].parse().ok()?;
        let minor = captures[2].parse().ok()?;
        let patch = captures[3].parse().ok()?;
        Some((major, minor, patch))
    });

    let compatible = version.map_or(false, |triple| triple >= MIN_DRIVER_VERSION);

    DriverInfo {
        version,
        compatible,
        raw: raw.to_string(),
    }
}
