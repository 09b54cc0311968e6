//! State 3: hardware clock enablement, including the driver rebuild whose
//! reload drops the session
//!
//! Three outcomes:
//! - the clock is already registered (nothing to do, session valid)
//! - a devlink parameter flip enabled it online (session valid)
//! - the driver was rebuilt and a staged reload was fired (session invalid;
//!   the caller must reconnect and run [`verify_post_reload`])

use tracing::{info, warn};

use super::{driver, run, transcript, ConfigFailure, BUILD_TIMEOUT, CHECKOUT_TIMEOUT, COMMAND_TIMEOUT, PACKAGE_TIMEOUT};
use crate::models::{evidence, DiagnosticBundle};
use crate::ssh::RemoteSession;
use std::time::Duration;

/// Staged reload script location on the remote host.
pub const RELOAD_SCRIPT_PATH: &str = "/tmp/ena_phc_reload.sh";
/// Reload forensic log location on the remote host.
pub const RELOAD_LOG_PATH: &str = "/tmp/ena_phc_reload.log";

const DRIVER_SOURCE_DIR: &str = "/tmp/amzn-drivers";
const DRIVER_BUILD_DIR: &str = "/tmp/amzn-drivers/kernel/linux/ena";

/// Lists every registered PTP clock name via sysfs.
pub(crate) const SYSFS_CLOCKS_CMD: &str =
    r#"for f in /sys/class/ptp/*/clock_name; do [ -f "$f" ] && echo "$f: $(cat $f)"; done 2>/dev/null"#;

/// How state 3 left the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhcOutcome {
    /// A hardware clock was already registered; the session is still valid.
    AlreadyEnabled,
    /// Enabled through an online mechanism; the session is still valid.
    EnabledLive,
    /// A module reload was fired; the current session must be treated as
    /// invalid and reopened before anything else runs.
    EnabledNeedsReconnect,
}

pub(crate) fn clock_registered(sysfs_listing: &str) -> bool {
    sysfs_listing.contains("ena-ptp")
}

/// Guarantee the driver exposes a PTP hardware clock device.
pub(crate) async fn ensure_phc_enabled(
    session: &mut dyn RemoteSession,
    interface: &str,
    diagnostics: &mut DiagnosticBundle,
) -> Result<PhcOutcome, ConfigFailure> {
    // Baseline capture before touching anything.
    let clocks = run(session, SYSFS_CLOCKS_CMD, COMMAND_TIMEOUT).await?;
    diagnostics.insert(evidence::PTP_SYSFS, clocks.stdout.clone());

    if clock_registered(&clocks.stdout) {
        info!("Hardware clock already registered");
        return Ok(PhcOutcome::AlreadyEnabled);
    }

    let caps = run(
        session,
        &format!("sudo ethtool -T {interface} 2>&1 | grep -E 'PTP Hardware Clock|hardware-transmit'"),
        COMMAND_TIMEOUT,
    )
    .await?;
    diagnostics.insert(evidence::HWSTAMP_CAPS, caps.stdout.clone());

    // Make sure the generic PTP plumbing is loaded; both modules may be
    // built into the kernel, in which case modprobe is a no-op.
    let modules = run(session, "sudo modprobe ptp && sudo modprobe pps_core", COMMAND_TIMEOUT).await?;
    if !modules.success() {
        info!("PTP modules not loadable as modules, assuming built-in");
    }

    if try_devlink_enable(session, diagnostics).await? {
        return Ok(PhcOutcome::EnabledLive);
    }

    info!("Falling back to driver rebuild with hardware clock support");
    rebuild_driver(session, diagnostics).await?;
    stage_reload(session).await?;
    Ok(PhcOutcome::EnabledNeedsReconnect)
}

/// Try the online path: a devlink parameter flip plus a devlink-scoped
/// reload, which does not tear down the interface the session rides on.
async fn try_devlink_enable(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> Result<bool, ConfigFailure> {
    let pci = run(
        session,
        "lspci -D | grep 'Ethernet controller.*ENA' | awk '{print $1}'",
        COMMAND_TIMEOUT,
    )
    .await?;
    if !pci.success() || pci.stdout.trim().is_empty() {
        warn!("Could not locate ENA device on the PCI bus");
        return Ok(false);
    }
    let address = pci.stdout.trim().to_string();

    let set = run(
        session,
        &format!(
            "sudo devlink dev param set pci/{address} name enable_phc value true cmode driverinit 2>&1"
        ),
        COMMAND_TIMEOUT,
    )
    .await?;
    if !set.success() {
        info!("devlink parameter path unavailable");
        return Ok(false);
    }

    let reload = run(
        session,
        &format!("sudo devlink dev reload pci/{address}"),
        Duration::from_secs(60),
    )
    .await?;
    if !reload.success() {
        warn!(stderr = %reload.stderr.trim(), "devlink reload failed");
        return Ok(false);
    }

    tokio::time::sleep(Duration::from_secs(3)).await;

    let clocks = run(session, SYSFS_CLOCKS_CMD, COMMAND_TIMEOUT).await?;
    diagnostics.insert(evidence::PTP_SYSFS, clocks.stdout.clone());
    if clock_registered(&clocks.stdout) {
        info!("Hardware clock enabled via devlink");
        Ok(true)
    } else {
        warn!("devlink reload completed but no hardware clock appeared");
        Ok(false)
    }
}

/// Build and install the vendor driver with hardware clock support
/// compiled in. The stock module on stock images ships without it.
async fn rebuild_driver(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> Result<(), ConfigFailure> {
    // Kernel prerequisites are informational; a missing config only means
    // the build may produce a module without the parameter.
    let config = session
        .exec(
            "grep -E 'CONFIG_PTP_1588_CLOCK|CONFIG_PPS' /boot/config-$(uname -r) 2>/dev/null",
            COMMAND_TIMEOUT,
        )
        .await;
    if config.success() && !config.stdout.contains("CONFIG_PTP_1588_CLOCK=y")
        && !config.stdout.contains("CONFIG_PTP_1588_CLOCK=m")
    {
        warn!("Kernel may lack PTP clock support; rebuild may not help");
    }

    info!("Installing build dependencies");
    let deps = run(
        session,
        "sudo yum install -y kernel-devel-$(uname -r) gcc make git",
        PACKAGE_TIMEOUT,
    )
    .await?;
    if !deps.success() {
        diagnostics.insert("build_deps", transcript(&deps));
        return Err(ConfigFailure::BuildDeps);
    }

    info!("Cloning driver sources");
    let clone = run(
        session,
        &format!(
            "cd /tmp && rm -rf {DRIVER_SOURCE_DIR} && git clone https://github.com/amzn/amzn-drivers.git"
        ),
        CHECKOUT_TIMEOUT,
    )
    .await?;
    if !clone.success() {
        diagnostics.insert("driver_checkout", transcript(&clone));
        return Err(ConfigFailure::SourceCheckout);
    }

    info!("Building driver with hardware clock support");
    let mut build = run(
        session,
        &format!("cd {DRIVER_BUILD_DIR} && make clean && make ENA_PHC_INCLUDE=1"),
        BUILD_TIMEOUT,
    )
    .await?;
    if !build.success() {
        warn!("Primary build flags failed, retrying with EXTRA_CFLAGS");
        build = run(
            session,
            &format!(
                r#"cd {DRIVER_BUILD_DIR} && make clean && make EXTRA_CFLAGS="-DENA_PHC_INCLUDE=1""#
            ),
            BUILD_TIMEOUT,
        )
        .await?;
    }
    if !build.success() {
        diagnostics.insert("driver_build", transcript(&build));
        return Err(ConfigFailure::DriverBuild);
    }

    // The built module should expose the clock parameter; a module without
    // it will silently ignore the load-time setting.
    let parameter = run(
        session,
        &format!("modinfo {DRIVER_BUILD_DIR}/ena.ko 2>/dev/null | grep -i 'parm.*phc'"),
        COMMAND_TIMEOUT,
    )
    .await?;
    if !parameter.success() || parameter.stdout.trim().is_empty() {
        warn!("Built module does not advertise a phc parameter; the reload may change nothing");
    }

    let kernel = run(session, "uname -r", COMMAND_TIMEOUT).await?;
    if !kernel.success() {
        return Err(ConfigFailure::DriverInstall(
            "could not read kernel release".into(),
        ));
    }
    let module_dir = format!(
        "/lib/modules/{}/kernel/drivers/amazon/net/ena",
        kernel.stdout.trim()
    );

    info!(module_dir = %module_dir, "Installing built driver");
    for command in [
        format!("sudo mkdir -p {module_dir}"),
        format!("sudo cp {DRIVER_BUILD_DIR}/ena.ko {module_dir}/"),
        "sudo depmod -a".to_string(),
    ] {
        let outcome = run(session, &command, Duration::from_secs(60)).await?;
        if !outcome.success() {
            return Err(ConfigFailure::DriverInstall(transcript(&outcome)));
        }
    }

    Ok(())
}

/// Forensic reload script. Runs disowned so it survives the session drop,
/// captures state before and after the unload/load cycle, and tees
/// everything to [`RELOAD_LOG_PATH`] for retrieval after reconnect.
const RELOAD_SCRIPT: &str = r#"#!/bin/bash
exec > /tmp/ena_phc_reload.log 2>&1
echo "=== ena phc reload started: $(date) ==="
echo "[pre] driver version:"
modinfo ena | grep '^version:'
echo "[pre] ptp devices:"
ls -la /dev/ptp* 2>&1
for f in /sys/class/ptp/*/clock_name; do [ -f "$f" ] && echo "$f: $(cat $f)"; done
echo "[pre] module parameters:"
ls /sys/module/ena/parameters/ 2>&1
echo "[unload] rmmod ena"
rmmod ena
echo "rmmod exit: $?"
sleep 2
echo "[load] modprobe ena phc_enable=1"
modprobe ena phc_enable=1
echo "modprobe exit: $?"
sleep 3
echo "[post] driver version:"
modinfo ena | grep '^version:'
echo "[post] ptp devices:"
ls -la /dev/ptp* 2>&1
for f in /sys/class/ptp/*/clock_name; do [ -f "$f" ] && echo "$f: $(cat $f)"; done
echo "[post] phc_enable:"
cat /sys/module/ena/parameters/phc_enable 2>&1
echo "[post] kernel log:"
dmesg | grep -i 'ena\|ptp' | tail -20
echo "=== ena phc reload finished: $(date) ==="
"#;

/// Write the reload script and fire it in a disowned background process.
/// The interface goes down mid-script, so the launch command's own outcome
/// is unreliable and deliberately ignored.
async fn stage_reload(session: &mut dyn RemoteSession) -> Result<(), ConfigFailure> {
    let write = run(
        session,
        &format!(
            "cat > {RELOAD_SCRIPT_PATH} <<'EOFSCRIPT'\n{RELOAD_SCRIPT}EOFSCRIPT\nchmod +x {RELOAD_SCRIPT_PATH}"
        ),
        COMMAND_TIMEOUT,
    )
    .await?;
    if !write.success() {
        return Err(ConfigFailure::ReloadStaging(transcript(&write)));
    }

    info!("Firing staged driver reload; the session will drop");
    let _ = session
        .exec(
            &format!("nohup sudo bash {RELOAD_SCRIPT_PATH} > /dev/null 2>&1 &"),
            Duration::from_secs(5),
        )
        .await;

    Ok(())
}

/// Retrieve the reload log after reconnecting and attach it verbatim.
pub async fn fetch_reload_log(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) {
    let outcome = session
        .exec(&format!("cat {RELOAD_LOG_PATH} 2>&1"), COMMAND_TIMEOUT)
        .await;

    if outcome.success() && !outcome.stdout.trim().is_empty() {
        diagnostics.insert(evidence::RELOAD_LOG, outcome.stdout);
    } else {
        warn!("No reload log found on the remote host");
        diagnostics.insert(evidence::RELOAD_LOG, "no reload log found");
    }
}

/// Post-reload verification: the authority on hardware clock presence
/// after a reload. Earlier evidence about absence is stale by definition.
///
/// Four checks: the device node exists, the sysfs clock name matches the
/// vendor pattern, the module parameter reads back enabled, and the
/// interface reports hardware timestamping capabilities. The first two
/// decide the result; the last two are advisory (older parameter-less
/// builds can still expose a working clock).
pub async fn verify_post_reload(
    session: &mut dyn RemoteSession,
    diagnostics: &mut DiagnosticBundle,
) -> bool {
    let nodes = session
        .exec("ls -la /dev/ptp* 2>&1", COMMAND_TIMEOUT)
        .await;
    diagnostics.insert(evidence::PTP_DEVICE_LISTING, nodes.stdout.clone());
    let device_present = nodes.success() && nodes.stdout.contains("/dev/ptp");

    let clocks = session.exec(SYSFS_CLOCKS_CMD, COMMAND_TIMEOUT).await;
    diagnostics.insert(evidence::PTP_SYSFS, clocks.stdout.clone());
    let clock_named = clock_registered(&clocks.stdout);

    let parameter = session
        .exec(
            "cat /sys/module/ena/parameters/phc_enable 2>&1",
            COMMAND_TIMEOUT,
        )
        .await;
    let parameter_enabled = parameter.success() && parameter.stdout.trim() == "1";
    if !parameter_enabled {
        warn!(
            value = %parameter.stdout.trim(),
            "phc_enable parameter did not read back as enabled"
        );
    }

    let interface = driver::detect_interface(session).await;
    let caps = session
        .exec(
            &format!(
                "sudo ethtool -T {interface} 2>&1 | grep -E 'PTP Hardware Clock|hardware-transmit'"
            ),
            COMMAND_TIMEOUT,
        )
        .await;
    diagnostics.insert(evidence::HWSTAMP_CAPS, caps.stdout.clone());

    let verified = device_present && clock_named;
    if verified {
        info!("Post-reload verification passed: hardware clock present");
    } else {
        warn!(
            device_present = device_present,
            clock_named = clock_named,
            "Post-reload verification failed"
        );
    }
    verified
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_registered() {
        assert!(clock_registered(
            "/sys/class/ptp/ptp0/clock_name: ena-ptp-0000:00:05.0"
        ));
        assert!(!clock_registered("/sys/class/ptp/ptp0/clock_name: kvm-clock"));
        assert!(!clock_registered(""));
    }

    #[test]
    fn test_reload_script_shape() {
        // The staged script must survive the session drop and leave a log
        // behind: it redirects everything to the log path, unloads, loads
        // with the exact parameter spelling, and captures both states.
        assert!(RELOAD_SCRIPT.contains("exec > /tmp/ena_phc_reload.log"));
        assert!(RELOAD_SCRIPT.contains("rmmod ena"));
        assert!(RELOAD_SCRIPT.contains("modprobe ena phc_enable=1"));
        assert!(!RELOAD_SCRIPT.contains("modprobe ena enable_phc=1"));
        assert!(RELOAD_SCRIPT.contains("dmesg"));
    }
}
