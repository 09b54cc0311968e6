//! Per-instance test runner
//!
//! Drives one instance through launch → wait-running → connect →
//! configure → verify and emits exactly one [`Verdict`]. Failures at any
//! stage terminate the instance and materialize as a failed verdict; they
//! never propagate to the scheduler.
//!
//! The runner, not the configuration protocol, owns the session. When
//! state 3 signals `EnabledNeedsReconnect`, the runner closes the dead
//! session, waits for the interface to re-initialize, reconnects, pulls
//! the reload log, and resumes the protocol at state 4.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cloud::{CloudControl, RUNNING_DEADLINE};
use crate::error::CloudError;
use crate::models::{
    ClockEvidence, DiagnosticBundle, DriverInfo, FleetRequest, InstanceHandle, Verdict,
};
use crate::ptp::{self, PhcOutcome, Prepare};
use crate::ssh::{RemoteSession, ShellAdapter};

/// Timing knobs for one instance pipeline.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Deadline for the instance to reach `running`.
    pub running_deadline: Duration,
    /// Grace period after `running` before the first connect attempt.
    pub boot_grace: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    /// Wait after a driver reload before reconnecting; the interface needs
    /// time to re-initialize.
    pub reconnect_wait: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            running_deadline: RUNNING_DEADLINE,
            boot_grace: Duration::from_secs(10),
            connect_attempts: 5,
            connect_backoff: Duration::from_secs(10),
            reconnect_wait: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// One expanded job: an instance type plus its ordinal within the type
/// group.
#[derive(Debug, Clone)]
pub struct TestJob {
    pub instance_type: String,
    pub ordinal: u32,
    pub type_total: u32,
}

/// The per-instance test runner (C4).
pub struct InstanceRunner {
    cloud: Arc<CloudControl>,
    shell: Arc<ShellAdapter>,
    settings: RunnerSettings,
}

impl InstanceRunner {
    pub fn new(cloud: Arc<CloudControl>, shell: Arc<ShellAdapter>) -> Self {
        Self {
            cloud,
            shell,
            settings: RunnerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run one job end to end. Always returns a verdict.
    pub async fn run(&self, request: &FleetRequest, job: &TestJob) -> Verdict {
        let timestamp = Utc::now();
        let started = Instant::now();
        info!(
            instance_type = %job.instance_type,
            ordinal = job.ordinal,
            type_total = job.type_total,
            "Starting instance test"
        );

        // requested → launched
        let handle = match self
            .cloud
            .launch(request, &job.instance_type, job.ordinal)
            .await
        {
            Ok(handle) => handle,
            Err(cause) => {
                error!(instance_type = %job.instance_type, error = %cause, "Launch failed");
                return self.failed(
                    job,
                    None,
                    DriverInfo::unknown(),
                    ClockEvidence::default(),
                    format!("launch failed: {cause}"),
                    timestamp,
                    started,
                );
            }
        };

        // launched → running
        let handle = match self
            .cloud
            .wait_running(&handle, self.settings.running_deadline)
            .await
        {
            Ok(refreshed) => refreshed,
            Err(cause) => {
                // A launch timeout already terminated the instance inside
                // the adapter; anything else still needs cleanup here.
                if !matches!(cause, CloudError::LaunchTimeout { .. }) {
                    self.cloud.terminate(&handle.instance_id).await;
                }
                return self.failed(
                    job,
                    Some(handle),
                    DriverInfo::unknown(),
                    ClockEvidence::default(),
                    cause.to_string(),
                    timestamp,
                    started,
                );
            }
        };

        let Some(host) = handle.ssh_host().map(str::to_string) else {
            self.cloud.terminate(&handle.instance_id).await;
            return self.failed(
                job,
                Some(handle),
                DriverInfo::unknown(),
                ClockEvidence::default(),
                "instance has no reachable address".into(),
                timestamp,
                started,
            );
        };

        // running → connected
        info!(
            host = %host,
            grace_secs = self.settings.boot_grace.as_secs(),
            "Waiting for remote services before connecting"
        );
        tokio::time::sleep(self.settings.boot_grace).await;

        let mut session = match self
            .shell
            .connect_with(
                &host,
                &request.ssh_username,
                self.settings.connect_attempts,
                self.settings.connect_backoff,
            )
            .await
        {
            Ok(session) => session,
            Err(cause) => {
                self.cloud.terminate(&handle.instance_id).await;
                return self.failed(
                    job,
                    Some(handle),
                    DriverInfo::unknown(),
                    ClockEvidence::default(),
                    cause.to_string(),
                    timestamp,
                    started,
                );
            }
        };

        // connected → configured-or-skipped
        let mut diagnostics = DiagnosticBundle::new();
        let prepare = ptp::prepare(session.as_mut(), &mut diagnostics).await;

        let (driver, configuration_succeeded, narrative, mut session) = match prepare {
            Prepare::SkipIncompatible(driver) => {
                let message = format!(
                    "ENA driver version {} is below minimum required version 2.10.0",
                    driver.version_string().unwrap_or("unknown")
                );
                (driver, false, Some(message), session)
            }
            Prepare::Failed { driver, failure } => {
                (driver, false, Some(failure.to_string()), session)
            }
            Prepare::Ready(prepared) => {
                if prepared.phc == PhcOutcome::EnabledNeedsReconnect {
                    session = match self
                        .reconnect_after_reload(session, &host, &request.ssh_username)
                        .await
                    {
                        Ok(session) => session,
                        Err(cause) => {
                            self.cloud.terminate(&handle.instance_id).await;
                            return self.failed(
                                job,
                                Some(handle),
                                prepared.driver,
                                ClockEvidence {
                                    diagnostics,
                                    ..ClockEvidence::default()
                                },
                                format!("reconnect after driver reload failed: {cause}"),
                                timestamp,
                                started,
                            );
                        }
                    };

                    ptp::fetch_reload_log(session.as_mut(), &mut diagnostics).await;
                    if !ptp::verify_post_reload(session.as_mut(), &mut diagnostics).await {
                        warn!(
                            instance_id = %handle.instance_id,
                            "Hardware clock absent after driver reload"
                        );
                    }
                }

                match ptp::apply(session.as_mut(), &mut diagnostics).await {
                    Ok(()) => (prepared.driver, true, None, session),
                    Err(failure) => (prepared.driver, false, Some(failure.to_string()), session),
                }
            }
        };

        // configured-or-skipped → verdict-emitted
        let evidence = ptp::verify(session.as_mut(), &driver, diagnostics).await;
        session.close().await;

        let supported = configuration_succeeded
            && evidence.hardware_clock_present
            && evidence.chrony_using_phc;

        let error_message = if supported {
            None
        } else {
            narrative.or_else(|| Some(unsupported_reasons(&driver, &evidence)))
        };

        let duration_seconds = started.elapsed().as_secs_f64();
        if supported {
            info!(
                instance_id = %handle.instance_id,
                instance_type = %job.instance_type,
                clock_device = evidence.clock_device.as_deref().unwrap_or("-"),
                duration_secs = duration_seconds,
                "PTP is supported"
            );
        } else {
            warn!(
                instance_id = %handle.instance_id,
                instance_type = %job.instance_type,
                reason = error_message.as_deref().unwrap_or("-"),
                "PTP is not supported"
            );
        }

        Verdict {
            instance_type: job.instance_type.clone(),
            ordinal: job.ordinal,
            type_total: job.type_total,
            instance: Some(handle),
            driver,
            evidence,
            supported,
            configuration_succeeded,
            timestamp,
            duration_seconds,
            error_message,
        }
    }

    /// The reconnect handoff for the driver-reload path. The old session is
    /// dead from the caller's perspective even if close errors out.
    async fn reconnect_after_reload(
        &self,
        mut session: Box<dyn RemoteSession>,
        host: &str,
        username: &str,
    ) -> Result<Box<dyn RemoteSession>, crate::error::SshError> {
        info!(
            wait_secs = self.settings.reconnect_wait.as_secs(),
            "Driver reload in flight; closing session and waiting for the interface"
        );
        session.close().await;
        drop(session);

        tokio::time::sleep(self.settings.reconnect_wait).await;

        self.shell
            .connect_with(
                host,
                username,
                self.settings.reconnect_attempts,
                self.settings.reconnect_backoff,
            )
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn failed(
        &self,
        job: &TestJob,
        instance: Option<InstanceHandle>,
        driver: DriverInfo,
        evidence: ClockEvidence,
        error: String,
        timestamp: DateTime<Utc>,
        started: Instant,
    ) -> Verdict {
        Verdict {
            instance_type: job.instance_type.clone(),
            ordinal: job.ordinal,
            type_total: job.type_total,
            instance,
            driver,
            evidence,
            supported: false,
            configuration_succeeded: false,
            timestamp,
            duration_seconds: started.elapsed().as_secs_f64(),
            error_message: Some(error),
        }
    }
}

/// Human-readable reasons an instance came out unsupported.
fn unsupported_reasons(driver: &DriverInfo, evidence: &ClockEvidence) -> String {
    let mut reasons = Vec::new();
    if !driver.compatible {
        reasons.push(format!(
            "ENA driver version {} is below minimum required version 2.10.0",
            driver.version_string().unwrap_or("unknown")
        ));
    }
    if !evidence.hardware_clock_present {
        reasons.push("no PTP hardware clock device found".to_string());
    }
    if !evidence.chrony_using_phc {
        reasons.push("chrony is not using the PHC as preferred time source".to_string());
    }
    if reasons.is_empty() {
        reasons.push("configuration did not complete".to_string());
    }
    reasons.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_reasons_accumulate() {
        let driver = DriverInfo {
            version: Some((2, 8, 0)),
            compatible: false,
            raw: "2.8.0".into(),
        };
        let evidence = ClockEvidence::default();
        let reasons = unsupported_reasons(&driver, &evidence);
        assert!(reasons.contains("2.8.0"));
        assert!(reasons.contains("no PTP hardware clock"));
        assert!(reasons.contains("chrony"));
    }

    #[test]
    fn test_unsupported_reasons_fallback() {
        let driver = DriverInfo {
            version: Some((2, 12, 0)),
            compatible: true,
            raw: "2.12.0".into(),
        };
        let evidence = ClockEvidence {
            hardware_clock_present: true,
            chrony_using_phc: true,
            ..ClockEvidence::default()
        };
        assert_eq!(
            unsupported_reasons(&driver, &evidence),
            "configuration did not complete"
        );
    }
}
