//! Cloud control adapter
//!
//! Narrow capability surface over the EC2 control plane: resolve base
//! images, validate placement groups, launch, poll, describe and terminate
//! instances. All calls go through a retry wrapper for throttling and
//! transport failures and are recorded in the audit sink.
//!
//! The provider SDK sits behind the [`Ec2Api`] trait so the whole pipeline
//! can run against a deterministic mock in tests; [`AwsEc2`] is the
//! production implementation.

mod audit;
mod aws;

pub use audit::{AuditLog, AuditRecord};
pub use aws::AwsEc2;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{CloudError, LaunchFailure};
use crate::models::{Architecture, FleetRequest, InstanceHandle, LifecycleState};

/// Owner marker stamped on every launched instance.
pub const OWNER_TAG: &str = "ptp-scout";
/// Purpose marker stamped on every launched instance.
pub const PURPOSE_TAG: &str = "PTP hardware clock testing";

/// Default deadline for an instance to reach `running`.
pub const RUNNING_DEADLINE: Duration = Duration::from_secs(300);
/// Default deadline for termination confirmation.
pub const TERMINATION_DEADLINE: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Launch parameters handed to the provider API.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub instance_type: String,
    pub image_id: String,
    pub subnet_id: String,
    pub key_name: String,
    pub security_group_id: Option<String>,
    pub placement_group: Option<String>,
    pub tags: Vec<(String, String)>,
}

/// Provider-neutral view of one instance, as returned by the API seam.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub subnet_id: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub placement_group: Option<String>,
    pub state: LifecycleState,
}

#[derive(Debug, Clone)]
pub struct PlacementGroupInfo {
    pub name: String,
    pub strategy: String,
    pub state: String,
}

/// Classified failure from one provider API call.
#[derive(Debug, Clone)]
pub struct ApiFailure {
    pub code: String,
    pub message: String,
    /// Throttling or transport; eligible for the retry wrapper.
    pub retryable: bool,
}

impl ApiFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// The narrow provider surface the adapter needs.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn run_instance(&self, spec: &LaunchSpec) -> Result<InstanceDescription, ApiFailure>;

    async fn describe_instance(&self, instance_id: &str)
        -> Result<InstanceDescription, ApiFailure>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ApiFailure>;

    async fn describe_placement_group(
        &self,
        name: &str,
    ) -> Result<Option<PlacementGroupInfo>, ApiFailure>;

    /// Read a vendor-published image pointer (SSM public parameter).
    async fn get_image_parameter(&self, name: &str) -> Result<String, ApiFailure>;
}

/// Result of placement-group validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementGroupStatus {
    Available,
    NotFound,
    NotAvailable(String),
}

/// Result of termination confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    Confirmed,
    StillPresent,
    Unknown,
}

/// Exponential backoff policy for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// The cloud control adapter (C1).
pub struct CloudControl {
    api: Arc<dyn Ec2Api>,
    audit: Arc<AuditLog>,
    run_id: String,
    retry: RetryPolicy,
}

impl CloudControl {
    pub fn new(api: Arc<dyn Ec2Api>, audit: Arc<AuditLog>) -> Self {
        Self {
            api,
            audit,
            run_id: uuid::Uuid::new_v4().to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Look up the newest general-purpose base image for an architecture.
    pub async fn resolve_image(&self, architecture: Architecture) -> Result<String, CloudError> {
        let parameter = match architecture {
            Architecture::X86_64 => {
                "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64"
            }
            Architecture::Arm64 => {
                "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-arm64"
            }
            Architecture::Unknown => {
                return Err(CloudError::ImageUnavailable(architecture.to_string()))
            }
        };

        let result = self
            .retrying("resolve-image", || self.api.get_image_parameter(parameter))
            .await;

        match result {
            Ok(image_id) => {
                info!(architecture = %architecture, image_id = %image_id, "Resolved base image");
                self.audit.record("resolve-image", Some(&image_id), "ok");
                Ok(image_id)
            }
            Err((attempts, failure)) => {
                self.audit.record("resolve-image", None, &failure.code);
                if failure.code == "ParameterNotFound" {
                    Err(CloudError::ImageUnavailable(architecture.to_string()))
                } else {
                    Err(self.classify_common(attempts, failure))
                }
            }
        }
    }

    /// Validate that a named placement group exists and is available.
    ///
    /// Must run before any launch when the request names a group; anything
    /// but `Available` aborts the fleet.
    pub async fn validate_placement_group(
        &self,
        name: &str,
    ) -> Result<PlacementGroupStatus, CloudError> {
        let result = self
            .retrying("validate-placement-group", || {
                self.api.describe_placement_group(name)
            })
            .await;

        let status = match result {
            Ok(Some(info)) => {
                info!(
                    placement_group = %name,
                    strategy = %info.strategy,
                    state = %info.state,
                    "Placement group found"
                );
                if info.state == "available" {
                    PlacementGroupStatus::Available
                } else {
                    PlacementGroupStatus::NotAvailable(info.state)
                }
            }
            Ok(None) => PlacementGroupStatus::NotFound,
            Err((_, failure)) if failure.code == "InvalidPlacementGroup.Unknown" => {
                PlacementGroupStatus::NotFound
            }
            Err((attempts, failure)) => {
                self.audit
                    .record("validate-placement-group", Some(name), &failure.code);
                return Err(self.classify_common(attempts, failure));
            }
        };

        let outcome = match &status {
            PlacementGroupStatus::Available => "ok",
            PlacementGroupStatus::NotFound => "not-found",
            PlacementGroupStatus::NotAvailable(_) => "not-available",
        };
        self.audit
            .record("validate-placement-group", Some(name), outcome);
        Ok(status)
    }

    /// Launch one tagged instance for the given type and ordinal.
    pub async fn launch(
        &self,
        request: &FleetRequest,
        instance_type: &str,
        ordinal: u32,
    ) -> Result<InstanceHandle, CloudError> {
        let architecture = Architecture::from_instance_type(instance_type);
        let image_id = match &request.ami_id {
            Some(id) => id.clone(),
            None => self.resolve_image(architecture).await?,
        };

        let spec = LaunchSpec {
            instance_type: instance_type.to_string(),
            image_id,
            subnet_id: request.subnet_id.clone(),
            key_name: request.key_name.clone(),
            security_group_id: request.security_group_id.clone(),
            placement_group: request.placement_group.clone(),
            tags: vec![
                ("Name".into(), format!("{OWNER_TAG}-{instance_type}")),
                ("Purpose".into(), PURPOSE_TAG.into()),
                ("ManagedBy".into(), OWNER_TAG.into()),
                ("RunId".into(), self.run_id.clone()),
                ("Ordinal".into(), ordinal.to_string()),
            ],
        };

        info!(
            instance_type = %instance_type,
            subnet_id = %request.subnet_id,
            image_id = %spec.image_id,
            ordinal = ordinal,
            "Launching instance"
        );

        let result = self
            .retrying("launch", || self.api.run_instance(&spec))
            .await;

        match result {
            Ok(description) => {
                self.audit
                    .record("launch", Some(&description.instance_id), "ok");
                self.audit.instance_launched(&description.instance_id);
                info!(
                    instance_id = %description.instance_id,
                    availability_zone = %description.availability_zone,
                    "Instance launched"
                );
                Ok(handle_from(description))
            }
            Err((attempts, failure)) => {
                self.audit.record("launch", None, &failure.code);
                if is_auth_code(&failure.code) {
                    return Err(CloudError::Auth(failure.message));
                }
                if failure.retryable {
                    return Err(CloudError::Api {
                        attempts,
                        message: failure.to_string(),
                    });
                }
                Err(classify_launch(&spec, failure).into())
            }
        }
    }

    /// Poll until the instance is `running` with an address, or the
    /// deadline elapses. A stuck instance is terminated synchronously.
    pub async fn wait_running(
        &self,
        handle: &InstanceHandle,
        deadline: Duration,
    ) -> Result<InstanceHandle, CloudError> {
        let started = Instant::now();
        info!(
            instance_id = %handle.instance_id,
            deadline_secs = deadline.as_secs(),
            "Waiting for instance to reach running"
        );

        loop {
            if started.elapsed() > deadline {
                warn!(
                    instance_id = %handle.instance_id,
                    "Instance stuck before running; terminating"
                );
                self.terminate(&handle.instance_id).await;
                self.audit
                    .record("wait-running", Some(&handle.instance_id), "launch-timeout");
                return Err(CloudError::LaunchTimeout {
                    instance_id: handle.instance_id.clone(),
                    deadline,
                });
            }

            let refreshed = self.describe(&handle.instance_id).await?;
            match refreshed.state {
                LifecycleState::Running => {
                    self.audit
                        .record("wait-running", Some(&handle.instance_id), "ok");
                    info!(
                        instance_id = %handle.instance_id,
                        elapsed_secs = started.elapsed().as_secs(),
                        "Instance running"
                    );
                    return Ok(refreshed);
                }
                LifecycleState::Pending => {}
                state => {
                    self.audit.record(
                        "wait-running",
                        Some(&handle.instance_id),
                        state.as_str(),
                    );
                    return Err(CloudError::Stalled {
                        instance_id: handle.instance_id.clone(),
                        state: state.to_string(),
                    });
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Refresh one instance handle.
    pub async fn describe(&self, instance_id: &str) -> Result<InstanceHandle, CloudError> {
        let result = self
            .retrying("describe", || self.api.describe_instance(instance_id))
            .await;

        match result {
            Ok(description) => Ok(handle_from(description)),
            Err((_, failure)) if failure.code == "InvalidInstanceID.NotFound" => {
                Err(CloudError::InstanceNotFound(instance_id.to_string()))
            }
            Err((attempts, failure)) => {
                self.audit.record("describe", Some(instance_id), &failure.code);
                Err(self.classify_common(attempts, failure))
            }
        }
    }

    /// Fire-and-forget termination request.
    pub async fn terminate(&self, instance_id: &str) {
        let result = self
            .retrying("terminate", || self.api.terminate_instance(instance_id))
            .await;

        match result {
            Ok(()) => {
                self.audit.record("terminate", Some(instance_id), "ok");
                self.audit.instance_released(instance_id);
                info!(instance_id = %instance_id, "Termination requested");
            }
            Err((_, failure)) if failure.code == "InvalidInstanceID.NotFound" => {
                self.audit
                    .record("terminate", Some(instance_id), "not-found");
                self.audit.instance_released(instance_id);
            }
            Err((_, failure)) => {
                self.audit.record("terminate", Some(instance_id), &failure.code);
                warn!(
                    instance_id = %instance_id,
                    error = %failure,
                    "Termination request failed"
                );
            }
        }
    }

    /// Re-describe until the instance reports `terminated` or the deadline
    /// elapses.
    pub async fn confirm_terminated(
        &self,
        instance_id: &str,
        deadline: Duration,
    ) -> TerminationOutcome {
        let started = Instant::now();

        loop {
            if started.elapsed() > deadline {
                self.audit
                    .record("confirm-terminated", Some(instance_id), "still-present");
                return TerminationOutcome::StillPresent;
            }

            match self.describe(instance_id).await {
                Ok(handle) if handle.state == LifecycleState::Terminated => {
                    self.audit
                        .record("confirm-terminated", Some(instance_id), "ok");
                    return TerminationOutcome::Confirmed;
                }
                Ok(_) => {}
                Err(CloudError::InstanceNotFound(_)) => {
                    // Gone from the control plane entirely.
                    self.audit
                        .record("confirm-terminated", Some(instance_id), "ok");
                    return TerminationOutcome::Confirmed;
                }
                Err(error) => {
                    warn!(
                        instance_id = %instance_id,
                        error = %error,
                        "Could not confirm termination"
                    );
                    self.audit
                        .record("confirm-terminated", Some(instance_id), "unknown");
                    return TerminationOutcome::Unknown;
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Mark an instance as deliberately kept; it is no longer an orphan.
    pub fn release_kept(&self, instance_id: &str) {
        self.audit.record("keep", Some(instance_id), "ok");
        self.audit.instance_released(instance_id);
    }

    fn classify_common(&self, attempts: u32, failure: ApiFailure) -> CloudError {
        if is_auth_code(&failure.code) {
            CloudError::Auth(failure.message)
        } else {
            CloudError::Api {
                attempts,
                message: failure.to_string(),
            }
        }
    }

    async fn retrying<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> Result<T, (u32, ApiFailure)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiFailure>>,
    {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1u32;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(failure) if failure.retryable && attempt < self.retry.max_attempts => {
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %failure,
                        "Transient cloud api failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    attempt += 1;
                }
                Err(failure) => return Err((attempt, failure)),
            }
        }
    }
}

fn handle_from(description: InstanceDescription) -> InstanceHandle {
    let architecture = Architecture::from_instance_type(&description.instance_type);
    InstanceHandle {
        instance_id: description.instance_id,
        instance_type: description.instance_type,
        architecture,
        availability_zone: description.availability_zone,
        subnet_id: description.subnet_id,
        private_ip: description.private_ip.unwrap_or_default(),
        public_ip: description.public_ip,
        placement_group: description.placement_group,
        state: description.state,
    }
}

fn is_auth_code(code: &str) -> bool {
    matches!(
        code,
        "AuthFailure"
            | "UnauthorizedOperation"
            | "InvalidClientTokenId"
            | "SignatureDoesNotMatch"
            | "ExpiredToken"
            | "MissingAuthenticationToken"
    )
}

fn classify_launch(spec: &LaunchSpec, failure: ApiFailure) -> LaunchFailure {
    match failure.code.as_str() {
        "InvalidSubnetID.NotFound" => LaunchFailure::BadSubnet(spec.subnet_id.clone()),
        "InvalidKeyPair.NotFound" => LaunchFailure::BadKeyPair(spec.key_name.clone()),
        "InvalidAMIID.NotFound" | "InvalidAMIID.Malformed" => {
            LaunchFailure::BadImage(spec.image_id.clone())
        }
        "InvalidGroup.NotFound" => LaunchFailure::BadSecurityGroup(
            spec.security_group_id.clone().unwrap_or_default(),
        ),
        "InsufficientInstanceCapacity" => {
            LaunchFailure::Capacity(spec.instance_type.clone())
        }
        "Unsupported" | "InvalidParameterValue.InstanceType" => {
            LaunchFailure::UnsupportedType(spec.instance_type.clone())
        }
        code if code.starts_with("InvalidPlacementGroup") => {
            LaunchFailure::PlacementGroupConstraint(failure.message)
        }
        _ => LaunchFailure::Unknown(failure.to_string()),
    }
}
