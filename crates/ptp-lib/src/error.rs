//! Error taxonomy for the test pipeline
//!
//! Fleet-wide errors abort before any launch. Per-instance errors never
//! leave the instance runner; they materialize as failed verdicts instead.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Classified launch rejection from the cloud control plane.
#[derive(Debug, Error)]
pub enum LaunchFailure {
    #[error("subnet {0} not found")]
    BadSubnet(String),

    #[error("key pair '{0}' not found")]
    BadKeyPair(String),

    #[error("image {0} not found")]
    BadImage(String),

    #[error("security group {0} not found")]
    BadSecurityGroup(String),

    #[error("insufficient capacity for instance type {0}")]
    Capacity(String),

    #[error("instance type {0} not supported in this region or zone")]
    UnsupportedType(String),

    #[error("placement group constraint: {0}")]
    PlacementGroupConstraint(String),

    #[error("launch failed: {0}")]
    Unknown(String),
}

/// Errors surfaced by the cloud control adapter.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("credentials missing or rejected: {0}")]
    Auth(String),

    #[error("no base image published for architecture {0}")]
    ImageUnavailable(String),

    #[error(transparent)]
    Launch(#[from] LaunchFailure),

    #[error("instance {instance_id} did not reach running within {}s", deadline.as_secs())]
    LaunchTimeout {
        instance_id: String,
        deadline: Duration,
    },

    #[error("instance {instance_id} entered state {state} while waiting for running")]
    Stalled {
        instance_id: String,
        state: String,
    },

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("cloud api error after {attempts} attempt(s): {message}")]
    Api { attempts: u32, message: String },
}

/// Errors surfaced by the remote shell adapter.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("private key file not found: {0}")]
    KeyFileMissing(PathBuf),

    #[error("authentication failed for {username}@{host}")]
    Auth { host: String, username: String },

    #[error("failed to connect to {host} after {attempts} attempt(s): {last_error}")]
    Exhausted {
        host: String,
        attempts: u32,
        last_error: String,
    },

    #[error("ssh transport error: {0}")]
    Transport(String),
}

/// Fleet-level failures that abort the run before any launch.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid fleet request: {0}")]
    InvalidRequest(String),

    #[error("placement group '{name}' {reason}")]
    PlacementGroup { name: String, reason: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("aborted at confirmation prompt")]
    Aborted,
}
