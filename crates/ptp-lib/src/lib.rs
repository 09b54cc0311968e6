//! Core library for testing PTP hardware clock support on EC2 instances
//!
//! This crate provides the pieces of the test pipeline:
//! - Cloud control adapter: launch, poll, terminate, audit
//! - Remote shell adapter: authenticated sessions with retry
//! - PTP configuration protocol: driver checks, hardware clock
//!   enablement (including the connection-dropping reload), chrony setup,
//!   verification
//! - Per-instance test runner and fleet scheduler
//! - Cleanup reconciler and evidence aggregation

pub mod cleanup;
pub mod cloud;
pub mod error;
pub mod models;
pub mod ptp;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod ssh;

pub use cleanup::{CleanupReconciler, CleanupReport, Chooser, RetainCandidate, Selection};
pub use cloud::{AuditLog, AwsEc2, CloudControl, Ec2Api};
pub use error::{CloudError, FleetError, LaunchFailure, SshError};
pub use models::*;
pub use report::{aggregate, FleetReport, TypeBreakdown};
pub use runner::{InstanceRunner, RunnerSettings, TestJob};
pub use scheduler::{expand_jobs, FleetScheduler, SchedulerConfig};
pub use ssh::{RemoteSession, SessionFactory, ShellAdapter, Ssh2Factory};
