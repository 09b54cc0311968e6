//! Fleet scheduler
//!
//! Expands a fleet request into per-instance jobs, guards large fleets
//! behind a confirmation prompt, and runs the jobs sequentially by
//! default, with opt-in bounded parallelism. One job's failure never
//! aborts its siblings; a user interrupt stops new jobs from starting
//! while in-flight pipelines run to their verdict.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::cleanup::Chooser;
use crate::cloud::{CloudControl, PlacementGroupStatus};
use crate::error::FleetError;
use crate::models::{FleetRequest, InstanceTypeSpec, Verdict};
use crate::runner::{InstanceRunner, TestJob};

/// Scheduling knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker count. The default of 1 is the semantics the interactive
    /// prompts and cleanup flow assume.
    pub concurrency: usize,
    /// Prompt when more distinct types than this are requested.
    pub confirm_type_threshold: usize,
    /// Prompt when more total instances than this are requested.
    pub confirm_total_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            confirm_type_threshold: 3,
            confirm_total_threshold: 5,
        }
    }
}

/// Flatten specs into jobs, preserving type order and assigning per-type
/// ordinals 1..N.
pub fn expand_jobs(specs: &[InstanceTypeSpec]) -> Vec<TestJob> {
    let mut jobs = Vec::new();
    for spec in specs {
        for ordinal in 1..=spec.quantity {
            jobs.push(TestJob {
                instance_type: spec.instance_type.clone(),
                ordinal,
                type_total: spec.quantity,
            });
        }
    }
    jobs
}

fn needs_confirmation(config: &SchedulerConfig, request: &FleetRequest) -> bool {
    request.specs.len() > config.confirm_type_threshold
        || request.total_instances() > config.confirm_total_threshold
}

/// The fleet scheduler (C5).
pub struct FleetScheduler {
    cloud: Arc<CloudControl>,
    runner: Arc<InstanceRunner>,
    config: SchedulerConfig,
}

impl FleetScheduler {
    pub fn new(cloud: Arc<CloudControl>, runner: Arc<InstanceRunner>) -> Self {
        Self {
            cloud,
            runner,
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the whole fleet. Returns verdicts in canonical (type-order,
    /// ordinal) order, one per expanded job that was started.
    pub async fn run(
        &self,
        request: &FleetRequest,
        chooser: &dyn Chooser,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<Verdict>, FleetError> {
        if request.specs.is_empty() {
            return Err(FleetError::InvalidRequest(
                "at least one instance type is required".into(),
            ));
        }
        if let Some(spec) = request.specs.iter().find(|s| s.quantity == 0) {
            return Err(FleetError::InvalidRequest(format!(
                "quantity for {} must be at least 1",
                spec.instance_type
            )));
        }

        // Placement group validation gates every launch.
        if let Some(name) = &request.placement_group {
            match self.cloud.validate_placement_group(name).await? {
                PlacementGroupStatus::Available => {
                    info!(placement_group = %name, "Placement group validated");
                }
                PlacementGroupStatus::NotFound => {
                    return Err(FleetError::PlacementGroup {
                        name: name.clone(),
                        reason: "not found".into(),
                    });
                }
                PlacementGroupStatus::NotAvailable(state) => {
                    return Err(FleetError::PlacementGroup {
                        name: name.clone(),
                        reason: format!("not available (state: {state})"),
                    });
                }
            }
        }

        let jobs = expand_jobs(&request.specs);
        info!(
            types = request.specs.len(),
            total = jobs.len(),
            concurrency = self.config.concurrency,
            "Fleet expanded"
        );

        if needs_confirmation(&self.config, request) {
            let message = format!(
                "Testing {} instance type(s) with {} total instance(s). \
                 This may take significant time and incur costs. Continue?",
                request.specs.len(),
                request.total_instances(),
            );
            if !chooser.confirm(&message).await {
                info!("Fleet aborted at confirmation prompt");
                return Err(FleetError::Aborted);
            }
        }

        let mut verdicts = if self.config.concurrency <= 1 {
            self.run_sequential(request, jobs, shutdown).await
        } else {
            self.run_parallel(request, jobs, shutdown).await
        };

        sort_canonical(&mut verdicts, &request.specs);
        Ok(verdicts)
    }

    async fn run_sequential(
        &self,
        request: &FleetRequest,
        jobs: Vec<TestJob>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<Verdict> {
        let total = jobs.len();
        let mut verdicts = Vec::with_capacity(total);

        for (position, job) in jobs.into_iter().enumerate() {
            if *shutdown.borrow() {
                warn!(
                    completed = verdicts.len(),
                    remaining = total - position,
                    "Interrupt received; not starting further jobs"
                );
                break;
            }

            info!(
                job = position + 1,
                total = total,
                instance_type = %job.instance_type,
                ordinal = job.ordinal,
                "Dispatching job"
            );
            verdicts.push(self.runner.run(request, &job).await);
        }

        verdicts
    }

    async fn run_parallel(
        &self,
        request: &FleetRequest,
        jobs: Vec<TestJob>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<Verdict> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = tokio::task::JoinSet::new();

        for job in jobs {
            if *shutdown.borrow() {
                warn!("Interrupt received; not starting further jobs");
                break;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let runner = Arc::clone(&self.runner);
            let request = request.clone();
            tasks.spawn(async move {
                let _permit = permit;
                runner.run(&request, &job).await
            });
        }

        let mut verdicts = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(verdict) => verdicts.push(verdict),
                // The runner converts every failure into a verdict; a
                // panicking task is a bug, but it must not sink siblings.
                Err(join_error) => error!(error = %join_error, "Worker task failed"),
            }
        }
        verdicts
    }
}

/// Sort verdicts to the canonical (type-order, ordinal) order.
fn sort_canonical(verdicts: &mut [Verdict], specs: &[InstanceTypeSpec]) {
    let positions: HashMap<&str, usize> = specs
        .iter()
        .enumerate()
        .map(|(position, spec)| (spec.instance_type.as_str(), position))
        .collect();

    verdicts.sort_by_key(|verdict| {
        (
            positions
                .get(verdict.instance_type.as_str())
                .copied()
                .unwrap_or(usize::MAX),
            verdict.ordinal,
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<InstanceTypeSpec> {
        vec![
            InstanceTypeSpec::new("c7gn.large", 2),
            InstanceTypeSpec::new("c7i.large", 1),
        ]
    }

    #[test]
    fn test_expand_preserves_order_and_ordinals() {
        let jobs = expand_jobs(&specs());
        let flat: Vec<(String, u32, u32)> = jobs
            .iter()
            .map(|j| (j.instance_type.clone(), j.ordinal, j.type_total))
            .collect();
        assert_eq!(
            flat,
            vec![
                ("c7gn.large".to_string(), 1, 2),
                ("c7gn.large".to_string(), 2, 2),
                ("c7i.large".to_string(), 1, 1),
            ]
        );
    }

    #[test]
    fn test_confirmation_thresholds() {
        let config = SchedulerConfig::default();
        let mut request = FleetRequest {
            specs: specs(),
            subnet_id: "subnet-12345678".into(),
            key_name: "k".into(),
            private_key_path: "/dev/null".into(),
            region: "us-east-1".into(),
            profile: None,
            ami_id: None,
            security_group_id: None,
            placement_group: None,
            ssh_username: "ec2-user".into(),
        };

        // 2 types, 3 instances: below both thresholds.
        assert!(!needs_confirmation(&config, &request));

        // 6 total instances crosses the total threshold.
        request.specs = vec![InstanceTypeSpec::new("c7i.large", 6)];
        assert!(needs_confirmation(&config, &request));

        // 4 distinct types crosses the type threshold.
        request.specs = (0..4)
            .map(|i| InstanceTypeSpec::new(format!("c7i.type{i}"), 1))
            .collect();
        assert!(needs_confirmation(&config, &request));
    }

    #[test]
    fn test_sort_canonical() {
        let make = |ty: &str, ordinal: u32| Verdict {
            instance_type: ty.into(),
            ordinal,
            type_total: 2,
            instance: None,
            driver: crate::models::DriverInfo::unknown(),
            evidence: Default::default(),
            supported: false,
            configuration_succeeded: false,
            timestamp: chrono::Utc::now(),
            duration_seconds: 0.0,
            error_message: None,
        };

        let mut verdicts = vec![
            make("c7i.large", 1),
            make("c7gn.large", 2),
            make("c7gn.large", 1),
        ];
        sort_canonical(&mut verdicts, &specs());

        let order: Vec<(String, u32)> = verdicts
            .iter()
            .map(|v| (v.instance_type.clone(), v.ordinal))
            .collect();
        assert_eq!(
            order,
            vec![
                ("c7gn.large".to_string(), 1),
                ("c7gn.large".to_string(), 2),
                ("c7i.large".to_string(), 1),
            ]
        );
    }
}
