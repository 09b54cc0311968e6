//! Cleanup reconciler
//!
//! Applies the retention policy after all verdicts are in: unsupported
//! instances are terminated unconditionally, supported instances go
//! through an interactive selection. The interaction sits behind the
//! [`Chooser`] seam so tests drive it deterministically.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::cloud::{CloudControl, TerminationOutcome, TERMINATION_DEADLINE};
use crate::error::CloudError;
use crate::models::{LifecycleState, Verdict};

/// A supported instance offered for retention.
#[derive(Debug, Clone)]
pub struct RetainCandidate {
    /// 1-based position in the selection listing.
    pub index: usize,
    pub instance_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub subnet_id: String,
    pub clock_device: Option<String>,
    pub ordinal: u32,
}

/// User answer to the retention prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    None,
    /// 1-based indices into the candidate list.
    Indices(Vec<usize>),
}

/// Interactive decision seam. The default implementation is terminal
/// backed; tests inject a scripted one.
#[async_trait]
pub trait Chooser: Send + Sync {
    /// Yes/no confirmation. `false` aborts the guarded action.
    async fn confirm(&self, message: &str) -> bool;

    /// Which supported instances to keep.
    async fn select(&self, candidates: &[RetainCandidate]) -> Selection;
}

/// Parse a selection expression: `all`, `none`, or comma-separated 1-based
/// indices with closed ranges (`1,3,5-7`).
pub fn parse_selection(input: &str, candidate_count: usize) -> Result<Selection, String> {
    let input = input.trim();
    match input.to_ascii_lowercase().as_str() {
        "all" => return Ok(Selection::All),
        "none" => return Ok(Selection::None),
        "" => return Err("empty selection".into()),
        _ => {}
    }

    let mut indices = BTreeSet::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(format!("empty item in selection '{input}'"));
        }

        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .trim()
                .parse()
                .map_err(|_| format!("invalid range start '{part}'"))?;
            let end: usize = end
                .trim()
                .parse()
                .map_err(|_| format!("invalid range end '{part}'"))?;
            if start == 0 || end < start {
                return Err(format!("invalid range '{part}'"));
            }
            for index in start..=end {
                indices.insert(index);
            }
        } else {
            let index: usize = part
                .parse()
                .map_err(|_| format!("invalid index '{part}'"))?;
            if index == 0 {
                return Err("indices are 1-based".into());
            }
            indices.insert(index);
        }
    }

    if let Some(&out_of_range) = indices.iter().find(|&&index| index > candidate_count) {
        return Err(format!(
            "index {out_of_range} is out of range (1..{candidate_count})"
        ));
    }

    Ok(Selection::Indices(indices.into_iter().collect()))
}

/// Disjoint partition of the instance set after cleanup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub terminated: Vec<String>,
    /// Instances the user chose to keep running.
    pub kept: Vec<String>,
    /// Termination was issued but not confirmed within the deadline.
    pub failed: Vec<String>,
}

/// The cleanup reconciler (C6).
pub struct CleanupReconciler {
    cloud: Arc<CloudControl>,
    confirm_deadline: Duration,
}

impl CleanupReconciler {
    pub fn new(cloud: Arc<CloudControl>) -> Self {
        Self {
            cloud,
            confirm_deadline: TERMINATION_DEADLINE,
        }
    }

    pub fn with_confirm_deadline(mut self, deadline: Duration) -> Self {
        self.confirm_deadline = deadline;
        self
    }

    /// Partition verdicts, terminate what the policy says, confirm each
    /// termination, and report the three disjoint sets.
    ///
    /// Safe to re-run: instances already terminated (or gone entirely) are
    /// recognized and not re-terminated.
    pub async fn reconcile(
        &self,
        verdicts: &[Verdict],
        chooser: &dyn Chooser,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();

        let unsupported: Vec<&Verdict> = verdicts
            .iter()
            .filter(|v| !v.supported && v.instance.is_some())
            .collect();
        let supported: Vec<&Verdict> = verdicts
            .iter()
            .filter(|v| v.supported && v.instance.is_some())
            .collect();

        info!(
            unsupported = unsupported.len(),
            supported = supported.len(),
            "Starting cleanup"
        );

        for verdict in &unsupported {
            let instance_id = verdict.instance_id().unwrap_or_default().to_string();
            self.terminate_one(&instance_id, &mut report).await;
        }

        if supported.is_empty() {
            return report;
        }

        let candidates: Vec<RetainCandidate> = supported
            .iter()
            .filter_map(|verdict| verdict.instance.as_ref().map(|handle| (verdict, handle)))
            .enumerate()
            .map(|(position, (verdict, handle))| RetainCandidate {
                index: position + 1,
                instance_id: handle.instance_id.clone(),
                instance_type: handle.instance_type.clone(),
                availability_zone: handle.availability_zone.clone(),
                subnet_id: handle.subnet_id.clone(),
                clock_device: verdict.evidence.clock_device.clone(),
                ordinal: verdict.ordinal,
            })
            .collect();

        let selection = chooser.select(&candidates).await;
        let keep: BTreeSet<usize> = match selection {
            Selection::All => candidates.iter().map(|c| c.index).collect(),
            Selection::None => BTreeSet::new(),
            Selection::Indices(indices) => indices.into_iter().collect(),
        };

        for candidate in &candidates {
            if keep.contains(&candidate.index) {
                info!(
                    instance_id = %candidate.instance_id,
                    instance_type = %candidate.instance_type,
                    "Keeping instance running"
                );
                self.cloud.release_kept(&candidate.instance_id);
                report.kept.push(candidate.instance_id.clone());
            } else {
                self.terminate_one(&candidate.instance_id, &mut report).await;
            }
        }

        info!(
            terminated = report.terminated.len(),
            kept = report.kept.len(),
            failed = report.failed.len(),
            "Cleanup complete"
        );
        if !report.failed.is_empty() {
            warn!(
                instances = ?report.failed,
                "Terminations unconfirmed; manual follow-up required"
            );
        }

        report
    }

    async fn terminate_one(&self, instance_id: &str, report: &mut CleanupReport) {
        // Idempotence on retry: skip instances that are already gone.
        match self.cloud.describe(instance_id).await {
            Ok(handle)
                if matches!(
                    handle.state,
                    LifecycleState::Terminated | LifecycleState::ShuttingDown
                ) =>
            {
                info!(instance_id = %instance_id, state = %handle.state, "Already terminating");
                if handle.state == LifecycleState::Terminated {
                    report.terminated.push(instance_id.to_string());
                    return;
                }
            }
            Err(CloudError::InstanceNotFound(_)) => {
                report.terminated.push(instance_id.to_string());
                return;
            }
            _ => {
                self.cloud.terminate(instance_id).await;
            }
        }

        match self
            .cloud
            .confirm_terminated(instance_id, self.confirm_deadline)
            .await
        {
            TerminationOutcome::Confirmed => report.terminated.push(instance_id.to_string()),
            TerminationOutcome::StillPresent | TerminationOutcome::Unknown => {
                warn!(instance_id = %instance_id, "Termination not confirmed");
                report.failed.push(instance_id.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection_keywords() {
        assert_eq!(parse_selection("all", 3).unwrap(), Selection::All);
        assert_eq!(parse_selection(" ALL ", 3).unwrap(), Selection::All);
        assert_eq!(parse_selection("none", 3).unwrap(), Selection::None);
    }

    #[test]
    fn test_parse_selection_indices_and_ranges() {
        assert_eq!(
            parse_selection("1,3,5-7", 8).unwrap(),
            Selection::Indices(vec![1, 3, 5, 6, 7])
        );
        assert_eq!(
            parse_selection("2-2", 3).unwrap(),
            Selection::Indices(vec![2])
        );
        // Duplicates collapse.
        assert_eq!(
            parse_selection("1,1,2", 3).unwrap(),
            Selection::Indices(vec![1, 2])
        );
    }

    #[test]
    fn test_parse_selection_rejects_bad_input() {
        assert!(parse_selection("", 3).is_err());
        assert!(parse_selection("0", 3).is_err());
        assert!(parse_selection("4", 3).is_err());
        assert!(parse_selection("3-1", 3).is_err());
        assert!(parse_selection("a,b", 3).is_err());
        assert!(parse_selection("1,,2", 3).is_err());
    }
}
