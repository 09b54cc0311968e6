//! Evidence aggregator
//!
//! Pure function over the verdict list: summary counters, per-type
//! breakdown, and the machine export shape. External formatters consume
//! [`FleetReport`]; nothing here prints.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::models::Verdict;

/// Truncation limit for diagnostic blobs in human-facing output. The
/// machine export always keeps the full text.
pub const HUMAN_BLOB_LIMIT: usize = 200;

/// Per-type result counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeBreakdown {
    pub total: u32,
    pub supported: u32,
    pub unsupported: u32,
}

/// The aggregate fleet result.
#[derive(Debug, Clone)]
pub struct FleetReport {
    pub total_instances: u32,
    pub supported: u32,
    pub unsupported: u32,
    pub elapsed_seconds: f64,
    pub placement_group: Option<String>,
    pub per_type: BTreeMap<String, TypeBreakdown>,
    /// Instance ids the user chose to keep running.
    pub kept: BTreeSet<String>,
    /// Verdicts in canonical (type-order, ordinal) order.
    pub verdicts: Vec<Verdict>,
}

/// Assemble the fleet report from collected verdicts.
pub fn aggregate(
    verdicts: Vec<Verdict>,
    placement_group: Option<String>,
    elapsed_seconds: f64,
    kept: &[String],
) -> FleetReport {
    let mut per_type: BTreeMap<String, TypeBreakdown> = BTreeMap::new();
    let mut supported = 0u32;

    for verdict in &verdicts {
        let entry = per_type.entry(verdict.instance_type.clone()).or_default();
        entry.total += 1;
        if verdict.supported {
            entry.supported += 1;
            supported += 1;
        } else {
            entry.unsupported += 1;
        }
    }

    let total_instances = verdicts.len() as u32;
    FleetReport {
        total_instances,
        supported,
        unsupported: total_instances - supported,
        elapsed_seconds,
        placement_group,
        per_type,
        kept: kept.iter().cloned().collect(),
        verdicts,
    }
}

impl FleetReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.export())
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.export())
    }

    fn export(&self) -> ExportReport {
        ExportReport {
            test_summary: ExportSummary {
                total_instances: self.total_instances,
                ptp_supported: self.supported,
                ptp_unsupported: self.unsupported,
                test_duration_seconds: round2(self.elapsed_seconds),
                instance_types_tested: self.per_type.len() as u32,
                placement_group: self.placement_group.clone(),
                instance_type_summary: self.per_type.clone(),
            },
            results: self.verdicts.iter().map(|v| self.export_result(v)).collect(),
        }
    }

    fn export_result(&self, verdict: &Verdict) -> ExportResult {
        let handle = verdict.instance.as_ref();
        let kept_running = verdict
            .instance_id()
            .map(|id| self.kept.contains(id))
            .unwrap_or(false);

        ExportResult {
            instance_id: handle.map(|h| h.instance_id.clone()),
            instance_type: verdict.instance_type.clone(),
            instance_index: verdict.ordinal,
            total_instances_of_type: verdict.type_total,
            architecture: handle.map(|h| h.architecture.to_string()),
            availability_zone: handle.map(|h| h.availability_zone.clone()),
            subnet_id: handle.map(|h| h.subnet_id.clone()),
            placement_group: handle.and_then(|h| h.placement_group.clone()),
            ptp_status: ExportPtpStatus {
                supported: verdict.supported,
                ena_driver_version: verdict.driver.version_string().map(str::to_string),
                hardware_clock_present: verdict.evidence.hardware_clock_present,
                chrony_using_phc: verdict.evidence.chrony_using_phc,
                synchronized: verdict.evidence.chrony_synchronized,
                clock_device: verdict.evidence.clock_device.clone(),
                time_offset_ns: verdict.evidence.time_offset_ns,
                error_message: verdict.error_message.clone(),
                diagnostic_output: verdict
                    .evidence
                    .diagnostics
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            kept_running,
            timestamp: verdict.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct ExportReport {
    test_summary: ExportSummary,
    results: Vec<ExportResult>,
}

#[derive(Serialize)]
struct ExportSummary {
    total_instances: u32,
    ptp_supported: u32,
    ptp_unsupported: u32,
    test_duration_seconds: f64,
    instance_types_tested: u32,
    placement_group: Option<String>,
    instance_type_summary: BTreeMap<String, TypeBreakdown>,
}

#[derive(Serialize)]
struct ExportResult {
    instance_id: Option<String>,
    instance_type: String,
    instance_index: u32,
    total_instances_of_type: u32,
    architecture: Option<String>,
    availability_zone: Option<String>,
    subnet_id: Option<String>,
    placement_group: Option<String>,
    ptp_status: ExportPtpStatus,
    kept_running: bool,
    timestamp: String,
}

#[derive(Serialize)]
struct ExportPtpStatus {
    supported: bool,
    ena_driver_version: Option<String>,
    hardware_clock_present: bool,
    chrony_using_phc: bool,
    synchronized: bool,
    clock_device: Option<String>,
    time_offset_ns: Option<f64>,
    error_message: Option<String>,
    diagnostic_output: BTreeMap<String, String>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Retain only the first two dotted-decimal octets of an address.
pub fn sanitize_ip(address: &str) -> String {
    let parts: Vec<&str> = address.split('.').collect();
    if parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok()) {
        format!("{}.{}.x.x", parts[0], parts[1])
    } else {
        address.to_string()
    }
}

/// Truncate a diagnostic blob for human-facing output.
pub fn truncate_blob(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(limit).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Architecture, ClockEvidence, DriverInfo, InstanceHandle, LifecycleState,
    };
    use chrono::Utc;

    fn verdict(ty: &str, ordinal: u32, type_total: u32, supported: bool) -> Verdict {
        Verdict {
            instance_type: ty.into(),
            ordinal,
            type_total,
            instance: Some(InstanceHandle {
                instance_id: format!("i-{ty}-{ordinal}"),
                instance_type: ty.into(),
                architecture: Architecture::X86_64,
                availability_zone: "us-east-1a".into(),
                subnet_id: "subnet-12345678".into(),
                private_ip: "10.0.1.5".into(),
                public_ip: None,
                placement_group: None,
                state: LifecycleState::Running,
            }),
            driver: DriverInfo {
                version: Some((2, 12, 0)),
                compatible: true,
                raw: "2.12.0".into(),
            },
            evidence: ClockEvidence {
                hardware_clock_present: supported,
                chrony_using_phc: supported,
                ..ClockEvidence::default()
            },
            supported,
            configuration_succeeded: supported,
            timestamp: Utc::now(),
            duration_seconds: 42.0,
            error_message: None,
        }
    }

    #[test]
    fn test_aggregate_counts() {
        let verdicts = vec![
            verdict("c7gn.large", 1, 2, true),
            verdict("c7gn.large", 2, 2, false),
            verdict("c7i.large", 1, 1, true),
        ];
        let report = aggregate(verdicts, None, 100.0, &[]);

        assert_eq!(report.total_instances, 3);
        assert_eq!(report.supported, 2);
        assert_eq!(report.unsupported, 1);
        assert_eq!(report.per_type.len(), 2);
        assert_eq!(report.per_type["c7gn.large"].supported, 1);
        assert_eq!(report.per_type["c7gn.large"].unsupported, 1);
        assert_eq!(report.per_type["c7i.large"].total, 1);
    }

    #[test]
    fn test_export_shape() {
        let verdicts = vec![verdict("c7i.large", 1, 1, true)];
        let kept = vec!["i-c7i.large-1".to_string()];
        let report = aggregate(verdicts, Some("cluster-a".into()), 42.123, &kept);

        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let summary = &value["test_summary"];
        assert_eq!(summary["total_instances"], 1);
        assert_eq!(summary["ptp_supported"], 1);
        assert_eq!(summary["ptp_unsupported"], 0);
        assert_eq!(summary["test_duration_seconds"], 42.12);
        assert_eq!(summary["instance_types_tested"], 1);
        assert_eq!(summary["placement_group"], "cluster-a");
        assert_eq!(summary["instance_type_summary"]["c7i.large"]["total"], 1);

        let result = &value["results"][0];
        assert_eq!(result["instance_id"], "i-c7i.large-1");
        assert_eq!(result["instance_index"], 1);
        assert_eq!(result["total_instances_of_type"], 1);
        assert_eq!(result["kept_running"], true);
        assert_eq!(result["ptp_status"]["supported"], true);
        assert_eq!(result["ptp_status"]["ena_driver_version"], "2.12.0");
        assert!(result["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_yaml_mirrors_json() {
        let report = aggregate(vec![verdict("c7i.large", 1, 1, false)], None, 1.0, &[]);
        let yaml = report.to_yaml().unwrap();
        assert!(yaml.contains("test_summary:"));
        assert!(yaml.contains("ptp_unsupported: 1"));
        assert!(yaml.contains("results:"));
    }

    #[test]
    fn test_sanitize_ip() {
        assert_eq!(sanitize_ip("10.0.42.17"), "10.0.x.x");
        assert_eq!(sanitize_ip("54.210.1.2"), "54.210.x.x");
        // Non-address strings pass through.
        assert_eq!(sanitize_ip("not-an-ip"), "not-an-ip");
        assert_eq!(sanitize_ip("1.2.3"), "1.2.3");
        assert_eq!(sanitize_ip("300.1.2.3"), "300.1.2.3");
    }

    #[test]
    fn test_truncate_blob() {
        assert_eq!(truncate_blob("short", 200), "short");
        let long = "x".repeat(300);
        let truncated = truncate_blob(&long, 200);
        assert_eq!(truncated.len(), 203);
        assert!(truncated.ends_with("..."));
    }
}
