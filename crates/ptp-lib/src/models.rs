//! Core data models for PTP instance testing

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum ENA driver version with PTP hardware clock support.
pub const MIN_DRIVER_VERSION: (u32, u32, u32) = (2, 10, 0);

/// CPU architecture of an instance type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(non_camel_case_types)]
pub enum Architecture {
    X86_64,
    Arm64,
    Unknown,
}

impl Architecture {
    /// Derive the architecture from the instance-type family prefix.
    ///
    /// Graviton families map to arm64, the known Intel/AMD families to
    /// x86_64. Unknown families default to x86_64, matching what EC2 does
    /// for the overwhelming majority of current-generation types.
    pub fn from_instance_type(instance_type: &str) -> Self {
        let family = instance_type
            .split('.')
            .next()
            .unwrap_or(instance_type);

        const ARM64_FAMILIES: &[&str] = &[
            "c6g", "c7g", "c6gn", "c7gn", "m6g", "m7g", "r6g", "r7g", "t4g",
        ];
        const X86_64_FAMILIES: &[&str] = &[
            "c5n", "c6i", "c7i", "c6a", "c7a", "m6i", "m7i", "r6i", "r7i",
        ];

        if ARM64_FAMILIES.contains(&family) {
            Architecture::Arm64
        } else if X86_64_FAMILIES.contains(&family) {
            Architecture::X86_64
        } else {
            tracing::warn!(
                instance_type = %instance_type,
                family = %family,
                "Unknown instance family, defaulting to x86_64"
            );
            Architecture::X86_64
        }
    }

    /// Normalize the machine name reported by the remote kernel.
    pub fn from_uname(machine: &str) -> Self {
        match machine.trim() {
            "x86_64" | "amd64" => Architecture::X86_64,
            "aarch64" | "arm64" => Architecture::Arm64,
            _ => Architecture::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested instance type with a launch quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTypeSpec {
    pub instance_type: String,
    pub quantity: u32,
}

impl InstanceTypeSpec {
    pub fn new(instance_type: impl Into<String>, quantity: u32) -> Self {
        Self {
            instance_type: instance_type.into(),
            quantity,
        }
    }
}

impl fmt::Display for InstanceTypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.quantity == 1 {
            f.write_str(&self.instance_type)
        } else {
            write!(f, "{}:{}", self.instance_type, self.quantity)
        }
    }
}

/// The immutable job intake for one run.
#[derive(Debug, Clone)]
pub struct FleetRequest {
    pub specs: Vec<InstanceTypeSpec>,
    pub subnet_id: String,
    pub key_name: String,
    pub private_key_path: PathBuf,
    pub region: String,
    pub profile: Option<String>,
    pub ami_id: Option<String>,
    pub security_group_id: Option<String>,
    pub placement_group: Option<String>,
    pub ssh_username: String,
}

impl FleetRequest {
    /// Total number of instances the request expands to.
    pub fn total_instances(&self) -> u32 {
        self.specs.iter().map(|s| s.quantity).sum()
    }
}

/// Instance lifecycle state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown,
}

impl LifecycleState {
    pub fn parse(state: &str) -> Self {
        match state {
            "pending" => LifecycleState::Pending,
            "running" => LifecycleState::Running,
            "shutting-down" => LifecycleState::ShuttingDown,
            "terminated" => LifecycleState::Terminated,
            "stopping" => LifecycleState::Stopping,
            "stopped" => LifecycleState::Stopped,
            _ => LifecycleState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One launched virtual machine.
///
/// Created when the cloud adapter accepts a launch; refreshed only by the
/// adapter on state polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub instance_id: String,
    pub instance_type: String,
    pub architecture: Architecture,
    pub availability_zone: String,
    pub subnet_id: String,
    pub private_ip: String,
    pub public_ip: Option<String>,
    pub placement_group: Option<String>,
    pub state: LifecycleState,
}

impl InstanceHandle {
    /// Address the shell adapter should dial, public preferred.
    pub fn ssh_host(&self) -> Option<&str> {
        self.public_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .or({
                if self.private_ip.is_empty() {
                    None
                } else {
                    Some(self.private_ip.as_str())
                }
            })
    }
}

/// Classification of a remote command outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    Ok,
    NonZeroExit,
    Timeout,
    TransportError,
}

/// Result of one remote command. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub kind: OutcomeKind,
}

impl CommandOutcome {
    pub fn from_exit(exit_code: i32, stdout: String, stderr: String) -> Self {
        let kind = if exit_code == 0 {
            OutcomeKind::Ok
        } else {
            OutcomeKind::NonZeroExit
        };
        Self {
            exit_code,
            stdout,
            stderr,
            kind,
        }
    }

    /// Command hit its deadline; partial output is kept.
    pub fn timeout(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: -1,
            stdout,
            stderr,
            kind: OutcomeKind::Timeout,
        }
    }

    pub fn transport(error: impl fmt::Display) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: error.to_string(),
            kind: OutcomeKind::TransportError,
        }
    }

    pub fn success(&self) -> bool {
        self.kind == OutcomeKind::Ok
    }

    /// True when the command never produced an exit code.
    pub fn interrupted(&self) -> bool {
        matches!(self.kind, OutcomeKind::Timeout | OutcomeKind::TransportError)
    }
}

/// Parsed network driver module information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInfo {
    /// Version triple, when the module information could be parsed.
    pub version: Option<(u32, u32, u32)>,
    /// True when the version is at or above [`MIN_DRIVER_VERSION`].
    pub compatible: bool,
    /// Raw textual version as reported by the module.
    pub raw: String,
}

impl DriverInfo {
    pub fn unknown() -> Self {
        Self {
            version: None,
            compatible: false,
            raw: String::new(),
        }
    }

    pub fn version_string(&self) -> Option<&str> {
        if self.raw.is_empty() {
            None
        } else {
            Some(self.raw.as_str())
        }
    }
}

/// Well-known diagnostic bundle keys the verifier guarantees.
///
/// The bundle itself is open for extension; these are the keys verification
/// and reporting rely on.
pub mod evidence {
    pub const DRIVER_INFO: &str = "driver_info";
    pub const PTP_DEVICE_LISTING: &str = "ptp_device_listing";
    pub const PTP_SYSFS: &str = "ptp_sysfs";
    pub const DETECTED_INTERFACE: &str = "detected_interface";
    pub const CHRONY_SOURCES: &str = "chrony_sources";
    pub const CHRONY_TRACKING: &str = "chrony_tracking";
    pub const RELOAD_LOG: &str = "reload_log";
    pub const HWSTAMP_CAPS: &str = "hwstamp_caps";
    pub const SERVICE_STATUS: &str = "service_status";
    pub const SERVICE_LOGS: &str = "service_logs";
    pub const SERVICE_DEPS: &str = "service_deps";
    pub const RECOMMENDATIONS: &str = "recommendations";
}

/// Keyed collection of diagnostic text blobs gathered during a test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticBundle(BTreeMap<String, String>);

impl DiagnosticBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Append to an existing entry, separating sections with a blank line.
    pub fn append(&mut self, key: &str, value: &str) {
        match self.0.get_mut(key) {
            Some(existing) => {
                existing.push_str("\n\n");
                existing.push_str(value);
            }
            None => {
                self.0.insert(key.to_string(), value.to_string());
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Verification record for one instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClockEvidence {
    pub hardware_clock_present: bool,
    pub ptp_ena_symlink_present: bool,
    pub chrony_using_phc: bool,
    pub chrony_synchronized: bool,
    pub clock_device: Option<String>,
    pub time_offset_ns: Option<f64>,
    pub diagnostics: DiagnosticBundle,
}

/// The per-instance test result.
///
/// A launch failure still produces a Verdict carrying the attempted type
/// and ordinal, with `instance` absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub instance_type: String,
    /// Ordinal within the type group, 1-based.
    pub ordinal: u32,
    pub type_total: u32,
    pub instance: Option<InstanceHandle>,
    pub driver: DriverInfo,
    pub evidence: ClockEvidence,
    pub supported: bool,
    pub configuration_succeeded: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
}

impl Verdict {
    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_ref().map(|i| i.instance_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_from_instance_type() {
        assert_eq!(
            Architecture::from_instance_type("c7gn.xlarge"),
            Architecture::Arm64
        );
        assert_eq!(
            Architecture::from_instance_type("t4g.micro"),
            Architecture::Arm64
        );
        assert_eq!(
            Architecture::from_instance_type("c7i.large"),
            Architecture::X86_64
        );
        assert_eq!(
            Architecture::from_instance_type("c5n.18xlarge"),
            Architecture::X86_64
        );
        // Unknown families default to x86_64
        assert_eq!(
            Architecture::from_instance_type("z9z.huge"),
            Architecture::X86_64
        );
    }

    #[test]
    fn test_architecture_from_uname() {
        assert_eq!(Architecture::from_uname("x86_64\n"), Architecture::X86_64);
        assert_eq!(Architecture::from_uname("aarch64"), Architecture::Arm64);
        assert_eq!(Architecture::from_uname("riscv64"), Architecture::Unknown);
    }

    #[test]
    fn test_spec_display() {
        assert_eq!(InstanceTypeSpec::new("c7i.large", 1).to_string(), "c7i.large");
        assert_eq!(
            InstanceTypeSpec::new("m7i.xlarge", 3).to_string(),
            "m7i.xlarge:3"
        );
    }

    #[test]
    fn test_lifecycle_state_roundtrip() {
        for s in ["pending", "running", "shutting-down", "terminated", "stopping", "stopped"] {
            assert_eq!(LifecycleState::parse(s).as_str(), s);
        }
        assert_eq!(LifecycleState::parse("rebooting"), LifecycleState::Unknown);
    }

    #[test]
    fn test_command_outcome_classification() {
        let ok = CommandOutcome::from_exit(0, "out".into(), String::new());
        assert!(ok.success());
        assert!(!ok.interrupted());

        let nonzero = CommandOutcome::from_exit(2, String::new(), "err".into());
        assert_eq!(nonzero.kind, OutcomeKind::NonZeroExit);
        assert!(!nonzero.success());
        assert!(!nonzero.interrupted());

        let timed_out = CommandOutcome::timeout("partial".into(), String::new());
        assert!(timed_out.interrupted());
        assert_eq!(timed_out.stdout, "partial");
    }

    #[test]
    fn test_ssh_host_prefers_public() {
        let mut handle = InstanceHandle {
            instance_id: "i-0123456789abcdef0".into(),
            instance_type: "c7i.large".into(),
            architecture: Architecture::X86_64,
            availability_zone: "us-east-1a".into(),
            subnet_id: "subnet-12345678".into(),
            private_ip: "10.0.1.5".into(),
            public_ip: Some("54.1.2.3".into()),
            placement_group: None,
            state: LifecycleState::Running,
        };
        assert_eq!(handle.ssh_host(), Some("54.1.2.3"));

        handle.public_ip = None;
        assert_eq!(handle.ssh_host(), Some("10.0.1.5"));

        handle.private_ip = String::new();
        assert_eq!(handle.ssh_host(), None);
    }

    #[test]
    fn test_diagnostic_bundle_append() {
        let mut bundle = DiagnosticBundle::new();
        bundle.insert(evidence::RELOAD_LOG, "first");
        bundle.append(evidence::RELOAD_LOG, "second");
        assert_eq!(bundle.get(evidence::RELOAD_LOG), Some("first\n\nsecond"));
    }
}
