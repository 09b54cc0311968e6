//! Append-only audit sink for cloud control operations
//!
//! Every adapter call is recorded with its classified outcome so a run can
//! be reconstructed afterwards. The sink doubles as the orphan registry:
//! instance ids that were launched but never released show up in
//! [`AuditLog::orphans`] at program exit.

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One audited cloud operation.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub handle: Option<String>,
    pub outcome: String,
}

#[derive(Default)]
struct AuditState {
    records: Vec<AuditRecord>,
    live_instances: BTreeSet<String>,
}

/// Serialized append-only audit log, safe to share across workers.
#[derive(Default)]
pub struct AuditLog {
    state: Mutex<AuditState>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &str, handle: Option<&str>, outcome: &str) {
        tracing::debug!(
            operation = %operation,
            handle = handle.unwrap_or("-"),
            outcome = %outcome,
            "cloud audit"
        );
        let record = AuditRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            handle: handle.map(str::to_string),
            outcome: outcome.to_string(),
        };
        if let Ok(mut state) = self.state.lock() {
            state.records.push(record);
        }
    }

    /// Mark an instance as launched and not yet released.
    pub fn instance_launched(&self, instance_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.live_instances.insert(instance_id.to_string());
        }
    }

    /// Mark an instance as released (terminated or deliberately kept).
    pub fn instance_released(&self, instance_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.live_instances.remove(instance_id);
        }
    }

    /// Instance ids launched during the run that were never released.
    pub fn orphans(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.live_instances.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.state
            .lock()
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orphan_tracking() {
        let log = AuditLog::new();
        log.instance_launched("i-aaa");
        log.instance_launched("i-bbb");
        log.instance_released("i-aaa");
        assert_eq!(log.orphans(), vec!["i-bbb".to_string()]);

        log.instance_released("i-bbb");
        assert!(log.orphans().is_empty());
    }

    #[test]
    fn test_records_accumulate() {
        let log = AuditLog::new();
        log.record("launch", Some("i-aaa"), "ok");
        log.record("terminate", Some("i-aaa"), "ok");
        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, "launch");
        assert_eq!(records[1].handle.as_deref(), Some("i-aaa"));
    }
}
