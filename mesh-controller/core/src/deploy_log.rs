//! Bounded record of per-pod deployment outcomes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeployRecord {
    pub timestamp: DateTime<Utc>,
    pub pod_name: String,
    pub pod_ip: String,
    pub success: bool,
    pub reason: String,
}

/// Ring of deploy records; the oldest entries are evicted on overflow.
#[derive(Debug)]
pub struct DeployLog {
    capacity: usize,
    entries: Mutex<VecDeque<DeployRecord>>,
}

// === impl DeployLog ===

impl DeployLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record_success(&self, pod_name: &str, pod_ip: &str) {
        self.push(DeployRecord {
            timestamp: Utc::now(),
            pod_name: pod_name.to_string(),
            pod_ip: pod_ip.to_string(),
            success: true,
            reason: String::new(),
        });
    }

    pub fn record_failure(&self, pod_name: &str, pod_ip: &str, reason: impl ToString) {
        self.push(DeployRecord {
            timestamp: Utc::now(),
            pod_name: pod_name.to_string(),
            pod_ip: pod_ip.to_string(),
            success: false,
            reason: reason.to_string(),
        });
    }

    /// Returns the records, oldest first.
    pub fn snapshot(&self) -> Vec<DeployRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    fn push(&self, record: DeployRecord) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_on_overflow() {
        let log = DeployLog::new(2);
        log.record_success("pod-a", "10.0.0.1");
        log.record_failure("pod-b", "10.0.0.2", "mesh node returned 500");
        log.record_success("pod-c", "10.0.0.3");

        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pod_name, "pod-b");
        assert!(!records[0].success);
        assert_eq!(records[0].reason, "mesh node returned 500");
        assert_eq!(records[1].pod_name, "pod-c");
        assert!(records[1].success);
    }

    #[test]
    fn serializes_to_json() {
        let log = DeployLog::new(8);
        log.record_failure("pod-a", "10.0.0.1", "timed out");
        let encoded = serde_json::to_value(log.snapshot()).unwrap();
        assert_eq!(encoded[0]["PodName"], "pod-a");
        assert_eq!(encoded[0]["Success"], false);
        assert_eq!(encoded[0]["Reason"], "timed out");
    }
}
