//! Per-cluster activity log
//!
//! An append-only record of every request a cluster's nodes observed, used
//! by tests to assert driver behavior. Readers get point-in-time snapshots;
//! writers never block each other for long.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One observed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLog {
    /// Query text, or the message kind for non-query frames
    pub query: String,

    #[serde(rename = "consistency_level", skip_serializing_if = "Option::is_none")]
    pub consistency: Option<String>,

    #[serde(
        rename = "serial_consistency_level",
        skip_serializing_if = "Option::is_none"
    )]
    pub serial_consistency: Option<String>,

    /// Remote address of the connection the request arrived on
    pub connection: String,

    /// Epoch milliseconds at receipt
    pub timestamp: u64,

    /// Whether a prime matched this request
    pub primed: bool,

    /// Data center of the receiving node
    pub data_center_id: u64,

    /// Receiving node
    pub node_id: u64,
}

/// Current time as epoch milliseconds
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Append-only log of [`QueryLog`] records
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: RwLock<Vec<QueryLog>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record
    pub fn record(&self, entry: QueryLog) {
        self.entries.write().push(entry);
    }

    /// Snapshot of all records so far
    pub fn snapshot(&self) -> Vec<QueryLog> {
        self.entries.read().clone()
    }

    /// Snapshot of records matching the filter
    pub fn filtered(&self, mut keep: impl FnMut(&QueryLog) -> bool) -> Vec<QueryLog> {
        self.entries.read().iter().filter(|e| keep(e)).cloned().collect()
    }

    /// Drop all records
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Keep only records matching the predicate
    pub fn retain(&self, mut keep: impl FnMut(&QueryLog) -> bool) {
        self.entries.write().retain(|entry| keep(entry));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
