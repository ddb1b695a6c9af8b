//! Scope selectors
//!
//! A scope narrows an operation or a prime to a cluster, a data center
//! within it, or a single node. Unset fields widen: the empty scope selects
//! everything.

use serde::{Deserialize, Serialize};

/// A `{cluster?, dc?, node?}` selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_center_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
}

impl Scope {
    /// The empty scope: selects every registered cluster
    pub fn any() -> Self {
        Self::default()
    }

    /// Scope to a whole cluster
    pub fn cluster(cluster_id: u64) -> Self {
        Self {
            cluster_id: Some(cluster_id),
            ..Self::default()
        }
    }

    /// Scope to one data center
    pub fn data_center(cluster_id: u64, data_center_id: u64) -> Self {
        Self {
            cluster_id: Some(cluster_id),
            data_center_id: Some(data_center_id),
            node_id: None,
        }
    }

    /// Scope to a single node
    pub fn node(cluster_id: u64, data_center_id: u64, node_id: u64) -> Self {
        Self {
            cluster_id: Some(cluster_id),
            data_center_id: Some(data_center_id),
            node_id: Some(node_id),
        }
    }

    /// Whether no field is set
    pub fn is_unset(&self) -> bool {
        self.cluster_id.is_none() && self.data_center_id.is_none() && self.node_id.is_none()
    }

    /// Whether the given node falls inside this scope
    pub fn contains(&self, cluster_id: u64, data_center_id: u64, node_id: u64) -> bool {
        if self.cluster_id.is_some_and(|id| id != cluster_id) {
            return false;
        }
        if self.data_center_id.is_some_and(|id| id != data_center_id) {
            return false;
        }
        !self.node_id.is_some_and(|id| id != node_id)
    }
}
