//! Declarative cluster topologies
//!
//! A `ClusterSpec` is the pure-configuration tree Cluster→DataCenter→Node.
//! Children are serialized (`data_centers`, `nodes`) and parents are not;
//! ids are assigned in insertion order starting at 0. A spec serves traffic
//! only once registered with a [`Server`](crate::server::Server), which
//! produces the bound counterpart of this tree.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root of a declarative topology
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Server-assigned when absent at registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dse_version: Option<String>,

    /// Free-form peer info, resolvable from member nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_info: BTreeMap<String, Value>,

    #[serde(default)]
    pub data_centers: Vec<DataCenterSpec>,
}

/// A data center within a cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataCenterSpec {
    /// Assigned in creation order within the cluster
    #[serde(default)]
    pub id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dse_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_info: BTreeMap<String, Value>,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

/// A node within a data center, or standalone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Assigned in creation order within the data center
    #[serde(default)]
    pub id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Listen address; allocated from the resolver when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dse_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_info: BTreeMap<String, Value>,

    /// Set when the node was created inside a data center; such a node must
    /// be registered via its cluster, never standalone.
    #[serde(skip)]
    parent_dc: Option<u64>,
}

impl PartialEq for NodeSpec {
    fn eq(&self, other: &Self) -> bool {
        // The parent marker is bookkeeping, not identity.
        self.id == other.id
            && self.name == other.name
            && self.address == other.address
            && self.cassandra_version == other.cassandra_version
            && self.dse_version == other.dse_version
            && self.peer_info == other.peer_info
    }
}

impl ClusterSpec {
    /// A builder-style spec with a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Convenience constructor: one data center per entry, each with the
    /// given number of nodes.
    pub fn with_nodes(node_counts: &[usize]) -> Self {
        let mut cluster = Self::default();
        for &count in node_counts {
            let dc = cluster.add_data_center();
            for _ in 0..count {
                dc.add_node();
            }
        }
        cluster
    }

    /// Append a data center, assigning the next id
    pub fn add_data_center(&mut self) -> &mut DataCenterSpec {
        let id = self.data_centers.len() as u64;
        self.data_centers.push(DataCenterSpec {
            id,
            ..DataCenterSpec::default()
        });
        self.data_centers.last_mut().expect("just pushed")
    }

    /// Duplicate another data center's scalar attributes into a new, empty
    /// data center of this cluster. The copy starts with zero nodes.
    pub fn add_data_center_copy(&mut self, source: &DataCenterSpec) -> &mut DataCenterSpec {
        let dc = self.add_data_center();
        dc.name = source.name.clone();
        dc.cassandra_version = source.cassandra_version.clone();
        dc.dse_version = source.dse_version.clone();
        dc.peer_info = source.peer_info.clone();
        dc
    }

    /// The data center with the given id, if any
    pub fn dc(&self, id: u64) -> Option<&DataCenterSpec> {
        self.data_centers.iter().find(|dc| dc.id == id)
    }

    /// The node with the given data center and node ids, if any
    pub fn node(&self, dc_id: u64, node_id: u64) -> Option<&NodeSpec> {
        self.dc(dc_id)?.nodes.iter().find(|n| n.id == node_id)
    }

    /// All nodes of all data centers, in id order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.data_centers.iter().flat_map(|dc| dc.nodes.iter())
    }

    /// Total node count
    pub fn node_count(&self) -> usize {
        self.data_centers.iter().map(|dc| dc.nodes.len()).sum()
    }

    /// Look up a peer-info key for a node, walking node → dc → cluster
    pub fn resolve_peer_info(&self, dc_id: u64, node_id: u64, key: &str) -> Option<&Value> {
        if let Some(node) = self.node(dc_id, node_id) {
            if let Some(value) = node.peer_info.get(key) {
                return Some(value);
            }
        }
        if let Some(dc) = self.dc(dc_id) {
            if let Some(value) = dc.peer_info.get(key) {
                return Some(value);
            }
        }
        self.peer_info.get(key)
    }

    /// Effective display name (`name` or the assigned id)
    pub fn effective_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.id.map_or_else(|| "0".to_string(), |id| id.to_string()))
    }
}

impl DataCenterSpec {
    /// Append a node, assigning the next id
    pub fn add_node(&mut self) -> &mut NodeSpec {
        let id = self.nodes.len() as u64;
        self.nodes.push(NodeSpec {
            id,
            parent_dc: Some(self.id),
            ..NodeSpec::default()
        });
        self.nodes.last_mut().expect("just pushed")
    }

    /// Effective display name (`name` or `dc<id>`)
    pub fn effective_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("dc{}", self.id))
    }
}

impl NodeSpec {
    /// Effective display name (`name` or `node<id>`)
    pub fn effective_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("node{}", self.id))
    }

    /// Whether this node was created inside a data center
    pub fn has_parent(&self) -> bool {
        self.parent_dc.is_some()
    }
}

/// Token assignment for a node that supplied none: with `node_count` nodes in
/// data center `dc_id`, node `node_id` gets `(n · ⌊2^64 / N⌋) + d · 100`,
/// wrapping, rendered as a signed decimal string.
pub fn assign_token(dc_id: u64, node_id: u64, node_count: usize) -> String {
    let count = node_count.max(1) as u128;
    let base = ((1u128 << 64) / count) as u64;
    let token = node_id
        .wrapping_mul(base)
        .wrapping_add(dc_id.wrapping_mul(100));
    (token as i64).to_string()
}
