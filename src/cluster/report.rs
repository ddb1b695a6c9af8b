//! Connection reports
//!
//! The tree-shaped answer to `connections(scope)`: cluster → data center →
//! node, with each node's listen address and currently open client
//! connections.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConnectionReport {
    pub id: u64,
    pub data_centers: Vec<DataCenterConnectionReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCenterConnectionReport {
    pub id: u64,
    pub nodes: Vec<NodeConnectionReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnectionReport {
    pub id: u64,
    /// The node's listen address
    pub address: SocketAddr,
    /// Remote addresses of open client connections
    pub connections: Vec<SocketAddr>,
}

impl ClusterConnectionReport {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            data_centers: Vec::new(),
        }
    }

    /// Add a node's connection list, creating its data-center entry on demand
    pub fn add_node(
        &mut self,
        data_center_id: u64,
        node_id: u64,
        address: SocketAddr,
        connections: Vec<SocketAddr>,
    ) {
        let dc = match self
            .data_centers
            .iter_mut()
            .position(|dc| dc.id == data_center_id)
        {
            Some(pos) => &mut self.data_centers[pos],
            None => {
                self.data_centers.push(DataCenterConnectionReport {
                    id: data_center_id,
                    nodes: Vec::new(),
                });
                self.data_centers.last_mut().expect("just pushed")
            }
        };
        dc.nodes.push(NodeConnectionReport {
            id: node_id,
            address,
            connections,
        });
    }

    /// Total connections across the whole report
    pub fn connection_count(&self) -> usize {
        self.data_centers
            .iter()
            .flat_map(|dc| dc.nodes.iter())
            .map(|n| n.connections.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_node_groups_by_dc() {
        let mut report = ClusterConnectionReport::new(7);
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let client: SocketAddr = "127.0.0.1:55001".parse().unwrap();
        report.add_node(0, 0, addr, vec![client]);
        report.add_node(0, 1, addr, vec![]);
        report.add_node(1, 0, addr, vec![client, client]);

        assert_eq!(report.data_centers.len(), 2);
        assert_eq!(report.data_centers[0].nodes.len(), 2);
        assert_eq!(report.connection_count(), 3);
    }

    #[test]
    fn test_json_field_names() {
        let report = ClusterConnectionReport::new(1);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("data_centers").is_some());
    }
}
