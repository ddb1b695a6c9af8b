//! Built-in system-table handlers
//!
//! Installed at server construction so freshly connected drivers can walk
//! their startup sequence: empty rowsets for the schema tables, and
//! `system.local` / `system.peers` rows synthesized from the bound topology.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::protocol::{Frame, Message, Rows};

use super::actions::{Action, ActionKind};
use super::result::{build_rows, Row};
use super::store::StubMapping;
use super::NodeContext;

/// The schema queries that receive an empty rowset by default
pub const EMPTY_METADATA_QUERIES: &[&str] = &[
    "SELECT * FROM system_schema.keyspaces",
    "SELECT * FROM system_schema.views",
    "SELECT * FROM system_schema.tables",
    "SELECT * FROM system_schema.columns",
    "SELECT * FROM system_schema.indexes",
    "SELECT * FROM system_schema.triggers",
    "SELECT * FROM system_schema.types",
    "SELECT * FROM system_schema.functions",
    "SELECT * FROM system_schema.aggregates",
    "SELECT * FROM system.schema_keyspaces",
    "SELECT * FROM system.schema_columnfamilies",
    "SELECT * FROM system.schema_columns",
    "SELECT * FROM system.schema_triggers",
    "SELECT * FROM system.schema_usertypes",
    "SELECT * FROM system.schema_functions",
    "SELECT * FROM system.schema_aggregates",
];

/// Answers one exact schema query with a rowless result
pub struct EmptyReturnMetadataHandler {
    query: String,
}

impl EmptyReturnMetadataHandler {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }
}

impl StubMapping for EmptyReturnMetadataHandler {
    fn matches(&self, _node: &NodeContext, frame: &Frame) -> bool {
        match &frame.message {
            Message::Query { query, .. } => query.eq_ignore_ascii_case(&self.query),
            _ => false,
        }
    }

    fn actions(&self, _node: &NodeContext, _frame: &Frame) -> Vec<Action> {
        vec![Action::now(ActionKind::Respond(Message::Rows(Rows::default())))]
    }
}

/// Answers `system.local` and `system.peers` queries with rows describing
/// the bound topology.
pub struct PeerMetadataHandler;

const PARTITIONER: &str = "org.apache.cassandra.dht.Murmur3Partitioner";
const DEFAULT_RELEASE_VERSION: &str = "3.0.12";
const DEFAULT_CQL_VERSION: &str = "3.4.4";

enum PeerQuery {
    Local,
    Peers,
}

fn classify(query: &str) -> Option<PeerQuery> {
    let lowered = query.to_ascii_lowercase();
    if lowered.contains("from system.peers") {
        Some(PeerQuery::Peers)
    } else if lowered.contains("from system.local") {
        Some(PeerQuery::Local)
    } else {
        None
    }
}

/// Columns named between SELECT and FROM, or None for `*`
fn selected_columns(query: &str) -> Option<Vec<String>> {
    let lowered = query.to_ascii_lowercase();
    let start = lowered.find("select")? + "select".len();
    let end = lowered.find(" from ")?;
    let list = query.get(start..end)?.trim();
    if list == "*" {
        return None;
    }
    Some(
        list.split(',')
            .map(|column| column.trim().to_string())
            .filter(|column| !column.is_empty())
            .collect(),
    )
}

impl StubMapping for PeerMetadataHandler {
    fn matches(&self, _node: &NodeContext, frame: &Frame) -> bool {
        match &frame.message {
            Message::Query { query, .. } => classify(query).is_some(),
            _ => false,
        }
    }

    fn actions(&self, node: &NodeContext, frame: &Frame) -> Vec<Action> {
        let Message::Query { query, .. } = &frame.message else {
            return Vec::new();
        };
        let Some(kind) = classify(query) else {
            return Vec::new();
        };

        let (mut rows, mut column_types) = match kind {
            PeerQuery::Local => (vec![local_row(node)], local_column_types()),
            PeerQuery::Peers => (peer_rows(node), peer_column_types()),
        };

        if let Some(requested) = selected_columns(query) {
            column_types.retain(|name, _| requested.contains(name));
            for row in &mut rows {
                row.retain(|name, _| requested.contains(name));
            }
        }

        let message = Message::Rows(build_rows(&rows, &column_types));
        vec![Action::now(ActionKind::Respond(message))]
    }
}

fn host_id(node: &NodeContext) -> String {
    let composed = ((node.cluster_id as u128) << 96)
        | ((node.data_center_id as u128) << 64)
        | (node.node_id as u128 + 1);
    Uuid::from_u128(composed).to_string()
}

fn schema_version(node: &NodeContext) -> String {
    Uuid::from_u128((node.cluster_id as u128) + 1).to_string()
}

fn release_version(node: &NodeContext) -> String {
    node.topology
        .cassandra_version
        .clone()
        .unwrap_or_else(|| DEFAULT_RELEASE_VERSION.to_string())
}

fn rack(node: &NodeContext) -> String {
    node.topology
        .resolve_peer_info(node.data_center_id, node.node_id, "rack")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "rack1".to_string())
}

fn tokens(node: &NodeContext) -> Value {
    let token = node
        .topology
        .resolve_peer_info(node.data_center_id, node.node_id, "token")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "0".to_string());
    json!([token])
}

fn local_column_types() -> BTreeMap<String, String> {
    BTreeMap::from(
        [
            ("key", "varchar"),
            ("bootstrapped", "varchar"),
            ("broadcast_address", "inet"),
            ("cluster_name", "varchar"),
            ("cql_version", "varchar"),
            ("data_center", "varchar"),
            ("listen_address", "inet"),
            ("partitioner", "varchar"),
            ("rack", "varchar"),
            ("release_version", "varchar"),
            ("tokens", "set<varchar>"),
            ("host_id", "uuid"),
            ("schema_version", "uuid"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    )
}

fn local_row(node: &NodeContext) -> Row {
    let ip = node.address.ip().to_string();
    let dc_name = node
        .topology
        .dc(node.data_center_id)
        .map(|dc| dc.effective_name())
        .unwrap_or_default();
    BTreeMap::from([
        ("key".to_string(), json!("local")),
        ("bootstrapped".to_string(), json!("COMPLETED")),
        ("broadcast_address".to_string(), json!(ip)),
        ("cluster_name".to_string(), json!(node.topology.effective_name())),
        ("cql_version".to_string(), json!(DEFAULT_CQL_VERSION)),
        ("data_center".to_string(), json!(dc_name)),
        ("listen_address".to_string(), json!(ip)),
        ("partitioner".to_string(), json!(PARTITIONER)),
        ("rack".to_string(), json!(rack(node))),
        ("release_version".to_string(), json!(release_version(node))),
        ("tokens".to_string(), tokens(node)),
        ("host_id".to_string(), json!(host_id(node))),
        ("schema_version".to_string(), json!(schema_version(node))),
    ])
}

fn peer_column_types() -> BTreeMap<String, String> {
    BTreeMap::from(
        [
            ("peer", "inet"),
            ("rpc_address", "inet"),
            ("data_center", "varchar"),
            ("rack", "varchar"),
            ("release_version", "varchar"),
            ("tokens", "set<varchar>"),
            ("host_id", "uuid"),
            ("schema_version", "uuid"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    )
}

fn peer_rows(node: &NodeContext) -> Vec<Row> {
    let mut rows = Vec::new();
    for dc in &node.topology.data_centers {
        for peer in &dc.nodes {
            if dc.id == node.data_center_id && peer.id == node.node_id {
                continue;
            }
            let Some(address) = peer.address else {
                continue;
            };
            let peer_ctx = NodeContext {
                cluster_id: node.cluster_id,
                data_center_id: dc.id,
                node_id: peer.id,
                address,
                topology: node.topology.clone(),
            };
            let ip = address.ip().to_string();
            rows.push(BTreeMap::from([
                ("peer".to_string(), json!(ip)),
                ("rpc_address".to_string(), json!(ip)),
                ("data_center".to_string(), json!(dc.effective_name())),
                ("rack".to_string(), json!(rack(&peer_ctx))),
                (
                    "release_version".to_string(),
                    json!(release_version(&peer_ctx)),
                ),
                ("tokens".to_string(), tokens(&peer_ctx)),
                ("host_id".to_string(), json!(host_id(&peer_ctx))),
                ("schema_version".to_string(), json!(schema_version(&peer_ctx))),
            ]));
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterSpec;
    use crate::protocol::QueryParameters;
    use std::sync::Arc;

    fn two_node_context() -> NodeContext {
        let mut cluster = ClusterSpec::named("test-cluster");
        cluster.id = Some(0);
        let dc = cluster.add_data_center();
        dc.add_node().address = Some("127.0.0.1:9042".parse().unwrap());
        dc.add_node().address = Some("127.0.0.2:9042".parse().unwrap());
        NodeContext {
            cluster_id: 0,
            data_center_id: 0,
            node_id: 0,
            address: "127.0.0.1:9042".parse().unwrap(),
            topology: Arc::new(cluster),
        }
    }

    fn query(text: &str) -> Frame {
        Frame::request(
            4,
            0,
            Message::Query {
                query: text.to_string(),
                params: QueryParameters::default(),
            },
        )
    }

    #[test]
    fn test_empty_handler_matches_case_insensitively() {
        let handler = EmptyReturnMetadataHandler::new("SELECT * FROM system_schema.keyspaces");
        let ctx = two_node_context();
        assert!(handler.matches(&ctx, &query("select * from system_schema.keyspaces")));
        assert!(!handler.matches(&ctx, &query("SELECT * FROM system_schema.tables")));
    }

    #[test]
    fn test_local_row_describes_node() {
        let ctx = two_node_context();
        let handler = PeerMetadataHandler;
        let frame = query("SELECT * FROM system.local WHERE key='local'");
        assert!(handler.matches(&ctx, &frame));
        let actions = handler.actions(&ctx, &frame);
        match &actions[0].kind {
            ActionKind::Respond(Message::Rows(rows)) => {
                assert_eq!(rows.rows.len(), 1);
                let cluster_name_idx = rows
                    .columns
                    .iter()
                    .position(|c| c.name == "cluster_name")
                    .unwrap();
                let cell = rows.rows[0][cluster_name_idx].as_ref().unwrap();
                assert_eq!(&cell[..], b"test-cluster");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_peers_rows_exclude_self() {
        let ctx = two_node_context();
        let handler = PeerMetadataHandler;
        let actions = handler.actions(&ctx, &query("SELECT * FROM system.peers"));
        match &actions[0].kind {
            ActionKind::Respond(Message::Rows(rows)) => {
                assert_eq!(rows.rows.len(), 1);
                let peer_idx = rows.columns.iter().position(|c| c.name == "peer").unwrap();
                let cell = rows.rows[0][peer_idx].as_ref().unwrap();
                assert_eq!(&cell[..], &[127, 0, 0, 2]);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_column_projection() {
        let ctx = two_node_context();
        let handler = PeerMetadataHandler;
        let actions = handler.actions(&ctx, &query("SELECT cluster_name FROM system.local"));
        match &actions[0].kind {
            ActionKind::Respond(Message::Rows(rows)) => {
                assert_eq!(rows.columns.len(), 1);
                assert_eq!(rows.columns[0].name, "cluster_name");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}
