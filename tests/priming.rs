//! Priming end-to-end tests
//!
//! Canned responses, parameter matching, prepare/execute bookkeeping and the
//! built-in system-table handlers, driven over real sockets.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use cassette::cluster::{ClusterSpec, Scope};
use cassette::protocol::{CqlError, Message, QueryParameters};
use cassette::resolver::LoopbackResolver;
use cassette::server::{BoundCluster, Server};
use cassette::stub::{
    prepared_statement_id, Prime, PrimeKind, PrimeResult, QueryMatcher, RequestMatcher,
};

mod common;
use common::*;

fn test_resolver() -> Arc<LoopbackResolver> {
    static NEXT_SUBNET: AtomicU8 = AtomicU8::new(1);
    let subnet = NEXT_SUBNET.fetch_add(1, Ordering::SeqCst);
    Arc::new(LoopbackResolver::new(
        Ipv4Addr::new(127, 98, subnet, 1),
        9042,
    ))
}

async fn one_node_cluster() -> (Server, Arc<BoundCluster>) {
    let server = Server::builder()
        .with_resolver(test_resolver())
        .build()
        .expect("server should build");
    let cluster = server
        .register(ClusterSpec::with_nodes(&[1]))
        .await
        .expect("cluster should register");
    (server, cluster)
}

async fn connect_node0(cluster: &BoundCluster) -> TestClient {
    let node = cluster.node(0, 0).expect("node 0/0");
    let mut client = TestClient::connect(node.address).await;
    assert!(matches!(client.startup().await, Message::Ready));
    client
}

#[tokio::test]
async fn test_simple_query_prime() {
    let (server, cluster) = one_node_cluster().await;
    server.prime(
        Prime::query(
            "Select * FROM TABLE2",
            PrimeResult::rows(
                vec![BTreeMap::from([
                    ("column1".to_string(), json!("column1")),
                    ("column2".to_string(), json!(2)),
                ])],
                BTreeMap::from([
                    ("column1".to_string(), "varchar".to_string()),
                    ("column2".to_string(), "int".to_string()),
                ]),
            ),
        )
        .for_cluster(cluster.id),
    );

    let mut client = connect_node0(&cluster).await;

    let rows = expect_rows(client.query("Select * FROM TABLE2").await);
    let decoded = decode_rows(&rows);
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].get("column1"), Some(&json!("column1")));
    assert_eq!(decoded[0].get("column2"), Some(&json!(2)));

    // A different query falls through to the default Void.
    assert!(matches!(
        client.query("Select * FROM OTHER").await,
        Message::Void
    ));
}

#[tokio::test]
async fn test_named_parameter_matching() {
    let (server, cluster) = one_node_cluster().await;
    let text = "SELECT * FROM users WHERE id = :id and id2 = :id2";
    server.prime(
        Prime::new(
            RequestMatcher::Query(QueryMatcher {
                query: text.to_string(),
                params: BTreeMap::from([
                    ("id".to_string(), json!(1)),
                    ("id2".to_string(), json!(2)),
                ]),
                param_types: BTreeMap::from([
                    ("id".to_string(), "bigint".to_string()),
                    ("id2".to_string(), "bigint".to_string()),
                ]),
                ..QueryMatcher::default()
            }),
            PrimeResult::rows(
                vec![BTreeMap::from([("id".to_string(), json!(1))])],
                BTreeMap::from([("id".to_string(), "bigint".to_string())]),
            ),
        )
        .for_cluster(cluster.id),
    );

    let mut client = connect_node0(&cluster).await;

    // Exact values match.
    let matched = client
        .query_with_params(text, named(&[("id", json!(1)), ("id2", json!(2))], "bigint"))
        .await;
    assert_eq!(decode_rows(&expect_rows(matched)).len(), 1);

    // Wrong value, missing value, and no values all miss the prime.
    for params in [
        named(&[("id", json!(2)), ("id2", json!(2))], "bigint"),
        named(&[("id", json!(1))], "bigint"),
        QueryParameters::default(),
    ] {
        assert!(matches!(
            client.query_with_params(text, params).await,
            Message::Void
        ));
    }
}

#[tokio::test]
async fn test_positional_parameter_matching() {
    let (server, cluster) = one_node_cluster().await;
    let text = "SELECT table FROM foo WHERE c1=?";
    server.prime(
        Prime::new(
            RequestMatcher::Query(QueryMatcher {
                query: text.to_string(),
                params: BTreeMap::from([("0".to_string(), json!("c1"))]),
                param_types: BTreeMap::from([("0".to_string(), "ascii".to_string())]),
                ..QueryMatcher::default()
            }),
            PrimeResult::rows(
                vec![BTreeMap::from([("table".to_string(), json!("foo"))])],
                BTreeMap::from([("table".to_string(), "ascii".to_string())]),
            ),
        )
        .for_cluster(cluster.id),
    );

    let mut client = connect_node0(&cluster).await;

    let matched = client
        .query_with_params(text, positional(&[json!("c1")], "ascii"))
        .await;
    assert_eq!(decode_rows(&expect_rows(matched)).len(), 1);

    // Extra value → no match.
    assert!(matches!(
        client
            .query_with_params(text, positional(&[json!("c1"), json!("extra")], "ascii"))
            .await,
        Message::Void
    ));

    // Query text off by one character → no match.
    assert!(matches!(
        client
            .query_with_params(
                "SELECT table FROM foo WHERE c1=!",
                positional(&[json!("c1")], "ascii")
            )
            .await,
        Message::Void
    ));
}

#[tokio::test]
async fn test_wildcard_parameter_matches_any_value() {
    let (server, cluster) = one_node_cluster().await;
    let text = "SELECT * FROM t WHERE x=?";
    server.prime(
        Prime::new(
            RequestMatcher::Query(QueryMatcher {
                query: text.to_string(),
                params: BTreeMap::from([("0".to_string(), json!("*"))]),
                param_types: BTreeMap::from([("0".to_string(), "bigint".to_string())]),
                ..QueryMatcher::default()
            }),
            PrimeResult::rows(
                vec![BTreeMap::from([("x".to_string(), json!(0))])],
                BTreeMap::from([("x".to_string(), "bigint".to_string())]),
            ),
        )
        .for_cluster(cluster.id),
    );

    let mut client = connect_node0(&cluster).await;
    for value in [json!(1), json!(2), json!(99)] {
        let response = client
            .query_with_params(text, positional(&[value], "bigint"))
            .await;
        assert_eq!(decode_rows(&expect_rows(response)).len(), 1);
    }
}

#[tokio::test]
async fn test_prepare_execute_auto_prime() {
    let (_server, cluster) = one_node_cluster().await;
    let mut client = connect_node0(&cluster).await;
    let text = "SELECT * FROM t WHERE k=?";

    let prepared = match client.prepare(text).await {
        Message::Prepared(prepared) => prepared,
        other => panic!("expected Prepared, got {other:?}"),
    };
    assert_eq!(prepared.id, prepared_statement_id(text));
    assert_eq!(prepared.variables.len(), 1);

    // Any value gets the deterministic empty rowset, not Unprepared.
    let response = client
        .execute(prepared.id, positional(&[json!("anything")], "varchar"))
        .await;
    let rows = expect_rows(response);
    assert!(rows.rows.is_empty());
}

#[tokio::test]
async fn test_execute_unknown_id_gets_unprepared() {
    let (_server, cluster) = one_node_cluster().await;
    let mut client = connect_node0(&cluster).await;

    let bogus = vec![0xAB; 16];
    match client.execute(bogus.clone(), QueryParameters::default()).await {
        Message::Error(CqlError::Unprepared { id, message }) => {
            assert_eq!(id, bogus);
            assert!(message.contains(&cassette::stub::hex_id(&bogus)));
        }
        other => panic!("expected Unprepared, got {other:?}"),
    }
}

#[tokio::test]
async fn test_prime_registered_after_prepare_matches_executes() {
    let (server, cluster) = one_node_cluster().await;
    let mut client = connect_node0(&cluster).await;
    let text = "SELECT * FROM t WHERE k=?";

    let prepared = match client.prepare(text).await {
        Message::Prepared(prepared) => prepared,
        other => panic!("expected Prepared, got {other:?}"),
    };

    // Prime after the prepare; the deterministic id still lines up.
    server.prime(
        Prime::new(
            RequestMatcher::Query(QueryMatcher {
                query: text.to_string(),
                params: BTreeMap::from([("0".to_string(), json!("hit"))]),
                param_types: BTreeMap::from([("0".to_string(), "varchar".to_string())]),
                ..QueryMatcher::default()
            }),
            PrimeResult::rows(
                vec![BTreeMap::from([("k".to_string(), json!("hit"))])],
                BTreeMap::from([("k".to_string(), "varchar".to_string())]),
            ),
        )
        .for_cluster(cluster.id),
    );

    let response = client
        .execute(prepared.id.clone(), positional(&[json!("hit")], "varchar"))
        .await;
    assert_eq!(decode_rows(&expect_rows(response)).len(), 1);

    // Non-matching values still fall back to the auto-primed empty rowset.
    let response = client
        .execute(prepared.id, positional(&[json!("miss")], "varchar"))
        .await;
    assert!(expect_rows(response).rows.is_empty());
}

#[tokio::test]
async fn test_primed_error_results() {
    let (server, cluster) = one_node_cluster().await;
    server.prime(
        Prime::query(
            "SELECT * FROM flaky",
            PrimeResult::ReadTimeout {
                consistency_level: cassette::protocol::Consistency::Quorum,
                received: 1,
                block_for: 2,
                data_present: false,
                delay_in_ms: 0,
                ignore_on_prepare: false,
            },
        )
        .for_cluster(cluster.id),
    );
    server.prime(
        Prime::query(
            "SELECT * FROM gone",
            PrimeResult::Unavailable {
                consistency_level: cassette::protocol::Consistency::All,
                required: 3,
                alive: 1,
                delay_in_ms: 0,
                ignore_on_prepare: false,
            },
        )
        .for_cluster(cluster.id),
    );

    let mut client = connect_node0(&cluster).await;

    match client.query("SELECT * FROM flaky").await {
        Message::Error(CqlError::ReadTimeout {
            received, block_for, ..
        }) => {
            assert_eq!(received, 1);
            assert_eq!(block_for, 2);
        }
        other => panic!("expected ReadTimeout, got {other:?}"),
    }

    match client.query("SELECT * FROM gone").await {
        Message::Error(CqlError::Unavailable { required, alive, .. }) => {
            assert_eq!(required, 3);
            assert_eq!(alive, 1);
        }
        other => panic!("expected Unavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delay_action_defers_response() {
    let (server, cluster) = one_node_cluster().await;
    server.prime(
        Prime::query(
            "SELECT * FROM slow",
            PrimeResult::Success {
                rows: Vec::new(),
                column_types: BTreeMap::new(),
                delay_in_ms: 300,
                ignore_on_prepare: false,
            },
        )
        .for_cluster(cluster.id),
    );

    let mut client = connect_node0(&cluster).await;
    let started = Instant::now();
    let response = client.query("SELECT * FROM slow").await;
    assert!(matches!(response, Message::Rows(_)));
    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "response should have been delayed, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_close_connection_prime_drops_channel() {
    let (server, cluster) = one_node_cluster().await;
    server.prime(
        Prime::query(
            "SELECT * FROM doom",
            PrimeResult::CloseConnection {
                scope: cassette::stub::DisconnectScope::Connection,
                close_type: cassette::stub::CloseType::Disconnect,
                delay_in_ms: 0,
            },
        )
        .for_cluster(cluster.id),
    );

    let mut client = connect_node0(&cluster).await;
    client
        .send(Message::Query {
            query: "SELECT * FROM doom".to_string(),
            params: QueryParameters::default(),
        })
        .await;
    assert!(client.is_disconnected().await);
}

#[tokio::test]
async fn test_consistency_scoped_prime() {
    let (server, cluster) = one_node_cluster().await;
    let text = "SELECT * FROM picky";
    server.prime(
        Prime::new(
            RequestMatcher::Query(QueryMatcher {
                query: text.to_string(),
                consistency_level: vec![cassette::protocol::Consistency::Quorum],
                ..QueryMatcher::default()
            }),
            PrimeResult::rows(
                vec![BTreeMap::from([("a".to_string(), json!("b"))])],
                BTreeMap::from([("a".to_string(), "varchar".to_string())]),
            ),
        )
        .for_cluster(cluster.id),
    );

    let mut client = connect_node0(&cluster).await;

    let hit = client
        .query_with_params(text, with_consistency(cassette::protocol::Consistency::Quorum))
        .await;
    assert_eq!(decode_rows(&expect_rows(hit)).len(), 1);

    // Default consistency (ONE) misses the prime.
    assert!(matches!(client.query(text).await, Message::Void));
}

#[tokio::test]
async fn test_use_keyspace_and_options_defaults() {
    let (_server, cluster) = one_node_cluster().await;
    let mut client = connect_node0(&cluster).await;

    match client.query("  use my_keyspace").await {
        Message::SetKeyspace(keyspace) => assert_eq!(keyspace, "my_keyspace"),
        other => panic!("expected SetKeyspace, got {other:?}"),
    }

    match client.request(Message::Options).await.message {
        Message::Supported(options) => {
            assert_eq!(
                options.get("PROTOCOL_VERSIONS"),
                Some(&vec![
                    "3/v3".to_string(),
                    "4/v4".to_string(),
                    "5/v5-beta".to_string()
                ])
            );
            assert_eq!(options.get("CQL_VERSION"), Some(&vec!["3.4.4".to_string()]));
        }
        other => panic!("expected Supported, got {other:?}"),
    }
}

#[tokio::test]
async fn test_system_table_builtins() {
    let (_server, cluster) = one_node_cluster().await;
    let mut client = connect_node0(&cluster).await;

    // Schema queries get empty rowsets.
    let rows = expect_rows(client.query("SELECT * FROM system_schema.keyspaces").await);
    assert!(rows.rows.is_empty());

    // system.local describes the node.
    let local = expect_rows(client.query("SELECT * FROM system.local WHERE key='local'").await);
    let decoded = decode_rows(&local);
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].get("key"), Some(&json!("local")));
    assert!(decoded[0].contains_key("tokens"));
}

#[tokio::test]
async fn test_peers_reflect_topology() {
    let server = Server::builder()
        .with_resolver(test_resolver())
        .build()
        .expect("server should build");
    let cluster = server
        .register(ClusterSpec::with_nodes(&[3]))
        .await
        .expect("cluster should register");

    let mut client = connect_node0(&cluster).await;
    let peers = expect_rows(client.query("SELECT * FROM system.peers").await);
    // Two peers: everyone but the queried node.
    assert_eq!(peers.rows.len(), 2);
}

#[tokio::test]
async fn test_batch_falls_back_to_void() {
    let (_server, cluster) = one_node_cluster().await;
    let mut client = connect_node0(&cluster).await;

    let batch = Message::Batch(cassette::protocol::Batch {
        batch_type: 0,
        queries: vec![cassette::protocol::BatchQuery::Text(
            "INSERT INTO t (a) VALUES (1)".to_string(),
            vec![],
        )],
        consistency: cassette::protocol::Consistency::One,
    });
    assert!(matches!(client.request(batch).await.message, Message::Void));
}

#[tokio::test]
async fn test_prime_clear_prime_round_trip() {
    let (server, cluster) = one_node_cluster().await;
    let prime = Prime::query("SELECT * FROM once", PrimeResult::no_rows())
        .for_cluster(cluster.id);

    server.prime(prime.clone());
    assert_eq!(server.stub_store().primes(PrimeKind::User).len(), 1);

    assert_eq!(server.clear_primes(&prime.scope, PrimeKind::User), 1);
    assert_eq!(server.stub_store().primes(PrimeKind::User).len(), 0);

    server.prime(prime);
    assert_eq!(server.stub_store().primes(PrimeKind::User).len(), 1);
}

#[tokio::test]
async fn test_clear_preserves_internal_primes() {
    let (server, cluster) = one_node_cluster().await;
    let mut client = connect_node0(&cluster).await;
    let text = "SELECT * FROM t WHERE k=?";

    let prepared = match client.prepare(text).await {
        Message::Prepared(prepared) => prepared,
        other => panic!("expected Prepared, got {other:?}"),
    };

    server.prime(Prime::query("SELECT 1", PrimeResult::no_rows()).for_cluster(cluster.id));
    server.clear_primes(&Scope::cluster(cluster.id), PrimeKind::User);

    // The auto-registered prepared statement still answers.
    let response = client
        .execute(prepared.id, positional(&[json!("v")], "varchar"))
        .await;
    assert!(expect_rows(response).rows.is_empty());
}

#[tokio::test]
async fn test_activity_log_marks_primed_requests() {
    let (server, cluster) = one_node_cluster().await;
    server.prime(Prime::query("SELECT * FROM primed", PrimeResult::no_rows()).for_cluster(cluster.id));

    let mut client = connect_node0(&cluster).await;
    client.query("SELECT * FROM primed").await;
    client.query("SELECT * FROM unprimed").await;

    let log = server.activity_log(&Scope::cluster(cluster.id));
    let primed = log.iter().find(|e| e.query == "SELECT * FROM primed").unwrap();
    let unprimed = log.iter().find(|e| e.query == "SELECT * FROM unprimed").unwrap();
    assert!(primed.primed);
    assert!(!unprimed.primed);
}

#[test]
fn test_prime_json_round_trip_is_stable() {
    let json = r#"{
        "when": {
            "request": "query",
            "query": "SELECT * FROM users WHERE id = :id",
            "consistency_level": ["LOCAL_ONE"],
            "params": {"id": 1},
            "param_types": {"id": "bigint"}
        },
        "then": {
            "result": "success",
            "rows": [{"id": 1}],
            "column_types": {"id": "bigint"},
            "delay_in_ms": 0,
            "ignore_on_prepare": false
        },
        "scope": {"cluster_id": 2}
    }"#;
    let prime: Prime = serde_json::from_str(json).unwrap();
    let serialized = serde_json::to_string(&prime).unwrap();
    let reparsed: Prime = serde_json::from_str(&serialized).unwrap();
    assert_eq!(reparsed, prime);
    assert_eq!(serde_json::to_string(&reparsed).unwrap(), serialized);
}
