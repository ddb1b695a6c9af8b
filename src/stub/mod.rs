//! Stub store and request matching
//!
//! Primes are registered `(matcher, result, scope)` triples; the store
//! resolves an incoming frame to the first applicable stub and yields an
//! ordered action list for the connection engine to execute.

mod actions;
mod matcher;
mod peers;
mod prime;
mod result;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::ClusterSpec;

pub use actions::{Action, ActionKind, CloseType, DisconnectScope};
pub use matcher::{hex_id, prepared_statement_id, QueryMatcher, RequestMatcher};
pub use peers::{EmptyReturnMetadataHandler, PeerMetadataHandler, EMPTY_METADATA_QUERIES};
pub use prime::Prime;
pub use result::{build_rows, PrimeResult, Row};
pub use store::{PrimeKind, StubMapping, StubStore};

/// The node-side view matching needs: identity for scope checks plus the
/// bound topology for the peer-metadata built-in.
#[derive(Clone)]
pub struct NodeContext {
    pub cluster_id: u64,
    pub data_center_id: u64,
    pub node_id: u64,
    pub address: SocketAddr,
    pub topology: Arc<ClusterSpec>,
}
