//! The stub store
//!
//! Holds user primes, internal primes (registered by the engine on Prepare)
//! and built-in handlers. Lookup walks user/internal primes first so an
//! explicit prime overrides a built-in default, then the built-ins.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cluster::Scope;
use crate::protocol::Frame;

use super::actions::Action;
use super::peers::{EmptyReturnMetadataHandler, PeerMetadataHandler, EMPTY_METADATA_QUERIES};
use super::prime::Prime;
use super::NodeContext;

/// Anything the store can match and answer with
pub trait StubMapping: Send + Sync {
    /// Whether this stub applies to the frame arriving at the node
    fn matches(&self, node: &NodeContext, frame: &Frame) -> bool;

    /// The ordered action list for a frame this stub matched
    fn actions(&self, node: &NodeContext, frame: &Frame) -> Vec<Action>;
}

impl StubMapping for Prime {
    fn matches(&self, node: &NodeContext, frame: &Frame) -> bool {
        self.scope
            .contains(node.cluster_id, node.data_center_id, node.node_id)
            && self.when.matches(frame)
    }

    fn actions(&self, _node: &NodeContext, frame: &Frame) -> Vec<Action> {
        Prime::actions(self, frame)
    }
}

/// Which category of primes a `clear` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimeKind {
    /// Operator-registered primes
    User,
    /// Primes the engine registered itself (prepared statements)
    Internal,
    /// Both
    All,
}

struct StoredPrime {
    prime: Arc<Prime>,
    internal: bool,
}

/// Registered stubs, in registration order per category
#[derive(Default)]
pub struct StubStore {
    primes: RwLock<Vec<StoredPrime>>,
    builtins: Vec<Arc<dyn StubMapping>>,
}

impl StubStore {
    /// An empty store with no built-ins
    pub fn new() -> Self {
        Self::default()
    }

    /// A store carrying the standard built-ins: peer metadata plus empty
    /// rowsets for the common schema queries.
    pub fn with_builtins() -> Self {
        let mut builtins: Vec<Arc<dyn StubMapping>> = vec![Arc::new(PeerMetadataHandler)];
        for query in EMPTY_METADATA_QUERIES {
            builtins.push(Arc::new(EmptyReturnMetadataHandler::new(*query)));
        }
        Self {
            primes: RwLock::new(Vec::new()),
            builtins,
        }
    }

    /// Register an operator prime
    pub fn register(&self, prime: Prime) {
        self.primes.write().push(StoredPrime {
            prime: Arc::new(prime),
            internal: false,
        });
    }

    /// Register an engine-internal prime
    pub fn register_internal(&self, prime: Prime) {
        self.primes.write().push(StoredPrime {
            prime: Arc::new(prime),
            internal: true,
        });
    }

    /// First stub accepting the frame at this node. User primes are
    /// consulted before internal ones, so a prime registered after a Prepare
    /// still beats the auto-registered prepared-statement stub; built-ins
    /// come last so explicit primes override the defaults.
    pub fn find(&self, node: &NodeContext, frame: &Frame) -> Option<Arc<dyn StubMapping>> {
        {
            let primes = self.primes.read();
            for internal in [false, true] {
                for stored in primes.iter().filter(|stored| stored.internal == internal) {
                    if stored.prime.matches(node, frame) {
                        return Some(stored.prime.clone() as Arc<dyn StubMapping>);
                    }
                }
            }
        }
        self.builtins
            .iter()
            .find(|builtin| builtin.matches(node, frame))
            .cloned()
    }

    /// Remove primes of the given kind whose scope falls within `scope`.
    /// Built-ins always survive. Returns how many were removed.
    pub fn clear(&self, scope: &Scope, kind: PrimeKind) -> usize {
        let mut primes = self.primes.write();
        let before = primes.len();
        primes.retain(|stored| {
            let kind_hit = match kind {
                PrimeKind::User => !stored.internal,
                PrimeKind::Internal => stored.internal,
                PrimeKind::All => true,
            };
            !(kind_hit && scope_within(&stored.prime.scope, scope))
        });
        before - primes.len()
    }

    /// Number of registered primes, internal ones included
    pub fn len(&self) -> usize {
        self.primes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.primes.read().is_empty()
    }

    /// Snapshot of the registered primes of a kind, for inspection
    pub fn primes(&self, kind: PrimeKind) -> Vec<Arc<Prime>> {
        self.primes
            .read()
            .iter()
            .filter(|stored| match kind {
                PrimeKind::User => !stored.internal,
                PrimeKind::Internal => stored.internal,
                PrimeKind::All => true,
            })
            .map(|stored| stored.prime.clone())
            .collect()
    }
}

/// Whether `inner` selects a subset of `outer`
fn scope_within(inner: &Scope, outer: &Scope) -> bool {
    if outer.cluster_id.is_some() && inner.cluster_id != outer.cluster_id {
        return false;
    }
    if outer.data_center_id.is_some() && inner.data_center_id != outer.data_center_id {
        return false;
    }
    if outer.node_id.is_some() && inner.node_id != outer.node_id {
        return false;
    }
    true
}
