//! # Cassette
//!
//! A simulator of a Cassandra-compatible cluster for deterministic driver
//! testing. A [`Server`] binds a declarative Cluster→DataCenter→Node
//! topology onto real loopback listeners; each bound node speaks the native
//! protocol with real driver clients and answers from operator-registered
//! primes or a small built-in engine covering the handshake, schema-metadata
//! and bookkeeping queries drivers issue before they consider a cluster
//! usable.
//!
//! ```no_run
//! use cassette::cluster::ClusterSpec;
//! use cassette::server::Server;
//! use cassette::stub::{Prime, PrimeResult};
//!
//! # async fn example() -> cassette::Result<()> {
//! let server = Server::new();
//! let cluster = server.register(ClusterSpec::with_nodes(&[3, 3])).await?;
//!
//! server.prime(
//!     Prime::query("SELECT * FROM users", PrimeResult::no_rows()).for_cluster(cluster.id),
//! );
//!
//! server.unregister(cluster.id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cluster`] | Topology specs, scopes, activity logs, connection reports |
//! | [`protocol`] | Native-protocol codec and typed messages |
//! | [`resolver`] | Listen-address allocation and recycling |
//! | [`server`] | Registry, bind/lifecycle manager, connection engine |
//! | [`stub`] | Primes, request matching, response actions |

pub mod cluster;
pub mod config;
pub mod error;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod stub;

pub use config::Config;
pub use error::{CassetteError, Result};
pub use server::Server;
