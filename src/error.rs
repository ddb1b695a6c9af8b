//! Error types for cassette
//!
//! This module defines all error types surfaced by the simulator's public
//! operations. Uses `thiserror` for ergonomic error definitions.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for cassette operations
#[derive(Error, Debug)]
pub enum CassetteError {
    /// Caller passed something structurally invalid (unknown cluster id,
    /// node already belonging to a cluster, unknown connection address).
    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// The OS rejected a listener bind for a node.
    #[error("Failed to bind node {node} to {address}: {source}")]
    BindFailed {
        /// Id of the node whose bind failed, as `dc_id/node_id`.
        node: String,
        /// The address the bind was attempted on.
        address: SocketAddr,
        /// The underlying OS error.
        source: io::Error,
    },

    /// The overall register budget elapsed with at least one bind pending.
    #[error("Timed out binding cluster listeners")]
    BindTimeout,

    /// Malformed frame received from a client.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Connection was closed mid-frame.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration parsing or validation error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for cassette operations
pub type Result<T> = std::result::Result<T, CassetteError>;

impl CassetteError {
    /// Returns true if this error should close the connection it arose on
    #[cold]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CassetteError::Io(_) | CassetteError::ConnectionClosed | CassetteError::Codec(_)
        )
    }
}
