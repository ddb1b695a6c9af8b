//! Response actions
//!
//! A matched stub yields an ordered list of actions; the connection engine
//! executes them sequentially, honoring each action's delay before it runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Message;

/// Which set of channels a disconnect action closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectScope {
    /// Only the connection the request arrived on
    Connection,
    /// All connections of the receiving node
    Node,
    /// All connections of the receiving node's data center
    DataCenter,
    /// All connections of the receiving node's cluster
    Cluster,
}

/// How a channel is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseType {
    /// Full close
    Disconnect,
    /// Stop reading; the peer's writes back up
    ShutdownRead,
    /// Half-close the write side (FIN)
    ShutdownWrite,
}

/// One step of a stub's response plan
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    /// Send this message back on the originating connection
    Respond(Message),
    /// Acknowledge without emitting anything
    NoResponse,
    /// Close the indicated channels
    Disconnect {
        scope: DisconnectScope,
        close_type: CloseType,
    },
}

/// An action plus the delay observed before it runs
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub delay: Duration,
}

impl Action {
    /// An undelayed action
    pub fn now(kind: ActionKind) -> Self {
        Self {
            kind,
            delay: Duration::ZERO,
        }
    }

    /// An action delayed by the given number of milliseconds
    pub fn after_ms(kind: ActionKind, delay_ms: u64) -> Self {
        Self {
            kind,
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Respond immediately with the given message
    pub fn respond(message: Message) -> Self {
        Self::now(ActionKind::Respond(message))
    }
}
