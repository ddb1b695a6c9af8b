//! Primed results
//!
//! The `then` half of a prime: what a matched request is answered with.
//! Results are JSON shapes at the operator boundary and translate into
//! protocol messages / action lists for the connection engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::types::{encode_value, Consistency, CqlType};
use crate::protocol::{ColumnSpec, CqlError, Message, Rows};

use super::actions::{Action, ActionKind, CloseType, DisconnectScope};

/// One primed row: column name → JSON value
pub type Row = BTreeMap<String, Value>;

/// The result half of a prime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PrimeResult {
    /// Rows with declared column types
    Success {
        #[serde(default)]
        rows: Vec<Row>,
        #[serde(default)]
        column_types: BTreeMap<String, String>,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    /// A void result
    Void {
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    /// Acknowledge without responding
    NoResponse {
        #[serde(default)]
        delay_in_ms: u64,
    },

    /// Close channels instead of responding
    CloseConnection {
        scope: DisconnectScope,
        close_type: CloseType,
        #[serde(default)]
        delay_in_ms: u64,
    },

    ServerError {
        message: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    SyntaxError {
        message: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    Invalid {
        message: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    ConfigError {
        message: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    Overloaded {
        #[serde(default)]
        message: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    IsBootstrapping {
        #[serde(default)]
        message: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    Unavailable {
        consistency_level: Consistency,
        required: i32,
        alive: i32,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    ReadTimeout {
        consistency_level: Consistency,
        received: i32,
        block_for: i32,
        #[serde(default)]
        data_present: bool,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    WriteTimeout {
        consistency_level: Consistency,
        received: i32,
        block_for: i32,
        write_type: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    ReadFailure {
        consistency_level: Consistency,
        received: i32,
        block_for: i32,
        /// Endpoint → reason name; the count travels on the wire
        #[serde(default)]
        failure_reasons: BTreeMap<String, String>,
        #[serde(default)]
        data_present: bool,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    WriteFailure {
        consistency_level: Consistency,
        received: i32,
        block_for: i32,
        #[serde(default)]
        failure_reasons: BTreeMap<String, String>,
        write_type: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },

    Unprepared {
        message: String,
        #[serde(default)]
        delay_in_ms: u64,
        #[serde(default)]
        ignore_on_prepare: bool,
    },
}

impl PrimeResult {
    /// Rows result with no rows and no columns
    pub fn no_rows() -> Self {
        PrimeResult::Success {
            rows: Vec::new(),
            column_types: BTreeMap::new(),
            delay_in_ms: 0,
            ignore_on_prepare: false,
        }
    }

    /// Rows result from row maps and column types
    pub fn rows(rows: Vec<Row>, column_types: BTreeMap<String, String>) -> Self {
        PrimeResult::Success {
            rows,
            column_types,
            delay_in_ms: 0,
            ignore_on_prepare: false,
        }
    }

    /// The configured per-result delay in milliseconds
    pub fn delay_ms(&self) -> u64 {
        match self {
            PrimeResult::Success { delay_in_ms, .. }
            | PrimeResult::Void { delay_in_ms, .. }
            | PrimeResult::NoResponse { delay_in_ms }
            | PrimeResult::CloseConnection { delay_in_ms, .. }
            | PrimeResult::ServerError { delay_in_ms, .. }
            | PrimeResult::SyntaxError { delay_in_ms, .. }
            | PrimeResult::Invalid { delay_in_ms, .. }
            | PrimeResult::ConfigError { delay_in_ms, .. }
            | PrimeResult::Overloaded { delay_in_ms, .. }
            | PrimeResult::IsBootstrapping { delay_in_ms, .. }
            | PrimeResult::Unavailable { delay_in_ms, .. }
            | PrimeResult::ReadTimeout { delay_in_ms, .. }
            | PrimeResult::WriteTimeout { delay_in_ms, .. }
            | PrimeResult::ReadFailure { delay_in_ms, .. }
            | PrimeResult::WriteFailure { delay_in_ms, .. }
            | PrimeResult::Unprepared { delay_in_ms, .. } => *delay_in_ms,
        }
    }

    /// Whether an error result is suppressed when the matched frame is a
    /// Prepare (the driver then receives a normal Prepared response)
    pub fn ignore_on_prepare(&self) -> bool {
        match self {
            PrimeResult::Success {
                ignore_on_prepare, ..
            }
            | PrimeResult::Void {
                ignore_on_prepare, ..
            }
            | PrimeResult::ServerError {
                ignore_on_prepare, ..
            }
            | PrimeResult::SyntaxError {
                ignore_on_prepare, ..
            }
            | PrimeResult::Invalid {
                ignore_on_prepare, ..
            }
            | PrimeResult::ConfigError {
                ignore_on_prepare, ..
            }
            | PrimeResult::Overloaded {
                ignore_on_prepare, ..
            }
            | PrimeResult::IsBootstrapping {
                ignore_on_prepare, ..
            }
            | PrimeResult::Unavailable {
                ignore_on_prepare, ..
            }
            | PrimeResult::ReadTimeout {
                ignore_on_prepare, ..
            }
            | PrimeResult::WriteTimeout {
                ignore_on_prepare, ..
            }
            | PrimeResult::ReadFailure {
                ignore_on_prepare, ..
            }
            | PrimeResult::WriteFailure {
                ignore_on_prepare, ..
            }
            | PrimeResult::Unprepared {
                ignore_on_prepare, ..
            } => *ignore_on_prepare,
            PrimeResult::NoResponse { .. } | PrimeResult::CloseConnection { .. } => false,
        }
    }

    /// Whether this result is an error (relevant for ignore-on-prepare)
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            PrimeResult::Success { .. } | PrimeResult::Void { .. } | PrimeResult::NoResponse { .. }
        )
    }

    /// Translate this result into its ordered action list. `request_id` is
    /// the prepared-statement id echoed by an Unprepared result.
    pub fn to_actions(&self, request_id: &[u8]) -> Vec<Action> {
        let delay = self.delay_ms();
        let kind = match self {
            PrimeResult::Success {
                rows, column_types, ..
            } => ActionKind::Respond(Message::Rows(build_rows(rows, column_types))),
            PrimeResult::Void { .. } => ActionKind::Respond(Message::Void),
            PrimeResult::NoResponse { .. } => ActionKind::NoResponse,
            PrimeResult::CloseConnection {
                scope, close_type, ..
            } => ActionKind::Disconnect {
                scope: *scope,
                close_type: *close_type,
            },
            PrimeResult::ServerError { message, .. } => {
                ActionKind::Respond(Message::Error(CqlError::ServerError(message.clone())))
            }
            PrimeResult::SyntaxError { message, .. } => {
                ActionKind::Respond(Message::Error(CqlError::SyntaxError(message.clone())))
            }
            PrimeResult::Invalid { message, .. } => {
                ActionKind::Respond(Message::Error(CqlError::Invalid(message.clone())))
            }
            PrimeResult::ConfigError { message, .. } => {
                ActionKind::Respond(Message::Error(CqlError::ConfigError(message.clone())))
            }
            PrimeResult::Overloaded { message, .. } => {
                ActionKind::Respond(Message::Error(CqlError::Overloaded(message.clone())))
            }
            PrimeResult::IsBootstrapping { message, .. } => {
                ActionKind::Respond(Message::Error(CqlError::IsBootstrapping(message.clone())))
            }
            PrimeResult::Unavailable {
                consistency_level,
                required,
                alive,
                ..
            } => ActionKind::Respond(Message::Error(CqlError::Unavailable {
                message: "Cannot achieve consistency level".to_string(),
                consistency: *consistency_level,
                required: *required,
                alive: *alive,
            })),
            PrimeResult::ReadTimeout {
                consistency_level,
                received,
                block_for,
                data_present,
                ..
            } => ActionKind::Respond(Message::Error(CqlError::ReadTimeout {
                message: "Operation timed out".to_string(),
                consistency: *consistency_level,
                received: *received,
                block_for: *block_for,
                data_present: *data_present,
            })),
            PrimeResult::WriteTimeout {
                consistency_level,
                received,
                block_for,
                write_type,
                ..
            } => ActionKind::Respond(Message::Error(CqlError::WriteTimeout {
                message: "Operation timed out".to_string(),
                consistency: *consistency_level,
                received: *received,
                block_for: *block_for,
                write_type: write_type.clone(),
            })),
            PrimeResult::ReadFailure {
                consistency_level,
                received,
                block_for,
                failure_reasons,
                data_present,
                ..
            } => ActionKind::Respond(Message::Error(CqlError::ReadFailure {
                message: "Replica(s) failed to execute read".to_string(),
                consistency: *consistency_level,
                received: *received,
                block_for: *block_for,
                num_failures: failure_reasons.len() as i32,
                data_present: *data_present,
            })),
            PrimeResult::WriteFailure {
                consistency_level,
                received,
                block_for,
                failure_reasons,
                write_type,
                ..
            } => ActionKind::Respond(Message::Error(CqlError::WriteFailure {
                message: "Replica(s) failed to execute write".to_string(),
                consistency: *consistency_level,
                received: *received,
                block_for: *block_for,
                num_failures: failure_reasons.len() as i32,
                write_type: write_type.clone(),
            })),
            PrimeResult::Unprepared { message, .. } => {
                ActionKind::Respond(Message::Error(CqlError::Unprepared {
                    message: message.clone(),
                    id: request_id.to_vec(),
                }))
            }
        };
        vec![Action::after_ms(kind, delay)]
    }
}

/// Build a Rows message from primed row maps: one column spec per
/// `column_types` entry, cells encoded under the declared type, absent
/// columns as null cells.
pub fn build_rows(rows: &[Row], column_types: &BTreeMap<String, String>) -> Rows {
    let columns: Vec<ColumnSpec> = column_types
        .iter()
        .map(|(name, type_name)| ColumnSpec {
            keyspace: String::new(),
            table: String::new(),
            name: name.clone(),
            ctype: CqlType::from_name(type_name),
        })
        .collect();

    let encoded_rows = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| {
                    row.get(&column.name)
                        .and_then(|value| encode_value(value, &column.ctype))
                })
                .collect()
        })
        .collect();

    Rows {
        columns,
        rows: encoded_rows,
    }
}
