//! Native protocol frames and messages
//!
//! A `Frame` is the 9-byte envelope (version, flags, stream id, opcode,
//! length) plus a typed `Message` body. The same types describe both
//! directions so the test client and the server share one codec.

use std::collections::HashMap;

use bytes::Bytes;

use super::types::{Consistency, CqlType};

/// Lowest protocol version the codec accepts
pub const MIN_PROTOCOL_VERSION: u8 = 3;
/// Highest protocol version the codec accepts
pub const MAX_PROTOCOL_VERSION: u8 = 4;

/// Opcode constants from the native protocol
pub mod opcode {
    pub const ERROR: u8 = 0x00;
    pub const STARTUP: u8 = 0x01;
    pub const READY: u8 = 0x02;
    pub const OPTIONS: u8 = 0x05;
    pub const SUPPORTED: u8 = 0x06;
    pub const QUERY: u8 = 0x07;
    pub const RESULT: u8 = 0x08;
    pub const PREPARE: u8 = 0x09;
    pub const EXECUTE: u8 = 0x0A;
    pub const REGISTER: u8 = 0x0B;
    pub const BATCH: u8 = 0x0D;
}

/// Error codes from the native protocol
pub mod error_code {
    pub const SERVER_ERROR: i32 = 0x0000;
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    pub const UNAVAILABLE: i32 = 0x1000;
    pub const OVERLOADED: i32 = 0x1001;
    pub const IS_BOOTSTRAPPING: i32 = 0x1002;
    pub const WRITE_TIMEOUT: i32 = 0x1100;
    pub const READ_TIMEOUT: i32 = 0x1200;
    pub const READ_FAILURE: i32 = 0x1300;
    pub const WRITE_FAILURE: i32 = 0x1500;
    pub const SYNTAX_ERROR: i32 = 0x2000;
    pub const INVALID: i32 = 0x2200;
    pub const CONFIG_ERROR: i32 = 0x2300;
    pub const UNPREPARED: i32 = 0x2500;
}

/// An envelope plus its decoded message
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Protocol version (3 or 4), without the direction bit
    pub version: u8,
    /// Envelope flags (compression/tracing are never set by this codec)
    pub flags: u8,
    /// Stream id correlating a response to its request
    pub stream: i16,
    /// The message body
    pub message: Message,
}

impl Frame {
    /// Build a request frame
    pub fn request(version: u8, stream: i16, message: Message) -> Self {
        Self {
            version,
            flags: 0,
            stream,
            message,
        }
    }

    /// Build the response frame for this request, preserving version and stream id
    pub fn respond(&self, message: Message) -> Frame {
        Frame {
            version: self.version,
            flags: 0,
            stream: self.stream,
            message,
        }
    }
}

/// Values bound to a query or execute request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryParameters {
    /// Requested consistency level
    pub consistency: Consistency,
    /// Positional values, in bind order; `None` is a null cell
    pub positional: Vec<Option<Bytes>>,
    /// Named values; empty unless the named-values flag was set
    pub named: Vec<(String, Option<Bytes>)>,
    /// Serial consistency, when supplied
    pub serial_consistency: Option<Consistency>,
    /// Page size, when supplied
    pub page_size: Option<i32>,
    /// Paging state, when supplied
    pub paging_state: Option<Bytes>,
    /// Default timestamp, when supplied
    pub timestamp: Option<i64>,
    /// Whether the skip-metadata flag was set
    pub skip_metadata: bool,
}

impl QueryParameters {
    /// Total number of bound values, positional or named
    pub fn value_count(&self) -> usize {
        self.positional.len() + self.named.len()
    }
}

/// One statement inside a batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchQuery {
    /// Inline query string with positional values
    Text(String, Vec<Option<Bytes>>),
    /// Previously prepared statement id with positional values
    Id(Vec<u8>, Vec<Option<Bytes>>),
}

/// A decoded batch request
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Batch type byte (logged, unlogged, counter)
    pub batch_type: u8,
    /// The statements in client order
    pub queries: Vec<BatchQuery>,
    /// Requested consistency level
    pub consistency: Consistency,
}

/// Column description inside rows / prepared metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub ctype: CqlType,
}

/// A rows result: column metadata plus row cells in column order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rows {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Option<Bytes>>>,
}

impl Rows {
    /// Rows result with metadata but no rows
    pub fn empty(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }
}

/// A prepared result: statement id plus bind-variable metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub id: Vec<u8>,
    pub variables: Vec<ColumnSpec>,
}

/// The error message family
#[derive(Debug, Clone, PartialEq)]
pub enum CqlError {
    ServerError(String),
    ProtocolError(String),
    Overloaded(String),
    IsBootstrapping(String),
    SyntaxError(String),
    Invalid(String),
    ConfigError(String),
    Unavailable {
        message: String,
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    WriteTimeout {
        message: String,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: String,
    },
    ReadTimeout {
        message: String,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        message: String,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        data_present: bool,
    },
    WriteFailure {
        message: String,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        write_type: String,
    },
    Unprepared {
        message: String,
        id: Vec<u8>,
    },
}

impl CqlError {
    /// The protocol error code for this variant
    pub fn code(&self) -> i32 {
        match self {
            CqlError::ServerError(_) => error_code::SERVER_ERROR,
            CqlError::ProtocolError(_) => error_code::PROTOCOL_ERROR,
            CqlError::Overloaded(_) => error_code::OVERLOADED,
            CqlError::IsBootstrapping(_) => error_code::IS_BOOTSTRAPPING,
            CqlError::SyntaxError(_) => error_code::SYNTAX_ERROR,
            CqlError::Invalid(_) => error_code::INVALID,
            CqlError::ConfigError(_) => error_code::CONFIG_ERROR,
            CqlError::Unavailable { .. } => error_code::UNAVAILABLE,
            CqlError::WriteTimeout { .. } => error_code::WRITE_TIMEOUT,
            CqlError::ReadTimeout { .. } => error_code::READ_TIMEOUT,
            CqlError::ReadFailure { .. } => error_code::READ_FAILURE,
            CqlError::WriteFailure { .. } => error_code::WRITE_FAILURE,
            CqlError::Unprepared { .. } => error_code::UNPREPARED,
        }
    }

    /// The human-readable message carried by this error
    pub fn message(&self) -> &str {
        match self {
            CqlError::ServerError(m)
            | CqlError::ProtocolError(m)
            | CqlError::Overloaded(m)
            | CqlError::IsBootstrapping(m)
            | CqlError::SyntaxError(m)
            | CqlError::Invalid(m)
            | CqlError::ConfigError(m) => m,
            CqlError::Unavailable { message, .. }
            | CqlError::WriteTimeout { message, .. }
            | CqlError::ReadTimeout { message, .. }
            | CqlError::ReadFailure { message, .. }
            | CqlError::WriteFailure { message, .. }
            | CqlError::Unprepared { message, .. } => message,
        }
    }
}

/// Every message the simulator understands or emits
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // Requests
    Startup(HashMap<String, String>),
    Options,
    Register(Vec<String>),
    Query {
        query: String,
        params: QueryParameters,
    },
    Prepare {
        query: String,
    },
    Execute {
        id: Vec<u8>,
        params: QueryParameters,
    },
    Batch(Batch),

    // Responses
    Ready,
    Supported(HashMap<String, Vec<String>>),
    Void,
    SetKeyspace(String),
    Rows(Rows),
    Prepared(Prepared),
    Error(CqlError),
}

impl Message {
    /// Whether this message flows server→client
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::Ready
                | Message::Supported(_)
                | Message::Void
                | Message::SetKeyspace(_)
                | Message::Rows(_)
                | Message::Prepared(_)
                | Message::Error(_)
        )
    }

    /// The opcode this message is carried under
    pub fn opcode(&self) -> u8 {
        match self {
            Message::Startup(_) => opcode::STARTUP,
            Message::Options => opcode::OPTIONS,
            Message::Register(_) => opcode::REGISTER,
            Message::Query { .. } => opcode::QUERY,
            Message::Prepare { .. } => opcode::PREPARE,
            Message::Execute { .. } => opcode::EXECUTE,
            Message::Batch(_) => opcode::BATCH,
            Message::Ready => opcode::READY,
            Message::Supported(_) => opcode::SUPPORTED,
            Message::Void | Message::SetKeyspace(_) | Message::Rows(_) | Message::Prepared(_) => {
                opcode::RESULT
            }
            Message::Error(_) => opcode::ERROR,
        }
    }

    /// Short kind name used in activity logs for non-query messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Startup(_) => "STARTUP",
            Message::Options => "OPTIONS",
            Message::Register(_) => "REGISTER",
            Message::Query { .. } => "QUERY",
            Message::Prepare { .. } => "PREPARE",
            Message::Execute { .. } => "EXECUTE",
            Message::Batch(_) => "BATCH",
            Message::Ready => "READY",
            Message::Supported(_) => "SUPPORTED",
            Message::Void => "VOID",
            Message::SetKeyspace(_) => "SET_KEYSPACE",
            Message::Rows(_) => "ROWS",
            Message::Prepared(_) => "PREPARED",
            Message::Error(_) => "ERROR",
        }
    }
}
