//! Native protocol implementation
//!
//! This module implements the subset of the Cassandra native protocol
//! (v3/v4) the simulator speaks: envelope parsing, typed request/response
//! messages, and CQL value codecs for matching and primed rows.

mod encoder;
mod frame;
mod parser;
pub mod types;

pub use encoder::encode_frame;
pub use frame::{
    error_code, opcode, Batch, BatchQuery, ColumnSpec, CqlError, Frame, Message, Prepared,
    QueryParameters, Rows, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};
pub use parser::{parse_frame, ParseError, HEADER_LEN};
pub use types::{decode_value, encode_value, Consistency, CqlType};
