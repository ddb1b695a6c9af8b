//! Native protocol parser
//!
//! Streaming decoder: `parse_frame` returns `Ok(None)` until a whole
//! envelope is buffered, then decodes the body in one pass. Both request and
//! response bodies are understood so the integration-test client can reuse
//! the codec.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use super::frame::{
    opcode, Batch, BatchQuery, ColumnSpec, CqlError, Frame, Message, Prepared, QueryParameters,
    Rows, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};
use super::types::{Consistency, CqlType};

/// Header length of every native-protocol frame
pub const HEADER_LEN: usize = 9;

/// Frames larger than this are rejected outright
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Parse error types
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Invalid protocol content
    Invalid(String),

    /// Invalid UTF-8 in string data
    InvalidUtf8,

    /// Frame body exceeds the size limit
    FrameTooLarge(usize),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Invalid(msg) => write!(f, "invalid frame: {msg}"),
            ParseError::InvalidUtf8 => write!(f, "invalid UTF-8"),
            ParseError::FrameTooLarge(len) => write!(f, "frame too large: {len} bytes"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Try to parse one frame out of `buf`.
///
/// Returns `Ok(Some(frame))` when a complete frame was consumed,
/// `Ok(None)` when more data is needed, or `Err` on malformed input.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(ParseError::FrameTooLarge(body_len));
    }
    if buf.len() < HEADER_LEN + body_len {
        return Ok(None);
    }

    let header = buf.split_to(HEADER_LEN);
    let mut body = buf.split_to(body_len).freeze();

    let raw_version = header[0];
    let is_response = raw_version & 0x80 != 0;
    let version = raw_version & 0x7F;
    if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version) {
        return Err(ParseError::Invalid(format!(
            "unsupported protocol version {version}"
        )));
    }
    let flags = header[1];
    if flags & 0x01 != 0 {
        return Err(ParseError::Invalid("compressed frames unsupported".into()));
    }
    let stream = i16::from_be_bytes([header[2], header[3]]);
    let op = header[4];

    let message = if is_response {
        parse_response(op, &mut body, version)?
    } else {
        parse_request(op, &mut body)?
    };

    Ok(Some(Frame {
        version,
        flags,
        stream,
        message,
    }))
}

fn parse_request(op: u8, body: &mut Bytes) -> Result<Message, ParseError> {
    match op {
        opcode::STARTUP => Ok(Message::Startup(read_string_map(body)?)),
        opcode::OPTIONS => Ok(Message::Options),
        opcode::REGISTER => Ok(Message::Register(read_string_list(body)?)),
        opcode::QUERY => {
            let query = read_long_string(body)?;
            let params = read_query_parameters(body)?;
            Ok(Message::Query { query, params })
        }
        opcode::PREPARE => {
            let query = read_long_string(body)?;
            Ok(Message::Prepare { query })
        }
        opcode::EXECUTE => {
            let id = read_short_bytes(body)?;
            let params = read_query_parameters(body)?;
            Ok(Message::Execute { id, params })
        }
        opcode::BATCH => parse_batch(body),
        other => Err(ParseError::Invalid(format!(
            "unexpected request opcode {other:#04x}"
        ))),
    }
}

fn parse_batch(body: &mut Bytes) -> Result<Message, ParseError> {
    let batch_type = read_u8(body)?;
    let count = read_u16(body)? as usize;
    let mut queries = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = read_u8(body)?;
        match kind {
            0 => {
                let query = read_long_string(body)?;
                let values = read_positional_values(body)?;
                queries.push(BatchQuery::Text(query, values));
            }
            1 => {
                let id = read_short_bytes(body)?;
                let values = read_positional_values(body)?;
                queries.push(BatchQuery::Id(id, values));
            }
            other => {
                return Err(ParseError::Invalid(format!(
                    "unknown batch query kind {other}"
                )))
            }
        }
    }
    let consistency = read_consistency(body)?;
    // Trailing batch flags (serial consistency, timestamp) are irrelevant to
    // matching; skip whatever remains.
    body.advance(body.remaining());
    Ok(Message::Batch(Batch {
        batch_type,
        queries,
        consistency,
    }))
}

fn read_query_parameters(body: &mut Bytes) -> Result<QueryParameters, ParseError> {
    let consistency = read_consistency(body)?;
    let flags = read_u8(body)?;
    let mut params = QueryParameters {
        consistency,
        skip_metadata: flags & 0x02 != 0,
        ..QueryParameters::default()
    };

    if flags & 0x01 != 0 {
        let count = read_u16(body)? as usize;
        let named = flags & 0x40 != 0;
        for _ in 0..count {
            if named {
                let name = read_string(body)?;
                params.named.push((name, read_bytes(body)?));
            } else {
                params.positional.push(read_bytes(body)?);
            }
        }
    }
    if flags & 0x04 != 0 {
        params.page_size = Some(read_i32(body)?);
    }
    if flags & 0x08 != 0 {
        params.paging_state = read_bytes(body)?;
    }
    if flags & 0x10 != 0 {
        params.serial_consistency = Some(read_consistency(body)?);
    }
    if flags & 0x20 != 0 {
        params.timestamp = Some(read_i64(body)?);
    }
    Ok(params)
}

fn read_positional_values(body: &mut Bytes) -> Result<Vec<Option<Bytes>>, ParseError> {
    let count = read_u16(body)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(read_bytes(body)?);
    }
    Ok(values)
}

fn parse_response(op: u8, body: &mut Bytes, version: u8) -> Result<Message, ParseError> {
    match op {
        opcode::READY => Ok(Message::Ready),
        opcode::SUPPORTED => Ok(Message::Supported(read_string_multimap(body)?)),
        opcode::ERROR => parse_error(body),
        opcode::RESULT => {
            let kind = read_i32(body)?;
            match kind {
                0x0001 => Ok(Message::Void),
                0x0002 => Ok(Message::Rows(read_rows(body)?)),
                0x0003 => Ok(Message::SetKeyspace(read_string(body)?)),
                0x0004 => Ok(Message::Prepared(read_prepared(body, version)?)),
                other => Err(ParseError::Invalid(format!("unknown result kind {other}"))),
            }
        }
        other => Err(ParseError::Invalid(format!(
            "unexpected response opcode {other:#04x}"
        ))),
    }
}

fn parse_error(body: &mut Bytes) -> Result<Message, ParseError> {
    use super::frame::error_code::*;

    let code = read_i32(body)?;
    let message = read_string(body)?;
    let error = match code {
        SERVER_ERROR => CqlError::ServerError(message),
        PROTOCOL_ERROR => CqlError::ProtocolError(message),
        OVERLOADED => CqlError::Overloaded(message),
        IS_BOOTSTRAPPING => CqlError::IsBootstrapping(message),
        SYNTAX_ERROR => CqlError::SyntaxError(message),
        INVALID => CqlError::Invalid(message),
        CONFIG_ERROR => CqlError::ConfigError(message),
        UNAVAILABLE => CqlError::Unavailable {
            message,
            consistency: read_consistency(body)?,
            required: read_i32(body)?,
            alive: read_i32(body)?,
        },
        WRITE_TIMEOUT => CqlError::WriteTimeout {
            message,
            consistency: read_consistency(body)?,
            received: read_i32(body)?,
            block_for: read_i32(body)?,
            write_type: read_string(body)?,
        },
        READ_TIMEOUT => CqlError::ReadTimeout {
            message,
            consistency: read_consistency(body)?,
            received: read_i32(body)?,
            block_for: read_i32(body)?,
            data_present: read_u8(body)? != 0,
        },
        READ_FAILURE => CqlError::ReadFailure {
            message,
            consistency: read_consistency(body)?,
            received: read_i32(body)?,
            block_for: read_i32(body)?,
            num_failures: read_i32(body)?,
            data_present: read_u8(body)? != 0,
        },
        WRITE_FAILURE => CqlError::WriteFailure {
            message,
            consistency: read_consistency(body)?,
            received: read_i32(body)?,
            block_for: read_i32(body)?,
            num_failures: read_i32(body)?,
            write_type: read_string(body)?,
        },
        UNPREPARED => CqlError::Unprepared {
            message,
            id: read_short_bytes(body)?,
        },
        other => {
            return Err(ParseError::Invalid(format!("unknown error code {other:#06x}")));
        }
    };
    Ok(Message::Error(error))
}

fn read_rows(body: &mut Bytes) -> Result<Rows, ParseError> {
    let columns = read_metadata(body)?;
    let row_count = read_i32(body)?;
    if row_count < 0 {
        return Err(ParseError::Invalid("negative row count".into()));
    }
    let mut rows = Vec::with_capacity(row_count as usize);
    for _ in 0..row_count {
        let mut row = Vec::with_capacity(columns.len());
        for _ in 0..columns.len() {
            row.push(read_bytes(body)?);
        }
        rows.push(row);
    }
    Ok(Rows { columns, rows })
}

fn read_prepared(body: &mut Bytes, version: u8) -> Result<Prepared, ParseError> {
    let id = read_short_bytes(body)?;
    // Bind-variable metadata; v4 adds partition-key indices.
    let flags = read_i32(body)?;
    let col_count = read_i32(body)?;
    if version >= 4 {
        let pk_count = read_i32(body)?;
        for _ in 0..pk_count {
            read_u16(body)?;
        }
    }
    let variables = read_column_specs(body, flags, col_count)?;
    // Result metadata follows; decode and discard.
    read_metadata(body)?;
    Ok(Prepared { id, variables })
}

fn read_metadata(body: &mut Bytes) -> Result<Vec<ColumnSpec>, ParseError> {
    let flags = read_i32(body)?;
    let col_count = read_i32(body)?;
    if flags & 0x0002 != 0 {
        read_bytes(body)?; // paging state
    }
    if flags & 0x0004 != 0 {
        return Ok(Vec::new()); // no_metadata
    }
    read_column_specs(body, flags, col_count)
}

fn read_column_specs(
    body: &mut Bytes,
    flags: i32,
    col_count: i32,
) -> Result<Vec<ColumnSpec>, ParseError> {
    if col_count < 0 {
        return Err(ParseError::Invalid("negative column count".into()));
    }
    let global = flags & 0x0001 != 0;
    let (global_ks, global_table) = if global && col_count > 0 {
        (read_string(body)?, read_string(body)?)
    } else {
        (String::new(), String::new())
    };
    let mut columns = Vec::with_capacity(col_count as usize);
    for _ in 0..col_count {
        let (keyspace, table) = if global {
            (global_ks.clone(), global_table.clone())
        } else {
            (read_string(body)?, read_string(body)?)
        };
        let name = read_string(body)?;
        let ctype = read_type_option(body)?;
        columns.push(ColumnSpec {
            keyspace,
            table,
            name,
            ctype,
        });
    }
    Ok(columns)
}

fn read_type_option(body: &mut Bytes) -> Result<CqlType, ParseError> {
    let id = read_u16(body)?;
    let ctype = match id {
        0x0000 => {
            read_string(body)?; // custom class name, treated as text
            CqlType::Varchar
        }
        0x0001 => CqlType::Ascii,
        0x0002 => CqlType::Bigint,
        0x0003 => CqlType::Blob,
        0x0004 => CqlType::Boolean,
        0x0005 => CqlType::Counter,
        0x0007 => CqlType::Double,
        0x0008 => CqlType::Float,
        0x0009 => CqlType::Int,
        0x000B => CqlType::Timestamp,
        0x000C => CqlType::Uuid,
        0x000D => CqlType::Varchar,
        0x000E => CqlType::Varint,
        0x000F => CqlType::Timeuuid,
        0x0010 => CqlType::Inet,
        0x0011 => CqlType::Date,
        0x0012 => CqlType::Time,
        0x0013 => CqlType::Smallint,
        0x0014 => CqlType::Tinyint,
        0x0020 => CqlType::List(Box::new(read_type_option(body)?)),
        0x0021 => CqlType::Map(
            Box::new(read_type_option(body)?),
            Box::new(read_type_option(body)?),
        ),
        0x0022 => CqlType::Set(Box::new(read_type_option(body)?)),
        other => {
            return Err(ParseError::Invalid(format!("unknown type option {other:#06x}")));
        }
    };
    Ok(ctype)
}

// ── primitive readers ────────────────────────────────────────────────────────

fn need(body: &Bytes, len: usize) -> Result<(), ParseError> {
    if body.remaining() < len {
        Err(ParseError::Invalid("truncated frame body".into()))
    } else {
        Ok(())
    }
}

fn read_u8(body: &mut Bytes) -> Result<u8, ParseError> {
    need(body, 1)?;
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> Result<u16, ParseError> {
    need(body, 2)?;
    Ok(body.get_u16())
}

fn read_i32(body: &mut Bytes) -> Result<i32, ParseError> {
    need(body, 4)?;
    Ok(body.get_i32())
}

fn read_i64(body: &mut Bytes) -> Result<i64, ParseError> {
    need(body, 8)?;
    Ok(body.get_i64())
}

fn read_consistency(body: &mut Bytes) -> Result<Consistency, ParseError> {
    let code = read_u16(body)?;
    Consistency::from_code(code)
        .ok_or_else(|| ParseError::Invalid(format!("unknown consistency {code:#06x}")))
}

fn read_string(body: &mut Bytes) -> Result<String, ParseError> {
    let len = read_u16(body)? as usize;
    need(body, len)?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ParseError::InvalidUtf8)
}

fn read_long_string(body: &mut Bytes) -> Result<String, ParseError> {
    let len = read_i32(body)?;
    if len < 0 {
        return Err(ParseError::Invalid("negative string length".into()));
    }
    need(body, len as usize)?;
    let raw = body.split_to(len as usize);
    String::from_utf8(raw.to_vec()).map_err(|_| ParseError::InvalidUtf8)
}

fn read_bytes(body: &mut Bytes) -> Result<Option<Bytes>, ParseError> {
    let len = read_i32(body)?;
    if len < 0 {
        return Ok(None);
    }
    need(body, len as usize)?;
    Ok(Some(body.split_to(len as usize)))
}

fn read_short_bytes(body: &mut Bytes) -> Result<Vec<u8>, ParseError> {
    let len = read_u16(body)? as usize;
    need(body, len)?;
    Ok(body.split_to(len).to_vec())
}

fn read_string_map(body: &mut Bytes) -> Result<HashMap<String, String>, ParseError> {
    let count = read_u16(body)? as usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_string(body)?;
        let value = read_string(body)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn read_string_list(body: &mut Bytes) -> Result<Vec<String>, ParseError> {
    let count = read_u16(body)? as usize;
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        list.push(read_string(body)?);
    }
    Ok(list)
}

fn read_string_multimap(body: &mut Bytes) -> Result<HashMap<String, Vec<String>>, ParseError> {
    let count = read_u16(body)? as usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_string(body)?;
        let values = read_string_list(body)?;
        map.insert(key, values);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::super::encoder::encode_frame;
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf);
        parse_frame(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_incomplete_header() {
        let mut buf = BytesMut::from(&[0x04u8, 0x00, 0x00][..]);
        assert_eq!(parse_frame(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_incomplete_body() {
        let mut buf = BytesMut::new();
        let frame = Frame::request(
            4,
            1,
            Message::Startup(HashMap::from([("CQL_VERSION".into(), "3.4.4".into())])),
        );
        encode_frame(&frame, &mut buf);
        let full = buf.len();
        let mut partial = buf.clone();
        partial.truncate(full - 1);
        assert_eq!(parse_frame(&mut partial).unwrap(), None);
    }

    #[test]
    fn test_startup_round_trip() {
        let frame = Frame::request(
            4,
            0,
            Message::Startup(HashMap::from([("CQL_VERSION".into(), "3.4.4".into())])),
        );
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_query_with_values_round_trip() {
        let params = QueryParameters {
            consistency: Consistency::Quorum,
            positional: vec![Some(Bytes::from_static(b"c1")), None],
            ..QueryParameters::default()
        };
        let frame = Frame::request(
            4,
            5,
            Message::Query {
                query: "SELECT table FROM foo WHERE c1=?".into(),
                params,
            },
        );
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_named_values_round_trip() {
        let params = QueryParameters {
            consistency: Consistency::One,
            named: vec![
                ("id".into(), Some(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 1]))),
                ("id2".into(), None),
            ],
            ..QueryParameters::default()
        };
        let frame = Frame::request(
            3,
            2,
            Message::Execute {
                id: vec![0xAB; 16],
                params,
            },
        );
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut buf = BytesMut::new();
        let frame = Frame::request(4, 0, Message::Options);
        encode_frame(&frame, &mut buf);
        buf[0] = 0x07;
        assert!(matches!(parse_frame(&mut buf), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn test_garbage_opcode_rejected() {
        let mut buf = BytesMut::new();
        let frame = Frame::request(4, 0, Message::Options);
        encode_frame(&frame, &mut buf);
        buf[4] = 0x7E;
        assert!(matches!(parse_frame(&mut buf), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn test_batch_round_trip() {
        let frame = Frame::request(
            4,
            9,
            Message::Batch(Batch {
                batch_type: 0,
                queries: vec![
                    BatchQuery::Text("INSERT INTO t (a) VALUES (?)".into(), vec![Some(
                        Bytes::from_static(b"x"),
                    )]),
                    BatchQuery::Id(vec![1, 2, 3], vec![]),
                ],
                consistency: Consistency::LocalQuorum,
            }),
        );
        assert_eq!(round_trip(frame.clone()), frame);
    }
}
