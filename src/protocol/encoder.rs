//! Native protocol encoder
//!
//! Encodes both directions so the server and the test client share one
//! codec. The direction bit of the version byte is derived from the message.

use bytes::{BufMut, BytesMut};

use super::frame::{Batch, BatchQuery, ColumnSpec, CqlError, Frame, Message, Prepared, Rows};
use super::types::CqlType;

/// Encode a frame into the buffer
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    let direction = if frame.message.is_response() { 0x80 } else { 0x00 };
    buf.put_u8(frame.version | direction);
    buf.put_u8(frame.flags);
    buf.put_i16(frame.stream);
    buf.put_u8(frame.message.opcode());

    let mut body = BytesMut::new();
    encode_body(&frame.message, &mut body, frame.version);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
}

fn encode_body(message: &Message, body: &mut BytesMut, version: u8) {
    match message {
        Message::Startup(options) => {
            body.put_u16(options.len() as u16);
            for (key, value) in options {
                put_string(body, key);
                put_string(body, value);
            }
        }
        Message::Options | Message::Ready => {}
        Message::Register(events) => {
            body.put_u16(events.len() as u16);
            for event in events {
                put_string(body, event);
            }
        }
        Message::Query { query, params } => {
            put_long_string(body, query);
            encode_query_parameters(params, body);
        }
        Message::Prepare { query } => {
            put_long_string(body, query);
        }
        Message::Execute { id, params } => {
            put_short_bytes(body, id);
            encode_query_parameters(params, body);
        }
        Message::Batch(batch) => encode_batch(batch, body),
        Message::Supported(options) => {
            body.put_u16(options.len() as u16);
            for (key, values) in options {
                put_string(body, key);
                body.put_u16(values.len() as u16);
                for value in values {
                    put_string(body, value);
                }
            }
        }
        Message::Void => {
            body.put_i32(0x0001);
        }
        Message::SetKeyspace(keyspace) => {
            body.put_i32(0x0003);
            put_string(body, keyspace);
        }
        Message::Rows(rows) => {
            body.put_i32(0x0002);
            encode_rows(rows, body);
        }
        Message::Prepared(prepared) => {
            body.put_i32(0x0004);
            encode_prepared(prepared, body, version);
        }
        Message::Error(error) => encode_error(error, body),
    }
}

fn encode_query_parameters(params: &super::frame::QueryParameters, body: &mut BytesMut) {
    body.put_u16(params.consistency.code());

    let mut flags: u8 = 0;
    let named = !params.named.is_empty();
    if named || !params.positional.is_empty() {
        flags |= 0x01;
    }
    if params.skip_metadata {
        flags |= 0x02;
    }
    if params.page_size.is_some() {
        flags |= 0x04;
    }
    if params.paging_state.is_some() {
        flags |= 0x08;
    }
    if params.serial_consistency.is_some() {
        flags |= 0x10;
    }
    if params.timestamp.is_some() {
        flags |= 0x20;
    }
    if named {
        flags |= 0x40;
    }
    body.put_u8(flags);

    if named {
        body.put_u16(params.named.len() as u16);
        for (name, value) in &params.named {
            put_string(body, name);
            put_bytes(body, value.as_deref());
        }
    } else if !params.positional.is_empty() {
        body.put_u16(params.positional.len() as u16);
        for value in &params.positional {
            put_bytes(body, value.as_deref());
        }
    }
    if let Some(page_size) = params.page_size {
        body.put_i32(page_size);
    }
    if let Some(state) = &params.paging_state {
        put_bytes(body, Some(state));
    }
    if let Some(serial) = params.serial_consistency {
        body.put_u16(serial.code());
    }
    if let Some(timestamp) = params.timestamp {
        body.put_i64(timestamp);
    }
}

fn encode_batch(batch: &Batch, body: &mut BytesMut) {
    body.put_u8(batch.batch_type);
    body.put_u16(batch.queries.len() as u16);
    for query in &batch.queries {
        match query {
            BatchQuery::Text(text, values) => {
                body.put_u8(0);
                put_long_string(body, text);
                body.put_u16(values.len() as u16);
                for value in values {
                    put_bytes(body, value.as_deref());
                }
            }
            BatchQuery::Id(id, values) => {
                body.put_u8(1);
                put_short_bytes(body, id);
                body.put_u16(values.len() as u16);
                for value in values {
                    put_bytes(body, value.as_deref());
                }
            }
        }
    }
    body.put_u16(batch.consistency.code());
    body.put_u8(0); // batch flags
}

fn encode_rows(rows: &Rows, body: &mut BytesMut) {
    encode_metadata(&rows.columns, body);
    body.put_i32(rows.rows.len() as i32);
    for row in &rows.rows {
        for cell in row {
            put_bytes(body, cell.as_deref());
        }
    }
}

fn encode_prepared(prepared: &Prepared, body: &mut BytesMut, version: u8) {
    put_short_bytes(body, &prepared.id);

    // Bind-variable metadata.
    let flags: i32 = if prepared.variables.is_empty() { 0 } else { 0x0001 };
    body.put_i32(flags);
    body.put_i32(prepared.variables.len() as i32);
    if version >= 4 {
        body.put_i32(0); // pk count
    }
    encode_column_specs(&prepared.variables, flags, body);

    // Result metadata: none until execution.
    body.put_i32(0x0004);
    body.put_i32(0);
}

fn encode_metadata(columns: &[ColumnSpec], body: &mut BytesMut) {
    let flags: i32 = if columns.is_empty() { 0 } else { 0x0001 };
    body.put_i32(flags);
    body.put_i32(columns.len() as i32);
    encode_column_specs(columns, flags, body);
}

fn encode_column_specs(columns: &[ColumnSpec], flags: i32, body: &mut BytesMut) {
    if columns.is_empty() {
        return;
    }
    if flags & 0x0001 != 0 {
        put_string(body, &columns[0].keyspace);
        put_string(body, &columns[0].table);
    }
    for column in columns {
        if flags & 0x0001 == 0 {
            put_string(body, &column.keyspace);
            put_string(body, &column.table);
        }
        put_string(body, &column.name);
        encode_type_option(&column.ctype, body);
    }
}

fn encode_type_option(ctype: &CqlType, body: &mut BytesMut) {
    body.put_u16(ctype.code());
    match ctype {
        CqlType::List(inner) | CqlType::Set(inner) => encode_type_option(inner, body),
        CqlType::Map(key, value) => {
            encode_type_option(key, body);
            encode_type_option(value, body);
        }
        _ => {}
    }
}

fn encode_error(error: &CqlError, body: &mut BytesMut) {
    body.put_i32(error.code());
    put_string(body, error.message());
    match error {
        CqlError::Unavailable {
            consistency,
            required,
            alive,
            ..
        } => {
            body.put_u16(consistency.code());
            body.put_i32(*required);
            body.put_i32(*alive);
        }
        CqlError::WriteTimeout {
            consistency,
            received,
            block_for,
            write_type,
            ..
        } => {
            body.put_u16(consistency.code());
            body.put_i32(*received);
            body.put_i32(*block_for);
            put_string(body, write_type);
        }
        CqlError::ReadTimeout {
            consistency,
            received,
            block_for,
            data_present,
            ..
        } => {
            body.put_u16(consistency.code());
            body.put_i32(*received);
            body.put_i32(*block_for);
            body.put_u8(u8::from(*data_present));
        }
        CqlError::ReadFailure {
            consistency,
            received,
            block_for,
            num_failures,
            data_present,
            ..
        } => {
            body.put_u16(consistency.code());
            body.put_i32(*received);
            body.put_i32(*block_for);
            body.put_i32(*num_failures);
            body.put_u8(u8::from(*data_present));
        }
        CqlError::WriteFailure {
            consistency,
            received,
            block_for,
            num_failures,
            write_type,
            ..
        } => {
            body.put_u16(consistency.code());
            body.put_i32(*received);
            body.put_i32(*block_for);
            body.put_i32(*num_failures);
            put_string(body, write_type);
        }
        CqlError::Unprepared { id, .. } => {
            put_short_bytes(body, id);
        }
        _ => {}
    }
}

fn put_string(body: &mut BytesMut, value: &str) {
    body.put_u16(value.len() as u16);
    body.put_slice(value.as_bytes());
}

fn put_long_string(body: &mut BytesMut, value: &str) {
    body.put_i32(value.len() as i32);
    body.put_slice(value.as_bytes());
}

fn put_bytes(body: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            body.put_i32(bytes.len() as i32);
            body.put_slice(bytes);
        }
        None => body.put_i32(-1),
    }
}

fn put_short_bytes(body: &mut BytesMut, value: &[u8]) {
    body.put_u16(value.len() as u16);
    body.put_slice(value);
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_frame;
    use super::super::types::Consistency;
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_response_direction_bit() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::request(4, 0, Message::Ready), &mut buf);
        assert_eq!(buf[0], 0x84);

        buf.clear();
        encode_frame(&Frame::request(4, 0, Message::Options), &mut buf);
        assert_eq!(buf[0], 0x04);
    }

    #[test]
    fn test_rows_round_trip() {
        let rows = Rows {
            columns: vec![
                ColumnSpec {
                    keyspace: "ks".into(),
                    table: "t".into(),
                    name: "column1".into(),
                    ctype: CqlType::Varchar,
                },
                ColumnSpec {
                    keyspace: "ks".into(),
                    table: "t".into(),
                    name: "column2".into(),
                    ctype: CqlType::Int,
                },
            ],
            rows: vec![vec![
                Some(Bytes::from_static(b"column1")),
                Some(Bytes::from_static(&[0, 0, 0, 2])),
            ]],
        };
        let frame = Frame {
            version: 4,
            flags: 0,
            stream: 3,
            message: Message::Rows(rows),
        };
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf);
        assert_eq!(parse_frame(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_prepared_round_trip_both_versions() {
        for version in [3u8, 4] {
            let frame = Frame {
                version,
                flags: 0,
                stream: 1,
                message: Message::Prepared(Prepared {
                    id: vec![9; 16],
                    variables: vec![ColumnSpec {
                        keyspace: String::new(),
                        table: String::new(),
                        name: "0".into(),
                        ctype: CqlType::Varchar,
                    }],
                }),
            };
            let mut buf = BytesMut::new();
            encode_frame(&frame, &mut buf);
            assert_eq!(parse_frame(&mut buf).unwrap().unwrap(), frame, "v{version}");
        }
    }

    #[test]
    fn test_error_extras_round_trip() {
        let errors = vec![
            CqlError::Unavailable {
                message: "not enough replicas".into(),
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            },
            CqlError::WriteFailure {
                message: "write failed".into(),
                consistency: Consistency::One,
                received: 0,
                block_for: 1,
                num_failures: 1,
                write_type: "SIMPLE".into(),
            },
            CqlError::Unprepared {
                message: "No prepared statement with id: ab".into(),
                id: vec![0xAB],
            },
        ];
        for error in errors {
            let frame = Frame {
                version: 4,
                flags: 0,
                stream: 0,
                message: Message::Error(error),
            };
            let mut buf = BytesMut::new();
            encode_frame(&frame, &mut buf);
            assert_eq!(parse_frame(&mut buf).unwrap().unwrap(), frame);
        }
    }

    #[test]
    fn test_supported_round_trip() {
        let mut options = std::collections::HashMap::new();
        options.insert(
            "PROTOCOL_VERSIONS".to_string(),
            vec!["3/v3".to_string(), "4/v4".to_string(), "5/v5-beta".to_string()],
        );
        let frame = Frame {
            version: 4,
            flags: 0,
            stream: 0,
            message: Message::Supported(options),
        };
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf);
        assert_eq!(parse_frame(&mut buf).unwrap().unwrap(), frame);
    }
}
