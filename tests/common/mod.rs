//! Shared test utilities for cassette integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use cassette::protocol::{
    decode_value, encode_frame, encode_value, parse_frame, Consistency, CqlType, Frame, Message,
    QueryParameters, Rows,
};

/// Protocol version the test client speaks
pub const VERSION: u8 = 4;

/// A raw native-protocol client driving a simulated node over TCP
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    next_stream_id: i16,
}

#[allow(dead_code)]
impl TestClient {
    /// Connect to a node's listen address
    pub async fn connect(addr: SocketAddr) -> TestClient {
        let stream = tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr))
            .await
            .expect("connect should not time out")
            .expect("should connect");
        TestClient {
            stream,
            buf: BytesMut::with_capacity(4 * 1024),
            next_stream_id: 0,
        }
    }

    /// Try to connect, returning the error instead of panicking
    pub async fn try_connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }

    /// Send a request, returning the stream id it was sent under
    pub async fn send(&mut self, message: Message) -> i16 {
        let stream_id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1);
        let frame = Frame::request(VERSION, stream_id, message);
        let mut out = BytesMut::new();
        encode_frame(&frame, &mut out);
        self.stream
            .write_all(&out)
            .await
            .expect("request write should succeed");
        stream_id
    }

    /// Read the next frame, if one arrives within the timeout
    pub async fn read_frame_within(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = parse_frame(&mut self.buf).expect("response should parse") {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => return None,
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    /// Read the next frame, panicking if none arrives promptly
    pub async fn read_frame(&mut self) -> Frame {
        self.read_frame_within(Duration::from_secs(5))
            .await
            .expect("expected a response frame")
    }

    /// Send a request and read its response
    pub async fn request(&mut self, message: Message) -> Frame {
        let stream_id = self.send(message).await;
        let frame = self.read_frame().await;
        assert_eq!(frame.stream, stream_id, "response stream id should match");
        frame
    }

    /// Perform the Startup handshake, returning the response message
    pub async fn startup(&mut self) -> Message {
        let mut options = std::collections::HashMap::new();
        options.insert("CQL_VERSION".to_string(), "3.4.4".to_string());
        self.request(Message::Startup(options)).await.message
    }

    /// Issue a bare query
    pub async fn query(&mut self, text: &str) -> Message {
        self.request(Message::Query {
            query: text.to_string(),
            params: QueryParameters::default(),
        })
        .await
        .message
    }

    /// Issue a query with bound values
    pub async fn query_with_params(&mut self, text: &str, params: QueryParameters) -> Message {
        self.request(Message::Query {
            query: text.to_string(),
            params,
        })
        .await
        .message
    }

    /// Prepare a statement
    pub async fn prepare(&mut self, text: &str) -> Message {
        self.request(Message::Prepare {
            query: text.to_string(),
        })
        .await
        .message
    }

    /// Execute a prepared statement
    pub async fn execute(&mut self, id: Vec<u8>, params: QueryParameters) -> Message {
        self.request(Message::Execute { id, params }).await.message
    }

    /// True once the server has closed this connection (read returns EOF)
    pub async fn is_disconnected(&mut self) -> bool {
        let mut scratch = [0u8; 64];
        match tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut scratch)).await {
            Ok(Ok(0)) => true,
            Ok(Err(_)) => true,
            _ => false,
        }
    }
}

// ============================================================================
// Value helpers
// ============================================================================

/// Encode a JSON value as a bound parameter of the given CQL type
#[allow(dead_code)]
pub fn bind_value(value: &Value, type_name: &str) -> Option<Bytes> {
    encode_value(value, &CqlType::from_name(type_name))
}

/// Positional bound values of one type
#[allow(dead_code)]
pub fn positional(values: &[Value], type_name: &str) -> QueryParameters {
    QueryParameters {
        positional: values.iter().map(|v| bind_value(v, type_name)).collect(),
        ..QueryParameters::default()
    }
}

/// Named bound values of one type
#[allow(dead_code)]
pub fn named(values: &[(&str, Value)], type_name: &str) -> QueryParameters {
    QueryParameters {
        named: values
            .iter()
            .map(|(name, v)| (name.to_string(), bind_value(v, type_name)))
            .collect(),
        ..QueryParameters::default()
    }
}

/// Decode a Rows response into JSON row maps keyed by column name
#[allow(dead_code)]
pub fn decode_rows(rows: &Rows) -> Vec<BTreeMap<String, Value>> {
    rows.rows
        .iter()
        .map(|row| {
            rows.columns
                .iter()
                .zip(row.iter())
                .map(|(column, cell)| {
                    let value = match cell {
                        Some(bytes) => decode_value(bytes, &column.ctype),
                        None => Value::Null,
                    };
                    (column.name.clone(), value)
                })
                .collect()
        })
        .collect()
}

/// Unwrap a Rows message or panic with context
#[allow(dead_code)]
pub fn expect_rows(message: Message) -> Rows {
    match message {
        Message::Rows(rows) => rows,
        other => panic!("expected Rows, got {other:?}"),
    }
}

/// A QueryParameters with the given consistency and no values
#[allow(dead_code)]
pub fn with_consistency(consistency: Consistency) -> QueryParameters {
    QueryParameters {
        consistency,
        ..QueryParameters::default()
    }
}
