//! CQL data types and value codecs
//!
//! Primed rows and matcher parameters cross the JSON boundary as
//! `serde_json::Value`s tagged with a CQL type name; this module maps those
//! names to native-protocol type codes and converts values to and from their
//! wire form.

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Consistency levels, with their protocol codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

impl Consistency {
    /// Protocol code for this consistency level
    pub fn code(&self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::Serial => 0x0008,
            Consistency::LocalSerial => 0x0009,
            Consistency::LocalOne => 0x000A,
        }
    }

    /// Decode a protocol code, if known
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Consistency::Any),
            0x0001 => Some(Consistency::One),
            0x0002 => Some(Consistency::Two),
            0x0003 => Some(Consistency::Three),
            0x0004 => Some(Consistency::Quorum),
            0x0005 => Some(Consistency::All),
            0x0006 => Some(Consistency::LocalQuorum),
            0x0007 => Some(Consistency::EachQuorum),
            0x0008 => Some(Consistency::Serial),
            0x0009 => Some(Consistency::LocalSerial),
            0x000A => Some(Consistency::LocalOne),
            _ => None,
        }
    }

    /// The level's canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::Serial => "SERIAL",
            Consistency::LocalSerial => "LOCAL_SERIAL",
            Consistency::LocalOne => "LOCAL_ONE",
        }
    }
}

impl Default for Consistency {
    fn default() -> Self {
        Consistency::One
    }
}

/// A CQL column type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqlType {
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    List(Box<CqlType>),
    Map(Box<CqlType>, Box<CqlType>),
    Set(Box<CqlType>),
}

impl CqlType {
    /// Protocol option code for this type
    pub fn code(&self) -> u16 {
        match self {
            CqlType::Ascii => 0x0001,
            CqlType::Bigint => 0x0002,
            CqlType::Blob => 0x0003,
            CqlType::Boolean => 0x0004,
            CqlType::Counter => 0x0005,
            CqlType::Double => 0x0007,
            CqlType::Float => 0x0008,
            CqlType::Int => 0x0009,
            CqlType::Timestamp => 0x000B,
            CqlType::Uuid => 0x000C,
            CqlType::Varchar => 0x000D,
            CqlType::Varint => 0x000E,
            CqlType::Timeuuid => 0x000F,
            CqlType::Inet => 0x0010,
            CqlType::Date => 0x0011,
            CqlType::Time => 0x0012,
            CqlType::Smallint => 0x0013,
            CqlType::Tinyint => 0x0014,
            CqlType::List(_) => 0x0020,
            CqlType::Map(_, _) => 0x0021,
            CqlType::Set(_) => 0x0022,
        }
    }

    /// Parse a CQL type name such as `varchar`, `bigint` or `set<text>`.
    /// Unknown names fall back to `varchar`, which is also what the engine
    /// assumes for inferred bind markers.
    pub fn from_name(name: &str) -> CqlType {
        let name = name.trim();
        if let Some(inner) = strip_generic(name, "list") {
            return CqlType::List(Box::new(CqlType::from_name(inner)));
        }
        if let Some(inner) = strip_generic(name, "set") {
            return CqlType::Set(Box::new(CqlType::from_name(inner)));
        }
        if let Some(inner) = strip_generic(name, "map") {
            let mut parts = inner.splitn(2, ',');
            let key = parts.next().unwrap_or("varchar");
            let value = parts.next().unwrap_or("varchar");
            return CqlType::Map(
                Box::new(CqlType::from_name(key)),
                Box::new(CqlType::from_name(value)),
            );
        }
        match name.to_ascii_lowercase().as_str() {
            "ascii" => CqlType::Ascii,
            "bigint" => CqlType::Bigint,
            "blob" => CqlType::Blob,
            "boolean" => CqlType::Boolean,
            "counter" => CqlType::Counter,
            "double" => CqlType::Double,
            "float" => CqlType::Float,
            "int" => CqlType::Int,
            "timestamp" => CqlType::Timestamp,
            "uuid" => CqlType::Uuid,
            "varint" => CqlType::Varint,
            "timeuuid" => CqlType::Timeuuid,
            "inet" => CqlType::Inet,
            "date" => CqlType::Date,
            "time" => CqlType::Time,
            "smallint" => CqlType::Smallint,
            "tinyint" => CqlType::Tinyint,
            _ => CqlType::Varchar,
        }
    }

    /// The CQL name of this type, e.g. `set<varchar>`
    pub fn name(&self) -> String {
        match self {
            CqlType::Ascii => "ascii".to_string(),
            CqlType::Bigint => "bigint".to_string(),
            CqlType::Blob => "blob".to_string(),
            CqlType::Boolean => "boolean".to_string(),
            CqlType::Counter => "counter".to_string(),
            CqlType::Double => "double".to_string(),
            CqlType::Float => "float".to_string(),
            CqlType::Int => "int".to_string(),
            CqlType::Timestamp => "timestamp".to_string(),
            CqlType::Uuid => "uuid".to_string(),
            CqlType::Varchar => "varchar".to_string(),
            CqlType::Varint => "varint".to_string(),
            CqlType::Timeuuid => "timeuuid".to_string(),
            CqlType::Inet => "inet".to_string(),
            CqlType::Date => "date".to_string(),
            CqlType::Time => "time".to_string(),
            CqlType::Smallint => "smallint".to_string(),
            CqlType::Tinyint => "tinyint".to_string(),
            CqlType::List(inner) => format!("list<{}>", inner.name()),
            CqlType::Map(key, value) => format!("map<{},{}>", key.name(), value.name()),
            CqlType::Set(inner) => format!("set<{}>", inner.name()),
        }
    }
}

fn strip_generic<'a>(name: &'a str, base: &str) -> Option<&'a str> {
    name.strip_prefix(base)?
        .trim()
        .strip_prefix('<')?
        .strip_suffix('>')
}

/// Encode a JSON value as the wire form of the given type.
///
/// `Value::Null` encodes as a null cell. Values that cannot be represented
/// in the target type fall back to their string form; primed data is taken
/// as given, not validated.
pub fn encode_value(value: &Value, ctype: &CqlType) -> Option<Bytes> {
    if value.is_null() {
        return None;
    }
    let mut buf = BytesMut::new();
    match ctype {
        CqlType::Ascii | CqlType::Varchar => {
            buf.put_slice(value_as_string(value).as_bytes());
        }
        CqlType::Bigint | CqlType::Counter | CqlType::Timestamp | CqlType::Time => {
            buf.put_i64(value_as_i64(value));
        }
        CqlType::Int => {
            buf.put_i32(value_as_i64(value) as i32);
        }
        CqlType::Smallint => {
            buf.put_i16(value_as_i64(value) as i16);
        }
        CqlType::Tinyint => {
            buf.put_i8(value_as_i64(value) as i8);
        }
        CqlType::Boolean => {
            buf.put_u8(u8::from(value.as_bool().unwrap_or(false)));
        }
        CqlType::Double => {
            buf.put_f64(value.as_f64().unwrap_or(0.0));
        }
        CqlType::Float => {
            buf.put_f32(value.as_f64().unwrap_or(0.0) as f32);
        }
        CqlType::Date => {
            buf.put_u32(value_as_i64(value) as u32);
        }
        CqlType::Varint => {
            buf.put_slice(&value_as_i64(value).to_be_bytes());
        }
        CqlType::Uuid | CqlType::Timeuuid => match value.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
            Some(uuid) => buf.put_slice(uuid.as_bytes()),
            None => buf.put_slice(&[0u8; 16]),
        },
        CqlType::Inet => match value.as_str().and_then(|s| s.parse::<IpAddr>().ok()) {
            Some(IpAddr::V4(ip)) => buf.put_slice(&ip.octets()),
            Some(IpAddr::V6(ip)) => buf.put_slice(&ip.octets()),
            None => buf.put_slice(&[0u8; 4]),
        },
        CqlType::Blob => {
            let text = value_as_string(value);
            let hex = text.strip_prefix("0x").unwrap_or(&text);
            let mut bytes = Vec::with_capacity(hex.len() / 2);
            let mut chars = hex.as_bytes().chunks_exact(2);
            for pair in &mut chars {
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(pair).unwrap_or("zz"), 16)
                {
                    bytes.push(byte);
                }
            }
            buf.put_slice(&bytes);
        }
        CqlType::List(inner) | CqlType::Set(inner) => {
            let items = value.as_array().cloned().unwrap_or_default();
            buf.put_i32(items.len() as i32);
            for item in &items {
                put_element(&mut buf, item, inner);
            }
        }
        CqlType::Map(key_type, value_type) => {
            let entries: BTreeMap<String, Value> = value
                .as_object()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            buf.put_i32(entries.len() as i32);
            for (key, val) in &entries {
                put_element(&mut buf, &Value::String(key.clone()), key_type);
                put_element(&mut buf, val, value_type);
            }
        }
    }
    Some(buf.freeze())
}

fn put_element(buf: &mut BytesMut, value: &Value, ctype: &CqlType) {
    match encode_value(value, ctype) {
        Some(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(&bytes);
        }
        None => buf.put_i32(-1),
    }
}

/// Decode a wire value of the given type back into a JSON value.
///
/// Used by the matcher to compare bound values against primed parameters.
/// Truncated or malformed cells decode to `Value::Null`, which never matches
/// a non-wildcard parameter.
pub fn decode_value(bytes: &[u8], ctype: &CqlType) -> Value {
    match ctype {
        CqlType::Ascii | CqlType::Varchar => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::Null,
        },
        CqlType::Bigint | CqlType::Counter | CqlType::Timestamp | CqlType::Time => {
            fixed::<8>(bytes).map_or(Value::Null, |b| Value::from(i64::from_be_bytes(b)))
        }
        CqlType::Int => fixed::<4>(bytes).map_or(Value::Null, |b| Value::from(i32::from_be_bytes(b))),
        CqlType::Smallint => {
            fixed::<2>(bytes).map_or(Value::Null, |b| Value::from(i16::from_be_bytes(b)))
        }
        CqlType::Tinyint => {
            fixed::<1>(bytes).map_or(Value::Null, |b| Value::from(i8::from_be_bytes(b)))
        }
        CqlType::Boolean => fixed::<1>(bytes).map_or(Value::Null, |b| Value::Bool(b[0] != 0)),
        CqlType::Double => {
            fixed::<8>(bytes).map_or(Value::Null, |b| Value::from(f64::from_be_bytes(b)))
        }
        CqlType::Float => {
            fixed::<4>(bytes).map_or(Value::Null, |b| Value::from(f32::from_be_bytes(b) as f64))
        }
        CqlType::Date => fixed::<4>(bytes).map_or(Value::Null, |b| Value::from(u32::from_be_bytes(b))),
        CqlType::Varint => {
            let mut acc: i64 = if bytes.first().is_some_and(|b| b & 0x80 != 0) {
                -1
            } else {
                0
            };
            for byte in bytes {
                acc = (acc << 8) | i64::from(*byte);
            }
            Value::from(acc)
        }
        CqlType::Uuid | CqlType::Timeuuid => fixed::<16>(bytes)
            .map_or(Value::Null, |b| Value::String(Uuid::from_bytes(b).to_string())),
        CqlType::Inet => match bytes.len() {
            4 => Value::String(
                IpAddr::from([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string(),
            ),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                Value::String(IpAddr::from(octets).to_string())
            }
            _ => Value::Null,
        },
        CqlType::Blob => {
            let mut text = String::with_capacity(2 + bytes.len() * 2);
            text.push_str("0x");
            for byte in bytes {
                text.push_str(&format!("{byte:02x}"));
            }
            Value::String(text)
        }
        // Collections only appear in primed rows, never in matched
        // parameters, so a structural decode is not needed.
        CqlType::List(_) | CqlType::Set(_) | CqlType::Map(_, _) => Value::Null,
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}
