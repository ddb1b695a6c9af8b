//! Request matchers
//!
//! A matcher decides whether a prime applies to an incoming frame. Query
//! matchers compare text, consistency and typed bound values; Execute frames
//! are matched indirectly through the deterministic prepared-statement id of
//! the matcher's query text.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::protocol::types::{decode_value, encode_value, Consistency, CqlType};
use crate::protocol::{Batch, BatchQuery, Frame, Message, QueryParameters};

/// Prepared-statement ids are a content hash of the query text, so a prime
/// registered after a Prepare still matches the corresponding Executes.
pub fn prepared_statement_id(query: &str) -> Vec<u8> {
    let digest = Sha256::digest(query.as_bytes());
    digest[..16].to_vec()
}

/// Hex rendering of a prepared-statement id, used in Unprepared messages
pub fn hex_id(id: &[u8]) -> String {
    let mut out = String::with_capacity(id.len() * 2);
    for byte in id {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The matcher half of a prime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum RequestMatcher {
    /// Match queries (and their prepare/execute lifecycle) by text and values
    Query(QueryMatcher),
    /// Match a Prepare by exact query text
    Prepare { query: String },
    /// Match any Options request
    Options,
    /// Match any Startup request
    Startup,
}

/// Text, consistency and parameter constraints for a query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryMatcher {
    pub query: String,

    /// Accepted consistency levels; empty accepts all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consistency_level: Vec<Consistency>,

    /// Expected values by name, or by index rendered as `"0"`, `"1"`, …
    /// The string `"*"` is a wildcard.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,

    /// Declared CQL type per parameter; missing entries default to varchar
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub param_types: BTreeMap<String, String>,
}

impl RequestMatcher {
    /// Shorthand for a bare query-text matcher
    pub fn query(text: impl Into<String>) -> Self {
        RequestMatcher::Query(QueryMatcher {
            query: text.into(),
            ..QueryMatcher::default()
        })
    }

    /// Whether this matcher accepts the frame
    pub fn matches(&self, frame: &Frame) -> bool {
        match (self, &frame.message) {
            (RequestMatcher::Options, Message::Options) => true,
            (RequestMatcher::Startup, Message::Startup(_)) => true,
            (RequestMatcher::Prepare { query }, Message::Prepare { query: incoming }) => {
                query == incoming
            }
            (RequestMatcher::Query(matcher), message) => matcher.matches_message(message),
            _ => false,
        }
    }

    /// The query text, for matchers that carry one
    pub fn query_text(&self) -> Option<&str> {
        match self {
            RequestMatcher::Query(matcher) => Some(&matcher.query),
            RequestMatcher::Prepare { query } => Some(query),
            _ => None,
        }
    }
}

impl QueryMatcher {
    /// Build the matcher the engine registers when a Prepare arrives: the
    /// parameter skeleton is inferred from the query text. `?` markers become
    /// indexed varchar wildcards; otherwise `word = :name` pairs become named
    /// varchar wildcards.
    pub fn inferred(query: &str) -> Self {
        let mut params = BTreeMap::new();
        let mut param_types = BTreeMap::new();

        let positional = query.chars().filter(|c| *c == '?').count();
        if positional > 0 {
            for i in 0..positional {
                params.insert(i.to_string(), Value::String("*".to_string()));
                param_types.insert(i.to_string(), "varchar".to_string());
            }
        } else {
            for name in named_bind_columns(query) {
                params.insert(name.clone(), Value::String("*".to_string()));
                param_types.insert(name, "varchar".to_string());
            }
        }

        Self {
            query: query.to_string(),
            consistency_level: Vec::new(),
            params,
            param_types,
        }
    }

    fn matches_message(&self, message: &Message) -> bool {
        match message {
            Message::Query { query, params } => {
                query == &self.query
                    && self.consistency_accepts(params.consistency)
                    && self.values_match(params)
            }
            // A query prime also answers a Prepare of the same text.
            Message::Prepare { query } => query == &self.query,
            Message::Execute { id, params } => {
                *id == prepared_statement_id(&self.query)
                    && self.consistency_accepts(params.consistency)
                    && self.values_match(params)
            }
            Message::Batch(batch) => self.matches_batch(batch),
            _ => false,
        }
    }

    fn matches_batch(&self, batch: &Batch) -> bool {
        if !self.consistency_accepts(batch.consistency) {
            return false;
        }
        // Matched on the first statement, text or prepared id.
        match batch.queries.first() {
            Some(BatchQuery::Text(text, _)) => text == &self.query,
            Some(BatchQuery::Id(id, _)) => *id == prepared_statement_id(&self.query),
            None => false,
        }
    }

    fn consistency_accepts(&self, consistency: Consistency) -> bool {
        self.consistency_level.is_empty() || self.consistency_level.contains(&consistency)
    }

    /// Parameter matching per the lookup contract: when the matcher declares
    /// parameters, the frame must carry the same number of values, each equal
    /// under the declared type or matched by the `"*"` wildcard.
    fn values_match(&self, incoming: &QueryParameters) -> bool {
        if self.params.is_empty() {
            return true;
        }
        if incoming.value_count() != self.params.len() {
            return false;
        }

        let by_name: BTreeMap<String, Option<Bytes>> = if incoming.named.is_empty() {
            incoming
                .positional
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect()
        } else {
            incoming.named.iter().cloned().collect()
        };

        for (name, expected) in &self.params {
            let Some(actual) = by_name.get(name) else {
                return false;
            };
            if expected.as_str() == Some("*") {
                continue;
            }
            let ctype = self.declared_type(name);
            let actual_value = match actual {
                Some(bytes) => decode_value(bytes, &ctype),
                None => Value::Null,
            };
            if !values_equal(expected, &actual_value, &ctype) {
                return false;
            }
        }
        true
    }

    /// Declared type of a parameter, defaulting to varchar
    pub fn declared_type(&self, name: &str) -> CqlType {
        self.param_types
            .get(name)
            .map(|n| CqlType::from_name(n))
            .unwrap_or(CqlType::Varchar)
    }
}

/// Compare a primed value against a decoded bound value. The primed side is
/// normalized through the codec of the declared type so `"1"` and `1` agree
/// for a bigint parameter.
fn values_equal(expected: &Value, actual: &Value, ctype: &CqlType) -> bool {
    if expected == actual {
        return true;
    }
    match encode_value(expected, ctype) {
        Some(bytes) => decode_value(&bytes, ctype) == *actual,
        None => actual.is_null(),
    }
}

/// Columns bound through `word = :name` markers, in appearance order
fn named_bind_columns(query: &str) -> Vec<String> {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    let mut names = Vec::new();
    for window in tokens.windows(3) {
        let [column, eq, marker] = [window[0], window[1], window[2]];
        if eq == "="
            && marker.starts_with(':')
            && marker.len() > 1
            && column.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '\'')
        {
            names.push(column.to_string());
        }
    }
    names
}
