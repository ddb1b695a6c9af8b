//! Primes
//!
//! A prime is a registered `(matcher, result, scope)` triple telling the
//! simulated nodes how to answer a class of requests.

use serde::{Deserialize, Serialize};

use crate::cluster::Scope;
use crate::protocol::{ColumnSpec, Frame, Message, Prepared};

use super::actions::Action;
use super::matcher::{prepared_statement_id, QueryMatcher, RequestMatcher};
use super::result::PrimeResult;

/// A canned response registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prime {
    pub when: RequestMatcher,
    pub then: PrimeResult,

    /// Whose connection engines this prime is visible to; unset fields widen
    #[serde(default, skip_serializing_if = "Scope::is_unset")]
    pub scope: Scope,
}

impl Prime {
    /// A deployment-wide prime
    pub fn new(when: RequestMatcher, then: PrimeResult) -> Self {
        Self {
            when,
            then,
            scope: Scope::any(),
        }
    }

    /// Shorthand: prime a query text with a result, deployment-wide
    pub fn query(text: impl Into<String>, then: PrimeResult) -> Self {
        Self::new(RequestMatcher::query(text), then)
    }

    /// Narrow visibility to one cluster
    pub fn for_cluster(mut self, cluster_id: u64) -> Self {
        self.scope = Scope::cluster(cluster_id);
        self
    }

    /// Narrow visibility to one node
    pub fn for_node(mut self, cluster_id: u64, data_center_id: u64, node_id: u64) -> Self {
        self.scope = Scope::node(cluster_id, data_center_id, node_id);
        self
    }

    /// Replace the visibility scope
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// The prepared-statement id of this prime's query, when it has one
    pub fn statement_id(&self) -> Vec<u8> {
        self.when
            .query_text()
            .map(prepared_statement_id)
            .unwrap_or_default()
    }

    /// The Prepared response a Prepare of this prime's query receives:
    /// deterministic id plus bind-variable metadata from the declared
    /// parameter types.
    pub fn to_prepared(&self) -> Message {
        let variables = match &self.when {
            RequestMatcher::Query(matcher) => variable_specs(matcher),
            _ => Vec::new(),
        };
        Message::Prepared(Prepared {
            id: self.statement_id(),
            variables,
        })
    }

    /// The ordered action list for a frame this prime matched.
    ///
    /// Prepare frames are special-cased: unless the result is an error that
    /// applies on prepare (`ignore_on_prepare` false), the response is the
    /// Prepared message rather than the primed result, which only takes
    /// effect on the subsequent Executes.
    pub fn actions(&self, frame: &Frame) -> Vec<Action> {
        if matches!(frame.message, Message::Prepare { .. }) {
            if self.then.is_error() && !self.then.ignore_on_prepare() {
                return self.then.to_actions(&self.statement_id());
            }
            return vec![Action::respond(self.to_prepared())];
        }
        self.then.to_actions(&self.statement_id())
    }
}

/// Bind-variable column specs in parameter order (numeric when positional)
fn variable_specs(matcher: &QueryMatcher) -> Vec<ColumnSpec> {
    let mut names: Vec<&String> = matcher.params.keys().collect();
    if names.iter().all(|n| n.parse::<usize>().is_ok()) {
        names.sort_by_key(|n| n.parse::<usize>().unwrap_or(usize::MAX));
    }
    names
        .into_iter()
        .map(|name| ColumnSpec {
            keyspace: String::new(),
            table: String::new(),
            name: name.clone(),
            ctype: matcher.declared_type(name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::actions::ActionKind;
    use super::*;
    use crate::protocol::types::CqlType;
    use crate::protocol::QueryParameters;

    fn prepare_frame(text: &str) -> Frame {
        Frame::request(
            4,
            0,
            Message::Prepare {
                query: text.to_string(),
            },
        )
    }

    fn execute_frame(id: Vec<u8>) -> Frame {
        Frame::request(
            4,
            0,
            Message::Execute {
                id,
                params: QueryParameters::default(),
            },
        )
    }

    #[test]
    fn test_prepare_gets_prepared_not_rows() {
        let prime = Prime::query("SELECT * FROM t WHERE k=?", PrimeResult::no_rows());
        let actions = prime.actions(&prepare_frame("SELECT * FROM t WHERE k=?"));
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0].kind,
            ActionKind::Respond(Message::Prepared(_))
        ));
    }

    #[test]
    fn test_execute_gets_primed_result() {
        let prime = Prime::query("SELECT * FROM t WHERE k=?", PrimeResult::no_rows());
        let actions = prime.actions(&execute_frame(prime.statement_id()));
        assert!(matches!(
            actions[0].kind,
            ActionKind::Respond(Message::Rows(_))
        ));
    }

    #[test]
    fn test_error_applies_on_prepare_unless_ignored() {
        let error = PrimeResult::ServerError {
            message: "boom".to_string(),
            delay_in_ms: 0,
            ignore_on_prepare: false,
        };
        let prime = Prime::query("SELECT 1", error);
        let actions = prime.actions(&prepare_frame("SELECT 1"));
        assert!(matches!(
            actions[0].kind,
            ActionKind::Respond(Message::Error(_))
        ));

        let ignored = PrimeResult::ServerError {
            message: "boom".to_string(),
            delay_in_ms: 0,
            ignore_on_prepare: true,
        };
        let prime = Prime::query("SELECT 1", ignored);
        let actions = prime.actions(&prepare_frame("SELECT 1"));
        assert!(matches!(
            actions[0].kind,
            ActionKind::Respond(Message::Prepared(_))
        ));
    }

    #[test]
    fn test_variable_specs_in_positional_order() {
        let mut matcher = QueryMatcher::inferred(
            "SELECT * FROM t WHERE a=? AND b=? AND c=? AND d=? AND e=? AND f=? AND g=? AND h=? AND i=? AND j=? AND k=?",
        );
        matcher
            .param_types
            .insert("10".to_string(), "bigint".to_string());
        let prime = Prime::new(RequestMatcher::Query(matcher), PrimeResult::no_rows());
        match prime.to_prepared() {
            Message::Prepared(prepared) => {
                assert_eq!(prepared.variables.len(), 11);
                assert_eq!(prepared.variables[10].name, "10");
                assert_eq!(prepared.variables[10].ctype, CqlType::Bigint);
                assert_eq!(prepared.variables[2].name, "2");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_prime_json_round_trip() {
        let prime = Prime::query("SELECT * FROM t", PrimeResult::no_rows()).for_cluster(3);
        let json = serde_json::to_string(&prime).unwrap();
        let back: Prime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prime);

        // Stable modulo key order: serialize → parse → serialize is identical.
        let json2 = serde_json::to_string(&back).unwrap();
        assert_eq!(json, json2);
    }
}
