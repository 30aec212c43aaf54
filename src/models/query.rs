//! Query-related data models.
//!
//! This module defines parameterized statements and the records and
//! summaries returned for them.

use crate::error::{DriverError, DriverResult};
use crate::models::value::{Params, Value};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// A parameterized statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    text: String,
    #[serde(default)]
    params: Params,
}

impl Query {
    /// Create a query without parameters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Params::new(),
        }
    }

    /// Create a query with a full parameter map.
    pub fn with_params(text: impl Into<String>, params: Params) -> Self {
        Self {
            text: text.into(),
            params,
        }
    }

    /// Add a parameter to this query.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// One result row: a mapping from declared return alias to value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    keys: Vec<String>,
    values: Vec<Value>,
}

impl Record {
    /// Create a record. Keys and values are matched by position.
    pub fn new(keys: Vec<String>, values: Vec<Value>) -> Self {
        Self { keys, values }
    }

    /// Get a value by its return alias.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keys
            .iter()
            .position(|k| k == key)
            .and_then(|idx| self.values.get(idx))
    }

    /// Get a value by column position.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Convert into an alias → value map.
    pub fn into_map(self) -> Params {
        self.keys.into_iter().zip(self.values).collect()
    }
}

/// Kind of statement as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    ReadOnly,
    ReadWrite,
    WriteOnly,
    SchemaWrite,
}

/// Update statistics for a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
    pub properties_set: u64,
    pub labels_added: u64,
    pub labels_removed: u64,
}

impl Counters {
    /// True if the statement changed anything.
    pub fn contains_updates(&self) -> bool {
        *self != Counters::default()
    }
}

/// Summary of a fully consumed result.
#[derive(Debug, Clone, Serialize)]
pub struct ResultSummary {
    pub query: Query,
    /// Database the statement ran against. None means the server default.
    pub database: Option<String>,
    pub query_type: Option<QueryType>,
    pub counters: Counters,
    /// Wall-clock time between sending the statement and receiving the last record.
    pub result_consumed_after: Duration,
}

impl ResultSummary {
    /// Create an empty summary for a query.
    pub fn new(query: Query, database: Option<String>) -> Self {
        Self {
            query,
            database,
            query_type: None,
            counters: Counters::default(),
            result_consumed_after: Duration::ZERO,
        }
    }
}

/// Records returned for one statement.
///
/// Records are pulled from the connection in batches of the session's fetch
/// size and buffered here, so the connection can be released as soon as the
/// statement completes.
#[derive(Debug, Clone)]
pub struct ResultStream {
    keys: Vec<String>,
    records: VecDeque<Record>,
    summary: ResultSummary,
}

impl ResultStream {
    pub fn new(keys: Vec<String>, records: Vec<Record>, summary: ResultSummary) -> Self {
        Self {
            keys,
            records: records.into(),
            summary,
        }
    }

    /// Return aliases declared by the statement.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Records not yet taken from the stream.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Peek at the next record without consuming it.
    pub fn peek(&self) -> Option<&Record> {
        self.records.front()
    }

    pub fn summary(&self) -> &ResultSummary {
        &self.summary
    }

    /// Take the only record of the stream.
    pub fn single(mut self) -> DriverResult<Record> {
        if self.records.len() != 1 {
            return Err(DriverError::ResultNotSingle {
                count: self.records.len(),
            });
        }
        self.records
            .pop_front()
            .ok_or(DriverError::ResultNotSingle { count: 0 })
    }

    /// Discard remaining records and return the summary.
    pub fn consume(self) -> ResultSummary {
        self.summary
    }

    /// Take all remaining records.
    pub fn into_records(self) -> Vec<Record> {
        self.records.into()
    }
}

impl Iterator for ResultStream {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(n: usize) -> ResultStream {
        let keys = vec!["x".to_string()];
        let records = (0..n)
            .map(|i| Record::new(keys.clone(), vec![Value::Int(i as i64)]))
            .collect();
        ResultStream::new(keys, records, ResultSummary::new(Query::new("RETURN 1"), None))
    }

    #[test]
    fn test_query_builder_collects_params() {
        let query = Query::new("CREATE (p:Person {name: $name})").param("name", "Michael");
        assert_eq!(query.params().get("name"), Some(&Value::from("Michael")));
    }

    #[test]
    fn test_record_lookup_by_alias() {
        let record = Record::new(
            vec!["a".to_string(), "b".to_string()],
            vec![Value::Int(1), Value::Bool(false)],
        );
        assert_eq!(record.get("b"), Some(&Value::Bool(false)));
        assert_eq!(record.get("c"), None);
        assert_eq!(record.get_index(0), Some(&Value::Int(1)));
    }

    #[test]
    fn test_single_requires_exactly_one_record() {
        assert!(stream_of(1).single().is_ok());
        assert!(matches!(
            stream_of(0).single(),
            Err(DriverError::ResultNotSingle { count: 0 })
        ));
        assert!(matches!(
            stream_of(2).single(),
            Err(DriverError::ResultNotSingle { count: 2 })
        ));
    }

    #[test]
    fn test_stream_iterates_in_order() {
        let values: Vec<i64> = stream_of(3)
            .filter_map(|r| r.get("x").and_then(Value::as_i64))
            .collect();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[test]
    fn test_counters_contains_updates() {
        assert!(!Counters::default().contains_updates());
        let counters = Counters {
            nodes_created: 1,
            ..Counters::default()
        };
        assert!(counters.contains_updates());
    }
}
