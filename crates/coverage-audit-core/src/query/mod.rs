//! Query documents for the ActiveData-style query service.
//!
//! This module provides:
//! - [`Query`]: the declarative query document (`from`, `select`, `edges`,
//!   `groupby`, `where`, `limit`, `format`)
//! - [`QueryResponse`]: the JSON result envelope, with list and table accessors
//! - [`QueryGateway`]: the injectable seam that executes queries
//! - [`expr`]: filter expressions and their compiled predicates
//! - [`http`]: the reqwest-backed gateway

pub mod expr;
pub mod http;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::{AuditError, Result};
pub use expr::{CompareOp, Expr, MemberOp, Predicate};
pub use http::HttpQueryGateway;

/// Datasets exposed by the query service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dataset {
    Task,
    Coverage,
    CoverageSummary,
}

/// Shape of the `data` payload in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    List,
    Table,
}

/// A `select` / `edges` entry: a bare field path or a named projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Projection {
    Field(String),
    Spec {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregate: Option<String>,
    },
}

impl Projection {
    pub fn field(path: &str) -> Self {
        Projection::Field(path.to_string())
    }

    pub fn named(name: &str, value: &str) -> Self {
        Projection::Spec {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
            aggregate: None,
        }
    }

    pub fn count() -> Self {
        Projection::Spec {
            name: None,
            value: None,
            aggregate: Some("count".to_string()),
        }
    }
}

/// A declarative query document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub from: Dataset,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<Projection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Projection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groupby: Vec<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default)]
    pub format: Format,
}

impl Query {
    pub fn new(from: Dataset) -> Self {
        Query {
            from,
            select: Vec::new(),
            edges: Vec::new(),
            groupby: Vec::new(),
            filter: None,
            limit: None,
            format: Format::List,
        }
    }

    pub fn select(mut self, projection: Projection) -> Self {
        self.select.push(projection);
        self
    }

    pub fn edge(mut self, projection: Projection) -> Self {
        self.edges.push(projection);
        self
    }

    pub fn groupby(mut self, field: &str) -> Self {
        self.groupby.push(field.to_string());
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }
}

/// Response envelope. `data` is a list of records for [`Format::List`] and
/// a list of row arrays (with `header`) for [`Format::Table`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub header: Option<Vec<String>>,
    #[serde(default)]
    pub data: Value,
}

impl QueryResponse {
    pub fn list(records: Vec<Value>) -> Self {
        QueryResponse {
            header: None,
            data: Value::Array(records),
        }
    }

    pub fn table(header: &[&str], rows: Vec<Vec<Value>>) -> Self {
        QueryResponse {
            header: Some(header.iter().map(|h| h.to_string()).collect()),
            data: Value::Array(rows.into_iter().map(Value::Array).collect()),
        }
    }

    /// Records of a list-format response. A null payload is an empty list.
    pub fn records(&self) -> Result<&[Value]> {
        match &self.data {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(&[]),
            other => Err(AuditError::Decode(format!(
                "expected list data, got {}",
                json_kind(other)
            ))),
        }
    }

    /// Deserialize every record of a list-format response.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.records()?
            .iter()
            .map(|r| serde_json::from_value(r.clone()).map_err(AuditError::from))
            .collect()
    }

    /// Rows of a table-format response.
    pub fn rows(&self) -> Result<Vec<&[Value]>> {
        self.records()?
            .iter()
            .map(|row| match row {
                Value::Array(cells) => Ok(cells.as_slice()),
                other => Err(AuditError::Decode(format!(
                    "expected table row, got {}",
                    json_kind(other)
                ))),
            })
            .collect()
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Executes query documents against the query service.
///
/// Implement this trait to plug in the HTTP service or a test stub.
#[async_trait]
pub trait QueryGateway: Send + Sync {
    async fn execute(&self, query: &Query) -> Result<QueryResponse>;
}
