//! Declarative filter expressions.
//!
//! An [`Expr`] is the `where` clause of a query document. The same tree is
//! sent to the query service verbatim and, once [`Expr::compile`]d into a
//! [`Predicate`], evaluated locally against result rows to route them to
//! variants.
//!
//! JSON form: `{"and": [..]}`, `{"or": [..]}`, `{"not": expr}`,
//! `{"eq": {"field": value}}` (likewise `ne`, `lt`, `gt`, `gte`),
//! `{"terms": {"field": [values]}}`, `{"in": {"field": [values]}}`,
//! `{"regex": {"field": "pattern"}}`, `{"exists": "field"}`,
//! `{"missing": "field"}` and the literal `true`. A comparison object with
//! several fields is a conjunction.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::domain::error::ExprError;

/// Comparison operators taking a single operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Gte,
}

impl CompareOp {
    fn keyword(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Gt => "gt",
            CompareOp::Gte => "gte",
        }
    }

    fn from_keyword(op: &str) -> Option<Self> {
        Some(match op {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "lt" => CompareOp::Lt,
            "gt" => CompareOp::Gt,
            "gte" => CompareOp::Gte,
            _ => return None,
        })
    }
}

/// Set-membership operators. Both keywords mean the same thing; the
/// distinction is kept so a parsed filter serialises back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOp {
    Terms,
    In,
}

impl MemberOp {
    fn keyword(self) -> &'static str {
        match self {
            MemberOp::Terms => "terms",
            MemberOp::In => "in",
        }
    }
}

/// A boolean filter expression over record fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    True,
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        op: CompareOp,
        field: String,
        value: Value,
    },
    Member {
        op: MemberOp,
        field: String,
        values: Vec<Value>,
    },
    Regex {
        field: String,
        pattern: String,
    },
    Exists {
        field: String,
    },
}

impl Expr {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(CompareOp::Eq, field, value)
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(CompareOp::Ne, field, value)
    }

    pub fn compare(op: CompareOp, field: &str, value: impl Into<Value>) -> Self {
        Expr::Compare {
            op,
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn terms<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Expr::Member {
            op: MemberOp::Terms,
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn regex(field: &str, pattern: &str) -> Self {
        Expr::Regex {
            field: field.to_string(),
            pattern: pattern.to_string(),
        }
    }

    /// Conjunction that drops `True` terms and collapses single children.
    pub fn all(terms: impl IntoIterator<Item = Expr>) -> Self {
        let mut terms: Vec<Expr> = terms.into_iter().filter(|t| *t != Expr::True).collect();
        match terms.len() {
            0 => Expr::True,
            1 => terms.remove(0),
            _ => Expr::And(terms),
        }
    }

    /// Disjunction that collapses single children.
    pub fn any(terms: impl IntoIterator<Item = Expr>) -> Self {
        let mut terms: Vec<Expr> = terms.into_iter().collect();
        if terms.contains(&Expr::True) {
            return Expr::True;
        }
        match terms.len() {
            1 => terms.remove(0),
            _ => Expr::Or(terms),
        }
    }

    /// Field paths referenced anywhere in the expression.
    pub fn vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::True => {}
            Expr::And(terms) | Expr::Or(terms) => {
                for term in terms {
                    term.collect_vars(out);
                }
            }
            Expr::Not(inner) => inner.collect_vars(out),
            Expr::Compare { field, .. }
            | Expr::Member { field, .. }
            | Expr::Regex { field, .. }
            | Expr::Exists { field } => {
                out.insert(field.clone());
            }
        }
    }

    /// Compile into a callable predicate. Fails only on invalid regexes.
    pub fn compile(&self) -> Result<Predicate, ExprError> {
        Ok(Predicate {
            node: Node::build(self)?,
        })
    }

    /// Parse the JSON form.
    pub fn from_json(value: &Value) -> Result<Self, ExprError> {
        match value {
            Value::Bool(true) => Ok(Expr::True),
            Value::Object(obj) if obj.len() == 1 => {
                let (op, operand) = obj.iter().next().ok_or_else(|| malformed("{}", "an operator"))?;
                parse_operator(op, operand)
            }
            Value::Object(obj) if obj.is_empty() => Ok(Expr::True),
            _ => Err(malformed("expression", "an object with exactly one operator")),
        }
    }

    /// Render the JSON form.
    pub fn to_json(&self) -> Value {
        fn single(op: &str, operand: Value) -> Value {
            let mut obj = Map::new();
            obj.insert(op.to_string(), operand);
            Value::Object(obj)
        }
        match self {
            Expr::True => Value::Bool(true),
            Expr::And(terms) => single("and", terms.iter().map(Expr::to_json).collect()),
            Expr::Or(terms) => single("or", terms.iter().map(Expr::to_json).collect()),
            Expr::Not(inner) => single("not", inner.to_json()),
            Expr::Compare { op, field, value } => {
                single(op.keyword(), single(field, value.clone()))
            }
            Expr::Member { op, field, values } => {
                single(op.keyword(), single(field, Value::Array(values.clone())))
            }
            Expr::Regex { field, pattern } => {
                single("regex", single(field, Value::String(pattern.clone())))
            }
            Expr::Exists { field } => single("exists", Value::String(field.clone())),
        }
    }
}

fn malformed(op: &str, expected: &str) -> ExprError {
    ExprError::MalformedOperand {
        op: op.to_string(),
        expected: expected.to_string(),
    }
}

fn parse_operator(op: &str, operand: &Value) -> Result<Expr, ExprError> {
    match op {
        "and" | "or" => {
            let terms = operand
                .as_array()
                .ok_or_else(|| malformed(op, "a list of expressions"))?
                .iter()
                .map(Expr::from_json)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if op == "and" {
                Expr::And(terms)
            } else {
                Expr::Or(terms)
            })
        }
        "not" => Ok(Expr::Not(Box::new(Expr::from_json(operand)?))),
        "exists" | "missing" => {
            let field = operand
                .as_str()
                .ok_or_else(|| malformed(op, "a field name"))?
                .to_string();
            let exists = Expr::Exists { field };
            Ok(if op == "exists" {
                exists
            } else {
                Expr::Not(Box::new(exists))
            })
        }
        "terms" | "in" => {
            let member_op = if op == "terms" {
                MemberOp::Terms
            } else {
                MemberOp::In
            };
            field_map(op, operand, |field, value| {
                let values = match value {
                    Value::Array(values) => values.clone(),
                    single => vec![single.clone()],
                };
                Ok(Expr::Member {
                    op: member_op,
                    field: field.to_string(),
                    values,
                })
            })
        }
        "regex" => field_map(op, operand, |field, value| {
            let pattern = value
                .as_str()
                .ok_or_else(|| malformed("regex", "a string pattern"))?;
            Ok(Expr::regex(field, pattern))
        }),
        other => match CompareOp::from_keyword(other) {
            Some(cmp) => field_map(op, operand, |field, value| {
                Ok(Expr::compare(cmp, field, value.clone()))
            }),
            None => Err(ExprError::UnknownOperator {
                op: other.to_string(),
            }),
        },
    }
}

/// `{"f1": v1, "f2": v2}` → conjunction of per-field terms.
fn field_map<F>(op: &str, operand: &Value, mut build: F) -> Result<Expr, ExprError>
where
    F: FnMut(&str, &Value) -> Result<Expr, ExprError>,
{
    let obj = operand
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| malformed(op, "an object of field: value pairs"))?;
    let mut terms = obj
        .iter()
        .map(|(field, value)| build(field, value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(if terms.len() == 1 {
        terms.remove(0)
    } else {
        Expr::And(terms)
    })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Expr::from_json(&value).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Resolve a dotted field path against a record.
///
/// Tries the literal key first, then descends through nested objects at
/// each `.`. Null values count as missing.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let obj = record.as_object()?;
    if let Some(v) = obj.get(path) {
        return (!v.is_null()).then_some(v);
    }
    for (idx, _) in path.match_indices('.') {
        if let Some(child) = obj.get(&path[..idx]) {
            if let Some(v) = lookup(child, &path[idx + 1..]) {
                return Some(v);
            }
        }
    }
    None
}

/// A compiled [`Expr`], evaluated against result rows.
#[derive(Debug, Clone)]
pub struct Predicate {
    node: Node,
}

impl Predicate {
    pub fn evaluate(&self, record: &Value) -> bool {
        self.node.evaluate(record)
    }
}

#[derive(Debug, Clone)]
enum Node {
    True,
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Compare {
        op: CompareOp,
        field: String,
        value: Value,
    },
    Member {
        field: String,
        values: Vec<Value>,
    },
    Regex {
        field: String,
        re: Regex,
    },
    Exists {
        field: String,
    },
}

impl Node {
    fn build(expr: &Expr) -> Result<Self, ExprError> {
        Ok(match expr {
            Expr::True => Node::True,
            Expr::And(terms) => Node::And(terms.iter().map(Node::build).collect::<Result<_, _>>()?),
            Expr::Or(terms) => Node::Or(terms.iter().map(Node::build).collect::<Result<_, _>>()?),
            Expr::Not(inner) => Node::Not(Box::new(Node::build(inner)?)),
            Expr::Compare { op, field, value } => Node::Compare {
                op: *op,
                field: field.clone(),
                value: value.clone(),
            },
            Expr::Member { field, values, .. } => Node::Member {
                field: field.clone(),
                values: values.clone(),
            },
            Expr::Regex { field, pattern } => Node::Regex {
                field: field.clone(),
                // the query service matches the whole value
                re: Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                    ExprError::InvalidRegex {
                        field: field.clone(),
                        source,
                    }
                })?,
            },
            Expr::Exists { field } => Node::Exists {
                field: field.clone(),
            },
        })
    }

    fn evaluate(&self, record: &Value) -> bool {
        match self {
            Node::True => true,
            Node::And(terms) => terms.iter().all(|t| t.evaluate(record)),
            Node::Or(terms) => terms.iter().any(|t| t.evaluate(record)),
            Node::Not(inner) => !inner.evaluate(record),
            Node::Compare { op, field, value } => {
                let found = lookup(record, field);
                match op {
                    CompareOp::Ne => !any_element(found, |v| json_eq(v, value)),
                    CompareOp::Eq => any_element(found, |v| json_eq(v, value)),
                    CompareOp::Lt => any_element(found, |v| json_cmp(v, value) == Some(Ordering::Less)),
                    CompareOp::Gt => {
                        any_element(found, |v| json_cmp(v, value) == Some(Ordering::Greater))
                    }
                    CompareOp::Gte => any_element(found, |v| {
                        matches!(json_cmp(v, value), Some(Ordering::Greater | Ordering::Equal))
                    }),
                }
            }
            Node::Member { field, values } => any_element(lookup(record, field), |v| {
                values.iter().any(|candidate| json_eq(v, candidate))
            }),
            Node::Regex { field, re } => {
                any_element(lookup(record, field), |v| v.as_str().is_some_and(|s| re.is_match(s)))
            }
            Node::Exists { field } => lookup(record, field).is_some(),
        }
    }
}

/// Apply `test` to a scalar field, or to each element of a list field.
fn any_element<F>(found: Option<&Value>, test: F) -> bool
where
    F: Fn(&Value) -> bool,
{
    match found {
        None => false,
        Some(Value::Array(items)) => items.iter().any(|item| test(item)),
        Some(v) => test(v),
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Numbers compare numerically, strings lexically; anything else (including
/// server-side operands such as `{"date": "now-3day"}`) is incomparable.
fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
