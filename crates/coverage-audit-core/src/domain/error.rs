//! Error taxonomy for the coverage audit.

/// Errors produced while parsing or compiling a filter expression.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("unknown filter operator: {op}")]
    UnknownOperator { op: String },

    #[error("operator {op} expects {expected}")]
    MalformedOperand { op: String, expected: String },

    #[error("invalid regex for field {field}: {source}")]
    InvalidRegex {
        field: String,
        #[source]
        source: regex::Error,
    },
}

/// Coverage audit errors.
///
/// Every variant is fatal to the enclosing operation. A group with no
/// expected work is not an error and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("transport error talking to {endpoint}: {detail}")]
    Transport { endpoint: String, detail: String },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response shape: {0}")]
    Decode(String),

    #[error("invalid filter expression: {0}")]
    Expr(#[from] ExprError),

    #[error("work queue publish failed: {0}")]
    Queue(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuditError {
    pub(crate) fn transport(endpoint: &str, err: reqwest::Error) -> Self {
        AuditError::Transport {
            endpoint: endpoint.to_string(),
            detail: err.to_string(),
        }
    }
}

/// Result type for coverage audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
