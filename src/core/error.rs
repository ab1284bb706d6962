use std::time::Duration;

use thiserror::Error;

/// Why the validator refused a candidate statement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("empty-statement: no SQL was provided")]
    EmptyStatement,
    #[error("multiple-statements: only a single SQL statement is allowed")]
    MultipleStatements,
    #[error("write-operation-forbidden: only SELECT statements are allowed (got {keyword})")]
    WriteOperationForbidden { keyword: String },
    #[error("unknown-table: table '{table}' does not exist in the schema")]
    UnknownTable { table: String },
}

impl SafetyViolation {
    pub fn reason(&self) -> &'static str {
        match self {
            SafetyViolation::EmptyStatement => "empty-statement",
            SafetyViolation::MultipleStatements => "multiple-statements",
            SafetyViolation::WriteOperationForbidden { .. } => "write-operation-forbidden",
            SafetyViolation::UnknownTable { .. } => "unknown-table",
        }
    }
}

/// Errors raised inside a run.
///
/// Only `SchemaUnavailable` and `Cancelled` end a run on their own; every other
/// kind is caught by the controller, recorded as a failed attempt and fed back
/// to the model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QaError {
    #[error("schema unavailable: {0}")]
    SchemaUnavailable(String),
    #[error("malformed model output: {0}")]
    MalformedModelOutput(String),
    #[error(transparent)]
    SafetyViolation(#[from] SafetyViolation),
    /// Engine message, kept verbatim so the model sees exactly what SQLite said.
    #[error("{0}")]
    ExecutionError(String),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("run cancelled")]
    Cancelled,
}

impl QaError {
    pub fn kind(&self) -> &'static str {
        match self {
            QaError::SchemaUnavailable(_) => "schema_unavailable",
            QaError::MalformedModelOutput(_) => "malformed_model_output",
            QaError::SafetyViolation(_) => "safety_violation",
            QaError::ExecutionError(_) => "execution_error",
            QaError::Timeout { .. } => "timeout",
            QaError::ModelUnavailable(_) => "model_unavailable",
            QaError::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, QaError::SchemaUnavailable(_) | QaError::Cancelled)
    }
}
