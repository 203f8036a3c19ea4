//! Error types for datastore engine operations

use thiserror::Error;

/// SQLSTATE raised by PostgreSQL on a unique index violation
pub const UNIQUE_VIOLATION: &str = "23505";

/// Errors that can occur during datastore engine operations
#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// A validation failure attached to a bulk upload line.
    #[error("Validation error at line {line}: {message}")]
    RowValidation {
        line: usize,
        field_id: Option<String>,
        message: String,
    },

    /// Several field failures on one bulk upload line, as (field id, message).
    #[error("Validation error at line {line}: {}", join_field_errors(.errors))]
    RowFieldErrors {
        line: usize,
        errors: Vec<(String, String)>,
    },

    #[error("primary key duplicate, fields[{}], values[{}]", .fields.join(","), .values.join(","))]
    Conflict {
        fields: Vec<String>,
        values: Vec<String>,
    },

    #[error("auto number overflow: sequence '{sequence}' exceeds {digits} digits")]
    Overflow { sequence: String, digits: u32 },

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Datastore not found: {0}")]
    DatastoreNotFound(String),

    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Invalid formula: {0}")]
    InvalidFormula(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DatastoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn row_validation(line: usize, field_id: Option<&str>, msg: impl Into<String>) -> Self {
        Self::RowValidation {
            line,
            field_id: field_id.map(str::to_string),
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn datastore_not_found(msg: impl Into<String>) -> Self {
        Self::DatastoreNotFound(msg.into())
    }

    pub fn field_not_found(msg: impl Into<String>) -> Self {
        Self::FieldNotFound(msg.into())
    }

    pub fn invalid_condition(msg: impl Into<String>) -> Self {
        Self::InvalidCondition(msg.into())
    }

    pub fn invalid_formula(msg: impl Into<String>) -> Self {
        Self::InvalidFormula(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Timeouts and network failures. Callers may retry these; the engine never does.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Sql(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// True when the error aborts a whole bulk operation rather than one batch.
    pub fn is_fatal_for_bulk(&self) -> bool {
        matches!(self, Self::Overflow { .. } | Self::Conflict { .. }) || self.is_transient()
    }

    /// Whether the underlying storage error is a unique violation.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == UNIQUE_VIOLATION)
    }
}

pub type Result<T> = std::result::Result<T, DatastoreError>;

fn join_field_errors(errors: &[(String, String)]) -> String {
    errors
        .iter()
        .map(|(field_id, message)| format!("field '{}': {}", field_id, message))
        .collect::<Vec<_>>()
        .join("; ")
}
