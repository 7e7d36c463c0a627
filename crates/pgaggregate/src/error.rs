//! Error types for pgaggregate

use thiserror::Error;

/// Result type alias for pgaggregate operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for aggregate persistence operations
#[derive(Debug, Error)]
pub enum OrmError {
    /// Database connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Raw backend error, not classified by SQLSTATE
    #[error("Backend error: {0}")]
    BackendError(#[from] tokio_postgres::Error),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint violation
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    /// Foreign key constraint violation
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Check constraint violation
    #[error("Check constraint violation: {0}")]
    CheckViolation(String),

    /// Row decode/mapping error
    #[error("Decode error on column '{column}': {message}")]
    Decode { column: String, message: String },

    /// A `:name` placeholder in a fragment has no matching value
    #[error("missing value for parameter '{0}'")]
    ParameterMissing(String),

    /// A session was asked to operate on an unregistered entity type
    #[error("no mapping registered for type '{0}'")]
    MappingNotFound(&'static str),

    /// A mapping declares no primary key, or an entity instance carries none
    #[error("entity of type '{0}' has no primary key")]
    NoPrimaryKey(&'static str),

    /// An internal consistency assumption was violated (caller misuse or corrupt mapping metadata)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// `tx()` was committed/rolled back with no active transaction, or nesting depth underflowed
    #[error("transaction state error: {0}")]
    TransactionStateError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Pool error
    #[cfg(feature = "pool")]
    #[error("Pool error: {0}")]
    Pool(String),

    /// Query timeout error
    #[error("Query timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl OrmError {
    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Check if this is a unique violation error
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Parse a tokio_postgres error into a more specific OrmError, classifying by SQLSTATE
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let constraint = db_err.constraint().unwrap_or("unknown");
            let message = db_err.message();

            match db_err.code().code() {
                "23505" => return Self::UniqueViolation(format!("{constraint}: {message}")),
                "23503" => {
                    return Self::ForeignKeyViolation(format!("{constraint}: {message}"));
                }
                "23514" => return Self::CheckViolation(format!("{constraint}: {message}")),
                _ => {}
            }
        }
        Self::BackendError(err)
    }
}

#[cfg(feature = "pool")]
impl From<deadpool_postgres::PoolError> for OrmError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violation_carries_message() {
        let e = OrmError::InvariantViolation("insert returned 0 rows for 1 input".into());
        assert_eq!(
            e.to_string(),
            "invariant violation: insert returned 0 rows for 1 input"
        );
    }

    #[test]
    fn predicates_match_variant() {
        assert!(OrmError::not_found("x").is_not_found());
        assert!(OrmError::UniqueViolation("x".into()).is_unique_violation());
        assert!(!OrmError::NoPrimaryKey("Post").is_not_found());
    }
}
