use thiserror::Error;

use crate::validation::ValidationErrors;

/// Enumeration of database-related errors raised by the `EventStore`.
/// Errors originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

impl DatabaseError {
    pub fn sqlx_error(&self) -> &sqlx::Error {
        match self {
            DatabaseError::PoolCreationError { error }
            | DatabaseError::ConnectionError { error }
            | DatabaseError::QueryError { error, .. }
            | DatabaseError::TransactionError { error, .. } => error,
        }
    }

    /// The SQLSTATE reported by PostgreSQL, if the error came from the server.
    pub fn code(&self) -> Option<String> {
        match self.sqlx_error() {
            sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
            _ => None,
        }
    }

    /// True if an INSERT lost a race against a concurrent transaction on the same key.
    pub fn is_unique_violation(&self) -> bool {
        self.code().as_deref() == Some(UNIQUE_VIOLATION)
    }

    /// True if re-running the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code().as_deref().is_some_and(is_retryable_sqlstate)
    }
}

// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Concurrency conflicts between transactions touching the same `sg_event_id`.
/// A unique violation is included: the losing transaction will see the winner's row as a
/// duplicate when it runs again.
pub fn is_retryable_sqlstate(code: &str) -> bool {
    matches!(code, UNIQUE_VIOLATION | SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
}

/// Error returned to callers of `Ingestor::ingest`.
/// Per-event persistence failures are not errors of the batch; they are reported in the
/// `IngestReport`.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed webhook payload: {0}")]
    Validation(#[from] ValidationErrors),
}
