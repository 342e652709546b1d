//! Storage error shared by the read model and checkpoint stores.

use thiserror::Error;

/// Failure of a read-model or checkpoint storage operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Transient infrastructure failure; callers may retry with backoff.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be interpreted (bad row shape, out-of-range value).
    #[error("storage corrupt: {0}")]
    Corrupt(String),

    /// The database refused the statement (constraint, missing table, bad SQL).
    /// Retrying does not help.
    #[error("storage rejected: {0}")]
    Rejected(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    pub(crate) fn poisoned() -> Self {
        StorageError::Unavailable("lock poisoned".to_string())
    }
}

/// Map a sqlx error from `operation` into a [`StorageError`].
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code();
            from_sqlstate(operation, code.as_deref(), db_err.message())
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StorageError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => {
            StorageError::Corrupt(format!("{operation}: {err}"))
        }
        other => StorageError::Unavailable(format!("{operation}: {other}")),
    }
}

/// Classify a database error by SQLSTATE class.
pub(crate) fn from_sqlstate(operation: &str, code: Option<&str>, message: &str) -> StorageError {
    let msg = format!("{operation}: {message} (SQLSTATE {})", code.unwrap_or("?"));
    match code.and_then(|c| c.get(..2)) {
        // connection, transaction rollback, resources, operator intervention
        Some("08") | Some("40") | Some("53") | Some("57") => StorageError::Unavailable(msg),
        Some("XX") => StorageError::Corrupt(msg),
        _ => StorageError::Rejected(msg),
    }
}

/// Convert a stored BIGINT into an unsigned counter.
pub(crate) fn non_negative(column: &str, value: i64) -> Result<u64, StorageError> {
    u64::try_from(value)
        .map_err(|_| StorageError::Corrupt(format!("{column} is negative: {value}")))
}
