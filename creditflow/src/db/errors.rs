use thiserror::Error;

/// Unified error type for store operations that application code can handle
#[derive(Error, Debug)]
pub enum DbError {
    /// Entity not found by the given identifier
    #[error("Entity not found")]
    NotFound,

    /// Unique constraint violation
    #[error("Unique constraint violation")]
    UniqueViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    /// Check constraint violation (e.g. a balance that would go negative)
    #[error("Check constraint violation")]
    CheckViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    /// Connection loss, pool exhaustion, serialization failure or deadlock. Safe to retry.
    #[error("Transient database error: {0}")]
    Transient(String),

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    /// Whether the failed operation may succeed if attempted again unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Transient(_))
    }
}

impl crate::retry::Transient for DbError {
    fn is_transient(&self) -> bool {
        DbError::is_transient(self)
    }
}

/// Convert from sqlx::Error using proper sqlx error categorization
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    DbError::UniqueViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        table: db_err.table().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_check_violation() {
                    DbError::CheckViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        table: db_err.table().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                    // serialization_failure, deadlock_detected
                    DbError::Transient(db_err.message().to_string())
                } else {
                    DbError::Other(anyhow::anyhow!(err))
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
                DbError::Transient(err.to_string())
            }
            _ => DbError::Other(anyhow::anyhow!(err)),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(DbError::Transient("connection reset".to_string()).is_transient());
        assert!(!DbError::NotFound.is_transient());
        assert!(
            !DbError::UniqueViolation {
                constraint: None,
                table: None,
                message: "duplicate".to_string(),
            }
            .is_transient()
        );
        assert!(!DbError::Other(anyhow::anyhow!("boom")).is_transient());
    }
}
