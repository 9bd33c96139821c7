use thiserror::Error;

use crate::db::reconcile::ReconcileMismatch;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(tokio_rusqlite::Error),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tag reconciliation mismatch: expected {expected} rows, found {found}")]
    Inconsistent { expected: usize, found: usize },

    #[error("Repository is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Errors after which the store's guarantees can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Inconsistent { .. })
    }
}

impl From<tokio_rusqlite::Error> for AppError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(code, msg))
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Constraint(msg.unwrap_or_else(|| code.to_string()))
            }
            tokio_rusqlite::Error::Other(boxed) => match boxed.downcast::<ReconcileMismatch>() {
                Ok(mismatch) => AppError::Inconsistent {
                    expected: mismatch.expected,
                    found: mismatch.found,
                },
                Err(other) => AppError::Database(tokio_rusqlite::Error::Other(other)),
            },
            other => AppError::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
