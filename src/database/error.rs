use thiserror::Error;

/// What went wrong at the persistence boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    UniqueViolation { constraint: String },
    ConnectionFailed { message: String },
    /// Stored value could not be mapped back into a domain type.
    Decode { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{}", self.describe())]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: String::new(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::ConnectionFailed {
                    message: err.to_string(),
                }
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DatabaseErrorKind::UniqueViolation {
                    constraint: db.constraint().unwrap_or_default().to_string(),
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseErrorKind::Decode {
                    message: err.to_string(),
                }
            }
            _ => DatabaseErrorKind::Unknown {
                message: err.to_string(),
            },
        };
        Self { kind }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Decode {
            message: message.into(),
        })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::ConnectionFailed { .. })
    }

    fn describe(&self) -> String {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => format!("{} not found: {}", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => {
                format!("unique constraint violated: {}", constraint)
            }
            DatabaseErrorKind::ConnectionFailed { message } => {
                format!("database connection failed: {}", message)
            }
            DatabaseErrorKind::Decode { message } => format!("failed to decode row: {}", message),
            DatabaseErrorKind::Unknown { message } => format!("database error: {}", message),
        }
    }
}

impl From<DatabaseError> for crate::error::AppError {
    fn from(err: DatabaseError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable: err.is_retryable(),
        }))
    }
}
