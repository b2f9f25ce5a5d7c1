/// Error types for payment-service
use domain_events::{EventError, PersistenceError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Persistence error: {0}")]
    Persistence(PersistenceError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored row that does not map onto the domain model.
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// A missing row reads the same from the in-memory tables as from Postgres.
impl From<PersistenceError> for ServiceError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound { schema, id } => {
                ServiceError::NotFound(format!("{} row {}", schema, id))
            }
            other => ServiceError::Persistence(other),
        }
    }
}
