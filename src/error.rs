//! Error handling module
//!
//! Provides the unified error type for the entity runtime and its PostgreSQL backend.

use thiserror::Error;

/// Runtime-wide error type
#[derive(Error, Debug)]
pub enum OrmError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Metadata lookup miss. Automigration treats this as "table does not exist".
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection not established: {0}")]
    NotConnected(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrmError {
    /// True for the "table/record does not exist" kind
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrmError::NotFound(_))
    }
}

/// Result type alias for runtime operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> OrmError {
    OrmError::NotFound(msg.into())
}

/// Helper function to create a configuration error
pub fn configuration_error(msg: impl Into<String>) -> OrmError {
    OrmError::Configuration(msg.into())
}

/// Helper function to create a transport error
pub fn transport_error(msg: impl Into<String>) -> OrmError {
    OrmError::Transport(msg.into())
}
