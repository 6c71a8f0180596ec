//! Error types for the onboarding engine.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Onboarding error: {0}")]
    Onboarding(#[from] OnboardingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libsql error raised by `op`.
    ///
    /// Unique and foreign key violations become `Constraint` so callers can
    /// tell them apart from transport failures.
    pub fn from_libsql(op: &str, err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("UNIQUE constraint failed")
            || message.contains("FOREIGN KEY constraint failed")
        {
            Self::Constraint(format!("{op}: {message}"))
        } else {
            Self::Query(format!("{op}: {message}"))
        }
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// Onboarding validation and lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("Step {key} has no panel action and cannot be attached to an onboarding")]
    MissingAction { key: String },

    #[error("An onboarding with route {route} already exists")]
    DuplicateRoute { route: String },

    #[error("A step with key {key} already exists")]
    DuplicateStepKey { key: String },

    #[error("Step {0} not found")]
    StepNotFound(String),

    #[error("Onboarding {0} not found")]
    OnboardingNotFound(String),

    #[error("Onboarding progress {id} not found")]
    ProgressNotFound { id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
