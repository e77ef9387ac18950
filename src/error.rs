//! Error types for the job tracker.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
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

    /// A uniqueness constraint rejected the write. The transaction was rolled back.
    #[error("Conflict on {entity}: {detail}")]
    Conflict { entity: String, detail: String },

    /// Another email with the same content fingerprint is already processed.
    #[error("Email content already processed as {original}")]
    DuplicateContent { original: Uuid },

    #[error("Migration failed: {0}")]
    Migration(String),

    /// A stored value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Mail fetch failed: {0}")]
    Fetch(String),

    #[error("Mail fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error("A sync is already running for user {user_id}")]
    SyncInProgress { user_id: String },

    #[error("Review item {id} not found")]
    ReviewNotFound { id: Uuid },

    #[error("Review item {id} was already resolved")]
    ReviewAlreadyResolved { id: Uuid },

    #[error("Invalid review decision: {0}")]
    InvalidReview(String),

    #[error("Application {id} not found")]
    ApplicationNotFound { id: Uuid },

    #[error("Application identity conflict could not be resolved: {0}")]
    UnresolvedConflict(String),
}
