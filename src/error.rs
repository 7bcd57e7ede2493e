//! Error types for Delivery Notify.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the dispatch core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Survey error: {0}")]
    Survey(#[from] SurveyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
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

/// Errors from outbound collaborators (chat gateway, order-data provider).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// LLM provider errors.
///
/// Rate limiting and quota exhaustion are kept apart from generic failures so
/// callers can tell the customer "try later" versus "contact support".
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} quota exceeded: {reason}")]
    QuotaExceeded { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Send-run errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Run {id} not found")]
    RunNotFound { id: Uuid },

    #[error("Send record {id} not found")]
    RecordNotFound { id: Uuid },

    #[error("Run has no recipients")]
    EmptyRecipients,

    #[error("Message template is empty")]
    EmptyTemplate,

    #[error("Order source is not configured")]
    NoOrderSource,
}

/// Survey lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SurveyError {
    #[error("Survey {id} cannot go from {from} on {event}")]
    InvalidTransition {
        id: Uuid,
        from: String,
        event: String,
    },

    #[error("Survey {id} not found")]
    NotFound { id: Uuid },

    #[error("Send record {send_record_id} already has survey {survey_id} ({status})")]
    AlreadyExists {
        send_record_id: Uuid,
        survey_id: Uuid,
        status: String,
    },

    #[error("Send record {send_record_id} cannot receive a survey: {reason}")]
    NotDispatchable { send_record_id: Uuid, reason: String },

    #[error("Recipient {phone} is blacklisted")]
    Blacklisted { phone: String },
}

/// Result type alias for the dispatch core.
pub type Result<T> = std::result::Result<T, Error>;
