//! Error types for the persona runtime.

use std::time::Duration;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing {platform} credentials for agent {agent}: set {vars}")]
    MissingCredentials {
        agent: String,
        platform: String,
        vars: String,
    },

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

    #[error("Missing required fields for {entity}: {fields}")]
    MissingFields { entity: String, fields: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Platform connection (login / handshake) errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Login to {platform} failed for {agent}: {reason}")]
    LoginFailed {
        agent: String,
        platform: String,
        reason: String,
    },

    #[error("Disconnect from {platform} failed for {agent}: {reason}")]
    DisconnectFailed {
        agent: String,
        platform: String,
        reason: String,
    },
}

/// Content generation errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Character {character} has nothing to generate from: {reason}")]
    EmptyInput { character: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by platform SDK calls other than connecting.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Failed to send on {platform}: {reason}")]
    SendFailed { platform: String, reason: String },

    #[error("Failed to fetch from {platform}: {reason}")]
    FetchFailed { platform: String, reason: String },

    #[error("{platform} is not connected")]
    NotConnected { platform: String },

    #[error("{platform} does not support {operation}")]
    Unsupported { platform: String, operation: String },
}

/// Embedding provider / index errors.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Invalid embedding response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding storage failed: {0}")]
    Storage(#[from] DatabaseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Schedule arming errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Lower bound cannot be greater than upper bound ({lower_ms}ms > {upper_ms}ms)")]
    InvalidBounds { lower_ms: u64, upper_ms: u64 },
}

/// Control-surface errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Agent {name} not found")]
    AgentNotFound { name: String },

    #[error("Platform {platform} is not supported")]
    UnsupportedPlatform { platform: String },

    #[error("Mode {mode} is already running for {agent}")]
    ModeAlreadyActive { agent: String, mode: String },

    #[error("Runtime is shutting down")]
    ShuttingDown,
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
