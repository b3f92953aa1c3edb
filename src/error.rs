// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the relay.
//!
//! Errors are categorized by their source (cache, durable store, codec, etc.)
//! and carry enough context to find the failing operation in the logs.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Cache` | Yes | Redis timeouts, dropped connections, pub/sub failures |
//! | `Store` | Yes | SQL errors surfaced by sqlx (pool timeouts, busy database) |
//! | `StoreUnavailable` | Yes | Durable store offline or not attached |
//! | `Codec` | No | Entity could not be encoded or decoded |
//! | `EnvelopeParse` | No | Malformed mutation payload on the bus |
//! | `InvalidQuery` | No | Filter on a field that cannot be filtered |
//! | `NotAuthoritative` | No | Non-receiver tried to create an identifier |
//! | `MissingId` | No | Operation needs an identifier the entity lacks |
//! | `UnknownRepository` | No | No live repository under that name |
//! | `DuplicateRepository` | No | Repository name already registered |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Coordinator state machine violation |
//! | `WorkerPool` | No | Async operation could not obtain a worker |
//! | `Shutdown` | No | Relay is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The flush loop uses [`RelayError::is_retryable()`] to decide whether a
//! failed durable write goes back on the pending queue or to the dead-letter
//! log. Direct repository calls never retry; they hand the error to the caller.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Boxed future used at the object-safe trait seams (store, cache, registry).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while relaying entities.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Redis connection or command error.
    ///
    /// Covers key-value commands and pub/sub alike. Typically transient.
    #[error("Cache error ({operation}): {message}")]
    Cache {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQL error from the durable store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Durable store offline, or no store attached to this node.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Encode/decode failure between an entity and its cache record.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Mutation payload received from the bus could not be parsed.
    #[error("Envelope parse error: {0}")]
    EnvelopeParse(String),

    /// Filter on a field that is unknown or not filterable.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A non-receiver attempted to persist an entity without an identifier.
    ///
    /// Only the receiver may allocate identifiers. Nothing was written.
    #[error("Node is not authoritative for new {entity_type} identifiers")]
    NotAuthoritative { entity_type: String },

    /// The entity has no identifier but the operation needs one.
    #[error("{entity_type} has no identifier")]
    MissingId { entity_type: String },

    /// No live repository registered under this name.
    #[error("Unknown repository: {0}")]
    UnknownRepository(String),

    /// A repository with this name is already registered.
    #[error("Repository already registered: {0}")]
    DuplicateRepository(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Coordinator state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running coordinator).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Async gateway operation could not get a worker slot.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a cache error from a redis::RedisError
    pub fn cache(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Cache {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a cache error without source
    pub fn cache_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cache {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a codec error
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cache { .. } => true,
            Self::Store(_) => true,
            Self::StoreUnavailable(_) => true,
            Self::Codec(_) => false, // Same bytes fail the same way next time
            Self::EnvelopeParse(_) => false,
            Self::InvalidQuery(_) => false,
            Self::NotAuthoritative { .. } => false,
            Self::MissingId { .. } => false,
            Self::UnknownRepository(_) => false,
            Self::DuplicateRepository(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::WorkerPool(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        Self::cache("unknown", e)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
