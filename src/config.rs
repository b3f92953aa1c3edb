// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the relay.
//!
//! Configuration is passed to [`RelayContext::builder()`](crate::RelayContext::builder)
//! or [`RelayContext::connect()`](crate::RelayContext::connect) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use entity_relay::config::RelayConfig;
//!
//! let config = RelayConfig {
//!     node_id: "node-1".into(),
//!     receiver: true,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── node_id: String              # This node's unique ID (envelope origin)
//! ├── receiver: bool               # Sole durable writer?
//! ├── settings: RelaySettings
//! │   ├── flush: FlushConfig       # Pending-write drain loop
//! │   ├── dispatch: DispatchConfig # Inbound action loop
//! │   ├── codec: CodecConfig       # Relationship resolution
//! │   └── workers: WorkerConfig    # Async gateway worker pool
//! ├── cache: CacheConfig           # Redis
//! └── store: StoreConfig           # SQLite
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "game.node.lobby-1"
//! receiver: true
//!
//! settings:
//!   flush:
//!     interval: "200ms"
//!     max_attempts: 5
//!   codec:
//!     max_depth: 8
//!
//! cache:
//!   redis_url: "redis://cache:6379"
//!   entry_ttl: "1h"
//!
//! store:
//!   sqlite_path: "/var/lib/app/entities.db"
//! ```

use crate::error::{RelayError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for one relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Identity of this node. Stamped on every published envelope so the
    /// node can ignore its own echoes.
    pub node_id: String,

    /// Whether this node is the receiver (the only durable writer).
    #[serde(default)]
    pub receiver: bool,

    /// Tunables for the background loops and codec.
    #[serde(default)]
    pub settings: RelaySettings,

    /// Shared cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Durable store settings (used by the receiver, optional elsewhere).
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.node.default".to_string(),
            receiver: false,
            settings: RelaySettings::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Create a minimal config for testing with fast loops.
    pub fn for_testing(node_id: &str, receiver: bool) -> Self {
        Self {
            node_id: node_id.to_string(),
            receiver,
            settings: RelaySettings::for_testing(),
            cache: CacheConfig::default(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(RelayError::Config("node_id must not be empty".to_string()));
        }
        if self.settings.flush.max_attempts == 0 {
            return Err(RelayError::Config(
                "settings.flush.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.settings.codec.max_depth == 0 {
            return Err(RelayError::Config(
                "settings.codec.max_depth must be at least 1".to_string(),
            ));
        }
        if self.settings.workers.max_concurrent == 0 {
            return Err(RelayError::Config(
                "settings.workers.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(RelayError::Config(
                "store.max_connections must be at least 1".to_string(),
            ));
        }
        check_interval("settings.flush.interval", &self.settings.flush.interval)?;
        check_interval("settings.flush.shutdown_grace", &self.settings.flush.shutdown_grace)?;
        check_interval("settings.dispatch.interval", &self.settings.dispatch.interval)?;
        Ok(())
    }
}

/// A loop interval or grace period must parse and be non-zero.
fn check_interval(field: &str, value: &str) -> Result<()> {
    match humantime::parse_duration(value) {
        Ok(d) if d.is_zero() => Err(RelayError::Config(format!("{} must be greater than zero", field))),
        Ok(_) => Ok(()),
        Err(e) => Err(RelayError::Config(format!("{}: invalid duration {:?}: {}", field, value, e))),
    }
}

/// Parse a duration, falling back to `default` (with a warning) when the
/// value is unparseable or zero.
fn duration_or(field: &'static str, value: &str, default: Duration) -> Duration {
    match humantime::parse_duration(value) {
        Ok(d) if !d.is_zero() => d,
        _ => {
            warn!(
                field,
                value,
                default_ms = default.as_millis() as u64,
                "Invalid duration, using default"
            );
            default
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RelaySettings: loop and codec tunables
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the relay logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelaySettings {
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
}

impl RelaySettings {
    /// Settings with short intervals and a small retry budget.
    pub fn for_testing() -> Self {
        Self {
            flush: FlushConfig {
                interval: "20ms".to_string(),
                max_attempts: 3,
                retry_base_ms: 5,
                retry_max_ms: 50,
                dead_letter_capacity: 100,
                shutdown_grace: "2s".to_string(),
            },
            dispatch: DispatchConfig {
                interval: "20ms".to_string(),
                on_non_receiver: true,
            },
            codec: CodecConfig::default(),
            workers: WorkerConfig { max_concurrent: 4 },
        }
    }
}

/// Flush loop configuration (receiver only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// How often pending writes are drained into the store.
    #[serde(default = "default_loop_interval")]
    pub interval: String,

    /// Attempts per pending write before it is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay after a failed write (milliseconds).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Ceiling for the retry delay (milliseconds).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Dead letters kept per repository before the oldest is dropped.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// How long shutdown waits for the loops before aborting them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

fn default_loop_interval() -> String {
    "200ms".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_shutdown_grace() -> String {
    "10s".to_string()
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_loop_interval(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            dead_letter_capacity: default_dead_letter_capacity(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl FlushConfig {
    /// Parse the interval string to a Duration.
    pub fn interval_duration(&self) -> Duration {
        duration_or("settings.flush.interval", &self.interval, Duration::from_millis(200))
    }

    /// Parse the shutdown grace string to a Duration.
    pub fn shutdown_grace_duration(&self) -> Duration {
        duration_or("settings.flush.shutdown_grace", &self.shutdown_grace, Duration::from_secs(10))
    }

    /// Backoff schedule for failed writes and cache outages.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts as usize,
            initial_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// Dispatch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How often the inbound action queue is drained.
    #[serde(default = "default_loop_interval")]
    pub interval: String,

    /// Run the dispatch loop on non-receivers too, so peers with their own
    /// cache converge on published mutations.
    #[serde(default = "default_true")]
    pub on_non_receiver: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: default_loop_interval(),
            on_non_receiver: true,
        }
    }
}

impl DispatchConfig {
    /// Parse the interval string to a Duration.
    pub fn interval_duration(&self) -> Duration {
        duration_or("settings.dispatch.interval", &self.interval, Duration::from_millis(200))
    }
}

/// Codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Maximum relationship depth resolved when decoding one entity.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_depth() -> usize {
    8
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

/// Worker pool for the async gateway variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    16
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CacheConfig: Redis
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis URL, e.g. `"redis://cache:6379"`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Optional expiry for every cache entry written by a repository.
    /// `None` keeps entries until they are deleted.
    #[serde(default)]
    pub entry_ttl: Option<String>,

    /// Clear the whole cache when a receiver starts.
    #[serde(default)]
    pub flush_on_start: bool,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            entry_ttl: None,
            flush_on_start: false,
        }
    }
}

impl CacheConfig {
    /// Parse the entry TTL. An unparseable value disables expiry.
    pub fn entry_ttl_duration(&self) -> Option<Duration> {
        self.entry_ttl
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .filter(|d| !d.is_zero())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database. `":memory:"` opens a private in-memory database.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Use WAL journaling.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_sqlite_path() -> String {
    "entity_relay.db".to_string()
}

fn default_max_connections() -> u32 {
    6
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            max_connections: default_max_connections(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// In-memory database for tests.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
        }
    }

    /// Whether this config points at a private in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}
