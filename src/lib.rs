//! # Entity Relay
//!
//! Cache-coherence and replication for typed entities across a fleet of nodes
//! that share one cache and one pub/sub bus. Exactly one node, the receiver,
//! owns the durable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              entity-relay                                │
//! │                                                                          │
//! │  ┌───────────────────┐ publish ┌──────────┐ subscribe ┌───────────────┐  │
//! │  │ ReplicaRepository │────────►│   Bus    │──────────►│ InboundQueue  │  │
//! │  └─────────┬─────────┘         └──────────┘           └───────┬───────┘  │
//! │            ▼                                                  ▼          │
//! │  ┌───────────────────┐  get/set/scan   ┌───────┐      ┌───────────────┐  │
//! │  │  CacheRepository  │────────────────►│ Cache │◄─────│ dispatch loop │  │
//! │  └─────────┬─────────┘                 └───────┘      └───────────────┘  │
//! │            │ pending writes (receiver only)                              │
//! │            ▼                                                             │
//! │  ┌───────────────────┐  flush loop   ┌──────────────┐                    │
//! │  │   StoreGateway    │──────────────►│ DurableStore │                    │
//! │  └───────────────────┘               │  (SQLite)    │                    │
//! │                                      └──────────────┘                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Roles
//!
//! - **Receiver**: allocates identifiers, queues writes, flushes them to the store.
//! - **Non-receiver**: reads and writes the cache and publishes mutations; it can
//!   only save entities that already carry an id.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entity_relay::{FlushCoordinator, RelayConfig, RelayContext, ReplicaRepository};
//!
//! let ctx = RelayContext::connect(RelayConfig::for_testing("node-a", true)).await?;
//! let users = ReplicaRepository::<User>::new(&ctx).await?;
//!
//! let mut coordinator = FlushCoordinator::new(ctx.clone());
//! coordinator.start().await?;
//!
//! let alice = users.save(User::new("alice")).await?;
//! assert!(users.find_by_id(&alice.id.unwrap()).await?.is_some());
//!
//! coordinator.shutdown().await;
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod registry;
pub mod repository;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use cache::{CacheStore, MemoryBus, MemoryCache, MessageBus, RedisCache};
pub use codec::{CacheRecord, RelationResolver};
pub use config::{CacheConfig, DispatchConfig, FlushConfig, RelayConfig, RelaySettings, StoreConfig};
pub use context::RelayContext;
pub use coordinator::{CoordinatorState, FlushCoordinator, HealthCheck};
pub use entity::{Entity, EntityId, EntitySchema, Field, IdStrategy, ScalarType};
pub use envelope::{MutationEnvelope, MutationKind};
pub use error::{RelayError, Result};
pub use gateway::StoreGateway;
pub use registry::{RepositoryRef, RepositoryRegistry};
pub use repository::{CacheRepository, DeadLetter, FlushReport, ReplicaRepository};
pub use store::{DurableStore, MemoryStore, SqliteStore, StoreTable};
