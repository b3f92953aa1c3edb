// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixture entities and in-memory nodes.

use entity_relay::config::RelayConfig;
use entity_relay::entity::{Entity, EntitySchema, Field, ScalarType};
use entity_relay::{FlushCoordinator, MemoryBus, MemoryCache, MemoryStore, RelayContext};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rank {
    pub id: Option<i64>,
    pub name: String,
    pub power: i32,
}

impl Rank {
    pub fn new(id: Option<i64>, name: &str, power: i32) -> Self {
        Self {
            id,
            name: name.to_string(),
            power,
        }
    }
}

impl Entity for Rank {
    type Id = i64;

    fn schema() -> &'static EntitySchema {
        static SCHEMA: EntitySchema = EntitySchema::new(
            "Rank",
            &[
                Field::scalar("name", ScalarType::Text),
                Field::scalar("power", ScalarType::Integer),
            ],
        );
        &SCHEMA
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

/// Friends reference each other through `buddies`, which makes cycles easy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Friend {
    pub id: Option<Uuid>,
    pub name: String,
    pub level: i32,
    pub buddies: Vec<Friend>,
}

impl Friend {
    pub fn new(name: &str, level: i32) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            name: name.to_string(),
            level,
            buddies: Vec::new(),
        }
    }
}

impl Entity for Friend {
    type Id = Uuid;

    fn schema() -> &'static EntitySchema {
        static SCHEMA: EntitySchema = EntitySchema::new(
            "Friend",
            &[
                Field::scalar("name", ScalarType::Text),
                Field::scalar("level", ScalarType::Integer),
                Field::to_set("buddies", "friends"),
            ],
        );
        &SCHEMA
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn set_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: Option<Uuid>,
    pub username: String,
    pub password: String,
    pub rank: Option<Rank>,
    pub friends: Vec<Friend>,
}

impl User {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: format!("{}-secret", username),
            ..Self::default()
        }
    }

    pub fn with_id(mut self) -> Self {
        self.id = Some(Uuid::new_v4());
        self
    }
}

impl Entity for User {
    type Id = Uuid;

    fn schema() -> &'static EntitySchema {
        static SCHEMA: EntitySchema = EntitySchema::new(
            "User",
            &[
                Field::scalar("username", ScalarType::Text),
                Field::scalar("password", ScalarType::Text),
                Field::to_one("rank", "ranks"),
                Field::to_many("friends", "friends"),
            ],
        );
        &SCHEMA
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn set_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }
}

/// String-keyed entity for replication scenarios.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Member {
    pub id: Option<String>,
    pub name: String,
}

impl Member {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: name.to_string(),
        }
    }
}

impl Entity for Member {
    type Id = String;

    fn schema() -> &'static EntitySchema {
        static SCHEMA: EntitySchema =
            EntitySchema::new("Member", &[Field::scalar("name", ScalarType::Text)]);
        &SCHEMA
    }

    fn id(&self) -> Option<String> {
        self.id.clone()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// One node over in-memory backends. Handles are kept for assertions.
pub struct TestNode {
    pub ctx: Arc<RelayContext>,
    pub cache: Arc<MemoryCache>,
    pub store: Option<Arc<MemoryStore>>,
}

impl TestNode {
    /// Receiver with its own cache and store.
    pub fn receiver(node_id: &str, bus: &MemoryBus) -> Self {
        Self::build(RelayConfig::for_testing(node_id, true), Arc::new(MemoryCache::new()), bus)
    }

    /// Non-receiver with its own cache.
    pub fn peer(node_id: &str, bus: &MemoryBus) -> Self {
        Self::build(RelayConfig::for_testing(node_id, false), Arc::new(MemoryCache::new()), bus)
    }

    /// Non-receiver sharing `cache` with another node.
    pub fn peer_sharing(node_id: &str, cache: &Arc<MemoryCache>, bus: &MemoryBus) -> Self {
        Self::build(RelayConfig::for_testing(node_id, false), Arc::clone(cache), bus)
    }

    pub fn build(config: RelayConfig, cache: Arc<MemoryCache>, bus: &MemoryBus) -> Self {
        let store = config.receiver.then(|| Arc::new(MemoryStore::new()));
        let mut builder = RelayContext::builder(config)
            .cache(cache.clone())
            .bus(Arc::new(bus.clone()));
        if let Some(store) = &store {
            builder = builder.store(store.clone());
        }
        Self {
            ctx: builder.build().unwrap(),
            cache,
            store,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        self.store.as_ref().expect("node has no store")
    }

    pub fn coordinator(&self) -> FlushCoordinator {
        FlushCoordinator::new(Arc::clone(&self.ctx))
    }
}

/// Let spawned subscription tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
