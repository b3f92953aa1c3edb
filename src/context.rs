// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay context.
//!
//! Everything a node shares between its repositories and background loops:
//! configuration, cache and bus handles, the optional durable store, the
//! repository registry, the inbound action queue, the worker bulkhead and
//! the shutdown signal. Built once per process and passed around as an
//! `Arc<RelayContext>`.
//!
//! ```rust,ignore
//! let ctx = RelayContext::connect(config).await?;
//! let users = ReplicaRepository::<User>::new(&ctx).await?;
//! let mut coordinator = FlushCoordinator::new(Arc::clone(&ctx));
//! coordinator.start().await?;
//! ```

use crate::cache::{CacheStore, MessageBus, RedisCache};
use crate::config::RelayConfig;
use crate::coordinator::InboundQueue;
use crate::error::{RelayError, Result};
use crate::registry::RepositoryRegistry;
use crate::resilience::{Bulkhead, RetryConfig};
use crate::store::{DurableStore, SqliteStore};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shared process context for one relay node.
pub struct RelayContext {
    config: RelayConfig,
    cache: Arc<dyn CacheStore>,
    bus: Arc<dyn MessageBus>,
    store: Option<Arc<dyn DurableStore>>,
    registry: Arc<RepositoryRegistry>,
    inbound: Arc<InboundQueue>,
    workers: Arc<Bulkhead>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayContext {
    pub fn builder(config: RelayConfig) -> RelayContextBuilder {
        RelayContextBuilder {
            config,
            cache: None,
            bus: None,
            store: None,
        }
    }

    /// Build a context over Redis (cache and bus) and, on the receiver,
    /// SQLite.
    pub async fn connect(config: RelayConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let redis = Arc::new(RedisCache::connect(&config.cache, &RetryConfig::startup()).await?);

        let store: Option<Arc<dyn DurableStore>> = if config.receiver {
            Some(Arc::new(SqliteStore::open(&config.store).await?))
        } else {
            None
        };

        if config.receiver && config.cache.flush_on_start {
            warn!(node_id = %config.node_id, "Clearing cache on receiver start");
            redis.flush_all().await?;
        }

        let mut builder = Self::builder(config).cache(redis.clone()).bus(redis);
        if let Some(store) = store {
            builder = builder.store(store);
        }
        builder.build()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn is_receiver(&self) -> bool {
        self.config.receiver
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Durable store, if this node has one.
    pub fn store(&self) -> Option<&Arc<dyn DurableStore>> {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &Arc<RepositoryRegistry> {
        &self.registry
    }

    pub fn inbound(&self) -> &Arc<InboundQueue> {
        &self.inbound
    }

    /// Worker pool for the async gateway variants.
    pub fn workers(&self) -> &Arc<Bulkhead> {
        &self.workers
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Tell every loop and subscription task to stop.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Builder for [`RelayContext`] over arbitrary backends.
pub struct RelayContextBuilder {
    config: RelayConfig,
    cache: Option<Arc<dyn CacheStore>>,
    bus: Option<Arc<dyn MessageBus>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl RelayContextBuilder {
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Arc<RelayContext>> {
        self.config.validate()?;

        let cache = self
            .cache
            .ok_or_else(|| RelayError::Config("a cache backend is required".to_string()))?;
        let bus = self
            .bus
            .ok_or_else(|| RelayError::Config("a message bus is required".to_string()))?;
        if self.config.receiver && self.store.is_none() {
            return Err(RelayError::Config(
                "the receiver needs a durable store".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = Arc::new(Bulkhead::new(self.config.settings.workers.max_concurrent));

        info!(
            node_id = %self.config.node_id,
            receiver = self.config.receiver,
            has_store = self.store.is_some(),
            "Relay context ready"
        );

        Ok(Arc::new(RelayContext {
            config: self.config,
            cache,
            bus,
            store: self.store,
            registry: Arc::new(RepositoryRegistry::new()),
            inbound: Arc::new(InboundQueue::new()),
            workers,
            shutdown_tx,
            shutdown_rx,
        }))
    }
}
