// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache repository: read-through / write-through over the store gateway.
//!
//! # Write Path
//!
//! ```text
//! save(e) ──► cache SET <Type>:<id> ──► (receiver) pending.push_back(SAVE e)
//!                                                  │
//!                       flush loop ◄───────────────┘
//!                           │ FIFO
//!                           ▼
//!                     gateway.save / gateway.delete
//! ```
//!
//! Only the receiver has a gateway and a pending queue. A non-receiver
//! writes the cache and nothing else, and refuses to create identifiers.
//!
//! # Read Path
//!
//! `find_by_id` reads `<Type>:<id>` and falls back to the store on a miss
//! (populating the cache). Filters scan every cached record of the type and
//! fall back to the store when nothing matches.
//!
//! An id deleted on the receiver is tombstoned until its durable delete
//! lands. Store fallbacks skip tombstoned ids, so the row the store still
//! holds is never copied back into the cache.
//!
//! # Flush Failures
//!
//! A failed retryable write goes back to the head of the queue, followed by
//! every write drained after it, and the repository holds off until the
//! backoff delay for that write has passed. Writes that exhaust
//! `settings.flush.max_attempts`, or fail with a non-retryable error, move to
//! the bounded dead-letter log. A dead-lettered delete keeps its tombstone.
//!
//! # Remote Mutations
//!
//! On the receiver a remote mutation is written to the store under the
//! drain lock, and queued local writes for the same id are dropped first.
//! A stale local write can never land after the newer remote one.

use super::pending::{DeadLetter, DeadLetterLog, FlushReport, PendingWrite};
use crate::codec::{self, CacheRecord, ResolveContext};
use crate::context::RelayContext;
use crate::entity::{Entity, EntityId};
use crate::envelope::{MutationEnvelope, MutationKind};
use crate::error::{BoxFuture, RelayError, Result};
use crate::gateway::StoreGateway;
use crate::metrics;
use crate::registry::RepositoryRef;
use crate::resilience::RetryConfig;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Cached, write-behind repository for entity type `T`.
pub struct CacheRepository<T: Entity> {
    ctx: Arc<RelayContext>,
    name: String,
    gateway: Option<StoreGateway<T>>,
    pending: Mutex<VecDeque<PendingWrite<T>>>,
    /// Held for the duration of one drain.
    flush_lock: Mutex<()>,
    /// No drain before this instant (set after a failed write).
    retry_after: std::sync::Mutex<Option<Instant>>,
    dead_letters: std::sync::Mutex<DeadLetterLog>,
    /// Ids deleted here whose durable delete has not landed yet.
    tombstones: std::sync::Mutex<HashSet<String>>,
    retry: RetryConfig,
    entry_ttl: Option<Duration>,
}

impl<T: Entity> CacheRepository<T> {
    /// Create and register the repository. On a node with a store, the
    /// table is created and the cache warmed from it.
    pub async fn new(ctx: &Arc<RelayContext>) -> Result<Arc<Self>> {
        let schema = T::schema();
        let config = ctx.config();

        let gateway = ctx.store().map(|store| {
            StoreGateway::new(
                Arc::clone(store),
                Arc::clone(ctx.registry()),
                Arc::clone(ctx.workers()),
                config.settings.codec.max_depth,
            )
        });

        let repo = Arc::new(Self {
            ctx: Arc::clone(ctx),
            name: schema.repository_name(),
            gateway,
            pending: Mutex::new(VecDeque::new()),
            flush_lock: Mutex::new(()),
            retry_after: std::sync::Mutex::new(None),
            dead_letters: std::sync::Mutex::new(DeadLetterLog::new(
                config.settings.flush.dead_letter_capacity,
            )),
            tombstones: std::sync::Mutex::new(HashSet::new()),
            retry: config.settings.flush.retry_config(),
            entry_ttl: config.cache.entry_ttl_duration(),
        });

        let erased: Arc<dyn RepositoryRef> = repo.clone();
        ctx.registry().register(&erased)?;

        if let Some(gateway) = &repo.gateway {
            gateway.ensure_table().await?;
            match repo.warm_cache().await {
                Ok(rows) => info!(repository = %repo.name, rows, "Cache warmed from store"),
                Err(e) => warn!(repository = %repo.name, error = %e, "Cache warm-up failed"),
            }
        }

        Ok(repo)
    }

    /// Registry name (`users`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store gateway, on nodes that have a store.
    pub fn gateway(&self) -> Option<&StoreGateway<T>> {
        self.gateway.as_ref()
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Cache key for an id key: `<TypeName>:<id>`.
    pub fn key(&self, id_key: &str) -> String {
        codec::node_key(T::schema().type_name, id_key)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `entity` to the cache and, on the receiver, queue the durable
    /// write. An entity without an id is inserted through the gateway first
    /// so it gets one; only the receiver may do that.
    pub async fn save(&self, mut entity: T) -> Result<T> {
        let type_name = T::schema().type_name;

        if entity.id().is_none() {
            if !self.ctx.is_receiver() {
                metrics::record_not_authoritative(type_name);
                warn!(entity_type = type_name, "Rejected save without id on non-receiver");
                return Err(RelayError::NotAuthoritative {
                    entity_type: type_name.to_string(),
                });
            }
            entity = self.require_gateway()?.save(entity).await?;
        }

        let id_key = self.id_key_of(&entity)?;
        let record = codec::encode(&entity)?;
        self.write_cache(&id_key, &record).await?;
        self.tombstone_guard().remove(&id_key);

        if self.ctx.is_receiver() {
            self.enqueue(PendingWrite::save(entity.clone())).await;
        }

        debug!(entity_type = type_name, id = %id_key, "Saved to cache");
        Ok(entity)
    }

    /// Remove `entity` from the cache and, on the receiver, queue the
    /// durable delete.
    pub async fn delete(&self, entity: &T) -> Result<()> {
        let id_key = self.id_key_of(entity)?;
        let receiver = self.ctx.is_receiver();

        // Tombstone first, so no read repopulates from the store in between
        if receiver {
            self.tombstone_guard().insert(id_key.clone());
        }
        if let Err(e) = self.ctx.cache().delete(&self.key(&id_key)).await {
            if receiver {
                self.tombstone_guard().remove(&id_key);
            }
            return Err(e);
        }

        if receiver {
            self.enqueue(PendingWrite::delete(entity.clone())).await;
        }

        debug!(entity_type = T::schema().type_name, id = %id_key, "Deleted from cache");
        Ok(())
    }

    /// Set a time-to-live on a cached entity. Returns whether it was cached.
    pub async fn expire(&self, id: &T::Id, ttl: Duration) -> Result<bool> {
        self.ctx.cache().expire(&self.key(&id.to_key()), ttl).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn find_by_id(&self, id: &T::Id) -> Result<Option<T>> {
        let type_name = T::schema().type_name;
        let id_key = id.to_key();

        if let Some(record) = self.read_cached(&id_key).await? {
            match self.decode(record).await {
                Ok(entity) => {
                    metrics::record_cache_lookup(type_name, true);
                    return Ok(Some(entity));
                }
                Err(e) => {
                    warn!(entity_type = type_name, id = %id_key, error = %e, "Undecodable cache entry, treating as miss");
                }
            }
        }
        metrics::record_cache_lookup(type_name, false);

        let Some(gateway) = &self.gateway else {
            return Ok(None);
        };
        if self.is_tombstoned(&id_key) {
            return Ok(None);
        }
        match gateway.find_record(&id_key).await? {
            Some(record) => {
                self.write_cache(&id_key, &record).await?;
                Ok(Some(self.decode(record).await?))
            }
            None => Ok(None),
        }
    }

    /// First entity whose `field` loosely equals `value`.
    pub async fn find_where(&self, field: &str, value: impl Into<Value>) -> Result<Option<T>> {
        let value = value.into();
        let mut matches = self.filter(field, &value, Some(1)).await?;
        Ok(matches.pop())
    }

    /// Every entity whose `field` loosely equals `value`.
    pub async fn find_all_where(&self, field: &str, value: impl Into<Value>) -> Result<Vec<T>> {
        let value = value.into();
        self.filter(field, &value, None).await
    }

    /// Every entity of the type: the cached set, or the store when the cache
    /// holds none.
    pub async fn all(&self) -> Result<Vec<T>> {
        let cached = self.cached_records().await?;
        if !cached.is_empty() {
            return Ok(self.decode_lenient(cached).await);
        }

        let Some(gateway) = &self.gateway else {
            return Ok(Vec::new());
        };
        let records = self.without_tombstoned(gateway.all_records().await?);
        self.populate(&records).await?;
        Ok(self.decode_lenient(records).await)
    }

    async fn filter(&self, field: &str, value: &Value, limit: Option<usize>) -> Result<Vec<T>> {
        let schema = T::schema();
        codec::storage_field(schema, field)?;
        let limit = limit.unwrap_or(usize::MAX);

        let cached = self.cached_records().await?;
        let scanned = cached.len();
        let mut found = Vec::new();
        for record in cached {
            if found.len() >= limit {
                break;
            }
            if !codec::field_matches(schema, &record, field, value) {
                continue;
            }
            match self.decode(record).await {
                Ok(entity) => found.push(entity),
                Err(e) => warn!(entity_type = schema.type_name, error = %e, "Skipping undecodable cache entry"),
            }
        }

        let fell_through = found.is_empty() && self.gateway.is_some();
        metrics::record_cache_scan(schema.type_name, scanned, fell_through);
        if !fell_through {
            return Ok(found);
        }

        let Some(gateway) = &self.gateway else {
            return Ok(found);
        };
        let stored_limit = (limit != usize::MAX).then_some(limit);
        let records = gateway.find_records_where(field, value.clone(), stored_limit).await?;
        let records = self.without_tombstoned(records);
        self.populate(&records).await?;
        let mut entities = Vec::with_capacity(records.len());
        for record in records {
            entities.push(self.decode(record).await?);
        }
        Ok(entities)
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Writes waiting for the flush loop.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_log().snapshot()
    }

    /// Remove and return every dead letter.
    pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_log().drain()
    }

    /// Drain the pending queue into the store, in FIFO order.
    pub async fn flush_updates(&self) -> Result<FlushReport> {
        let Ok(_drain) = self.flush_lock.try_lock() else {
            metrics::record_flush_skipped(&self.name, "busy");
            return Ok(FlushReport::skipped(&self.name));
        };

        let retry_after = *self.retry_guard();
        if let Some(deadline) = retry_after {
            if Instant::now() < deadline {
                metrics::record_flush_skipped(&self.name, "backoff");
                return Ok(FlushReport::skipped(&self.name));
            }
        }

        let mut report = FlushReport::new(&self.name);
        let Some(gateway) = &self.gateway else {
            return Ok(report);
        };

        let mut batch = std::mem::take(&mut *self.pending.lock().await);
        if batch.is_empty() {
            return Ok(report);
        }

        let start = std::time::Instant::now();
        let max_attempts = self.ctx.config().settings.flush.max_attempts;
        let mut backoff = None;
        let mut landed_deletes = Vec::new();

        while let Some(mut write) = batch.pop_front() {
            let result = match write.kind {
                MutationKind::Save => gateway.save(write.entity.clone()).await.map(|_| ()),
                MutationKind::Delete => gateway.delete(&write.entity).await,
                MutationKind::Unspecified => Ok(()),
            };

            let e = match result {
                Ok(()) => {
                    if write.kind == MutationKind::Delete {
                        landed_deletes.extend(write.id_key());
                    }
                    report.applied += 1;
                    continue;
                }
                Err(e) => e,
            };

            write.attempts += 1;
            if e.is_retryable() && write.attempts < max_attempts {
                let delay = self.retry.delay_for_attempt(write.attempts as usize);
                warn!(
                    repository = %self.name,
                    kind = %write.kind,
                    attempt = write.attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Durable write failed, requeueing"
                );
                batch.push_front(write);
                report.requeued = batch.len();
                backoff = Some(Instant::now() + delay);
                self.requeue_front(std::mem::take(&mut batch)).await;
                break;
            }

            self.dead_letter(write, &e);
            report.dead_lettered += 1;
        }

        *self.retry_guard() = backoff;
        self.release_tombstones(landed_deletes).await;
        metrics::record_flush(
            &self.name,
            report.applied,
            report.requeued,
            report.dead_lettered,
            start.elapsed(),
        );
        metrics::set_pending_depth(&self.name, self.pending_len().await);
        debug!(
            repository = %self.name,
            applied = report.applied,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            "Flushed pending writes"
        );

        Ok(report)
    }

    async fn enqueue(&self, write: PendingWrite<T>) {
        metrics::record_pending_enqueued(T::schema().type_name, &write.kind.to_string());
        let depth = {
            let mut pending = self.pending.lock().await;
            pending.push_back(write);
            pending.len()
        };
        metrics::set_pending_depth(&self.name, depth);
    }

    async fn requeue_front(&self, writes: VecDeque<PendingWrite<T>>) {
        let mut pending = self.pending.lock().await;
        for write in writes.into_iter().rev() {
            pending.push_front(write);
        }
    }

    /// Lift tombstones whose delete reached the store, unless another delete
    /// for the same id is still queued.
    async fn release_tombstones(&self, landed: Vec<String>) {
        if landed.is_empty() {
            return;
        }
        let pending = self.pending.lock().await;
        let mut tombstones = self.tombstone_guard();
        for id_key in landed {
            let queued = pending
                .iter()
                .any(|w| w.kind == MutationKind::Delete && w.targets(&id_key));
            if !queued {
                tombstones.remove(&id_key);
            }
        }
    }

    /// Drop queued writes for `id_key`. Returns how many were dropped.
    async fn supersede_pending(&self, id_key: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|w| !w.targets(id_key));
        metrics::set_pending_depth(&self.name, pending.len());
        before - pending.len()
    }

    fn dead_letter(&self, write: PendingWrite<T>, e: &RelayError) {
        let type_name = T::schema().type_name;
        let id = write.entity.id().map(|id| id.to_key());
        error!(
            repository = %self.name,
            kind = %write.kind,
            id = ?id,
            attempts = write.attempts,
            error = %e,
            "Durable write abandoned, moved to dead-letter log"
        );
        metrics::record_dead_letter(type_name, &write.kind.to_string());

        let letter = DeadLetter {
            type_name: type_name.to_string(),
            kind: write.kind,
            id,
            record: codec::encode(&write.entity).unwrap_or_default(),
            attempts: write.attempts,
            error: e.to_string(),
            failed_at: Utc::now(),
        };
        self.dead_log().push(letter);
    }

    // =========================================================================
    // Remote mutations
    // =========================================================================

    /// Apply a mutation published by another node.
    ///
    /// The envelope's record goes to the cache as-is. On the receiver it is
    /// also written straight to the store, after dropping any queued local
    /// write for the same id. Nothing is published or queued.
    pub async fn apply_remote(&self, envelope: MutationEnvelope) -> Result<()> {
        let schema = T::schema();
        if envelope.entity_type_name != schema.type_name {
            return Err(RelayError::UnknownRepository(format!(
                "{} envelope routed to {}",
                envelope.entity_type_name, self.name
            )));
        }

        let entity: T = codec::decode_shallow(envelope.entity.clone()).await?;
        let id_key = self.id_key_of(&entity)?;

        if envelope.kind == MutationKind::Unspecified {
            debug!(repository = %self.name, id = %id_key, "Ignoring NONE mutation");
            return Ok(());
        }

        // Serialized with drains: a batch already taken must not land after us
        let gateway = self.receiver_gateway();
        let _drain = match gateway {
            Some(_) => Some(self.flush_lock.lock().await),
            None => None,
        };
        if gateway.is_some() {
            let dropped = self.supersede_pending(&id_key).await;
            if dropped > 0 {
                debug!(repository = %self.name, id = %id_key, dropped, "Queued writes superseded by remote mutation");
            }
        }

        match envelope.kind {
            MutationKind::Save => {
                self.write_cache(&id_key, &envelope.entity).await?;
                if let Some(gateway) = gateway {
                    gateway.save_record(envelope.entity).await?;
                }
            }
            MutationKind::Delete => {
                self.ctx.cache().delete(&self.key(&id_key)).await?;
                if let Some(gateway) = gateway {
                    gateway.delete_record(&id_key).await?;
                }
            }
            MutationKind::Unspecified => {}
        }
        self.tombstone_guard().remove(&id_key);

        debug!(
            repository = %self.name,
            kind = %envelope.kind,
            id = %id_key,
            origin = ?envelope.origin,
            "Applied remote mutation"
        );
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn receiver_gateway(&self) -> Option<&StoreGateway<T>> {
        self.gateway.as_ref().filter(|_| self.ctx.is_receiver())
    }

    fn require_gateway(&self) -> Result<&StoreGateway<T>> {
        self.gateway.as_ref().ok_or_else(|| {
            RelayError::StoreUnavailable(format!("no durable store for {}", self.name))
        })
    }

    fn id_key_of(&self, entity: &T) -> Result<String> {
        entity
            .id()
            .map(|id| id.to_key())
            .ok_or_else(|| RelayError::MissingId {
                entity_type: T::schema().type_name.to_string(),
            })
    }

    fn retry_guard(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.retry_after.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn dead_log(&self) -> std::sync::MutexGuard<'_, DeadLetterLog> {
        self.dead_letters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn tombstone_guard(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.tombstones.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_tombstoned(&self, id_key: &str) -> bool {
        self.tombstone_guard().contains(id_key)
    }

    fn without_tombstoned(&self, mut records: Vec<CacheRecord>) -> Vec<CacheRecord> {
        let tombstones = self.tombstone_guard();
        if tombstones.is_empty() {
            return records;
        }
        let schema = T::schema();
        records.retain(|record| {
            codec::record_id_key(schema, record).map_or(true, |id_key| !tombstones.contains(&id_key))
        });
        records
    }

    async fn decode(&self, record: CacheRecord) -> Result<T> {
        codec::decode_root::<T>(
            record,
            self.ctx.registry().as_ref(),
            self.ctx.config().settings.codec.max_depth,
        )
        .await
    }

    async fn decode_lenient(&self, records: Vec<CacheRecord>) -> Vec<T> {
        let mut entities = Vec::with_capacity(records.len());
        for record in records {
            match self.decode(record).await {
                Ok(entity) => entities.push(entity),
                Err(e) => warn!(repository = %self.name, error = %e, "Skipping undecodable record"),
            }
        }
        entities
    }

    async fn write_cache(&self, id_key: &str, record: &CacheRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.ctx
            .cache()
            .set(&self.key(id_key), payload, self.entry_ttl)
            .await
    }

    async fn populate(&self, records: &[CacheRecord]) -> Result<()> {
        let schema = T::schema();
        for record in records {
            if let Some(id_key) = codec::record_id_key(schema, record) {
                self.write_cache(&id_key, record).await?;
            }
        }
        Ok(())
    }

    async fn read_cached(&self, id_key: &str) -> Result<Option<CacheRecord>> {
        let raw = self.ctx.cache().get(&self.key(id_key)).await?;
        Ok(raw.and_then(|raw| self.parse_cached(&raw)))
    }

    fn parse_cached(&self, raw: &str) -> Option<CacheRecord> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(record)) => Some(record),
            Ok(_) | Err(_) => {
                warn!(repository = %self.name, "Cache entry is not a JSON object");
                None
            }
        }
    }

    /// Every cached record of this type (SCAN + MGET).
    async fn cached_records(&self) -> Result<Vec<CacheRecord>> {
        let pattern = format!("{}:*", T::schema().type_name);
        let keys = self.ctx.cache().scan(&pattern).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values = self.ctx.cache().get_many(&keys).await?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|raw| self.parse_cached(&raw))
            .collect())
    }

    /// Load an entity's record, cache first, store second.
    async fn load_record(&self, id_key: &str) -> Result<Option<CacheRecord>> {
        if let Some(record) = self.read_cached(id_key).await? {
            return Ok(Some(record));
        }
        let Some(gateway) = &self.gateway else {
            return Ok(None);
        };
        if self.is_tombstoned(id_key) {
            return Ok(None);
        }
        let record = gateway.find_record(id_key).await?;
        if let Some(record) = &record {
            self.write_cache(id_key, record).await?;
        }
        Ok(record)
    }

    async fn warm_cache(&self) -> Result<usize> {
        let Some(gateway) = &self.gateway else {
            return Ok(0);
        };
        let records = gateway.all_records().await?;
        self.populate(&records).await?;
        Ok(records.len())
    }

    async fn resolve_tree(&self, id: &Value, ctx: &mut ResolveContext) -> Result<Option<Value>> {
        let schema = T::schema();
        let Some(id_key) = codec::id_key(id) else {
            return Ok(None);
        };
        let node = codec::node_key(schema.type_name, &id_key);
        if !ctx.enter(&node) {
            return Ok(None);
        }

        let loaded = self.load_record(&id_key).await;
        let tree = match loaded {
            Ok(Some(record)) => {
                let tree = codec::materialize::<T>(record, self.ctx.registry().as_ref(), ctx).await;
                Ok(Some(Value::Object(tree)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        ctx.leave(&node);

        // A related record that cannot become a T resolves to nothing
        match tree? {
            Some(tree) if serde_json::from_value::<T>(tree.clone()).is_ok() => Ok(Some(tree)),
            Some(_) => {
                warn!(repository = %self.name, id = %id_key, "Related record does not decode");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

impl<T: Entity> RepositoryRef for CacheRepository<T> {
    fn type_name(&self) -> &'static str {
        T::schema().type_name
    }

    fn repository_name(&self) -> &str {
        &self.name
    }

    fn pending_writes(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { Ok(self.pending_len().await) })
    }

    fn dead_letter_count(&self) -> usize {
        self.dead_log().len()
    }

    fn flush_updates(&self) -> BoxFuture<'_, FlushReport> {
        Box::pin(CacheRepository::flush_updates(self))
    }

    fn apply_remote(&self, envelope: MutationEnvelope) -> BoxFuture<'_, ()> {
        Box::pin(CacheRepository::apply_remote(self, envelope))
    }

    fn resolve_record<'a>(
        &'a self,
        id: &'a Value,
        ctx: &'a mut ResolveContext,
    ) -> BoxFuture<'a, Option<Value>> {
        Box::pin(self.resolve_tree(id, ctx))
    }

    fn warm(&self) -> BoxFuture<'_, usize> {
        Box::pin(self.warm_cache())
    }
}

impl<T: Entity> Drop for CacheRepository<T> {
    fn drop(&mut self) {
        self.ctx.registry().unregister(&self.name);
    }
}
