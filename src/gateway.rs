// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store gateway: typed CRUD for one entity type against the durable store.
//!
//! Each operation is one unit of work in the store. Nothing here touches the
//! cache. Relationship references in loaded records are resolved through the
//! repository registry, so related entities come from their own
//! repository's read-through path.
//!
//! # Async variants
//!
//! Every operation has an `*_async` twin that runs on the shared worker
//! bulkhead and hands the result to a callback:
//!
//! ```rust,ignore
//! gateway.save_async(user, |result| match result {
//!     Ok(saved) => tracing::info!(id = ?saved.id(), "saved"),
//!     Err(e) => tracing::warn!(error = %e, "save failed"),
//! });
//! ```

use crate::codec::{self, CacheRecord};
use crate::entity::{Entity, EntityId};
use crate::error::{RelayError, Result};
use crate::registry::RepositoryRegistry;
use crate::resilience::Bulkhead;
use crate::store::{DurableStore, StoreTable};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Typed transactional CRUD for entity type `T`.
pub struct StoreGateway<T: Entity> {
    store: Arc<dyn DurableStore>,
    resolver: Arc<RepositoryRegistry>,
    workers: Arc<Bulkhead>,
    table: StoreTable,
    max_depth: usize,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for StoreGateway<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            workers: Arc::clone(&self.workers),
            table: self.table.clone(),
            max_depth: self.max_depth,
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> StoreGateway<T> {
    pub fn new(
        store: Arc<dyn DurableStore>,
        resolver: Arc<RepositoryRegistry>,
        workers: Arc<Bulkhead>,
        max_depth: usize,
    ) -> Self {
        Self {
            store,
            resolver,
            workers,
            table: StoreTable::for_entity::<T>(),
            max_depth,
            _entity: PhantomData,
        }
    }

    pub fn table(&self) -> &StoreTable {
        &self.table
    }

    /// Create the backing table if needed.
    pub async fn ensure_table(&self) -> Result<()> {
        self.store.ensure_table(&self.table).await
    }

    /// Insert or replace `entity`. An entity without an id gets one from the
    /// store, and the returned entity carries it.
    pub async fn save(&self, mut entity: T) -> Result<T> {
        let record = codec::encode(&entity)?;
        let stored = self.store.upsert(&self.table, record).await?;

        if entity.id().is_none() {
            let id = stored
                .get(self.table.id_field)
                .and_then(T::Id::from_json)
                .ok_or_else(|| {
                    RelayError::Internal(format!(
                        "store returned {} without a usable id",
                        T::schema().type_name
                    ))
                })?;
            entity.set_id(id);
        }

        debug!(table = %self.table.name, id = ?entity.id(), "Saved to store");
        Ok(entity)
    }

    pub async fn find_by_id(&self, id: &T::Id) -> Result<Option<T>> {
        match self.find_record(&id.to_key()).await? {
            Some(record) => Ok(Some(self.decode(record).await?)),
            None => Ok(None),
        }
    }

    /// Delete `entity` by its id.
    pub async fn delete(&self, entity: &T) -> Result<()> {
        let id = entity.id().ok_or_else(|| RelayError::MissingId {
            entity_type: T::schema().type_name.to_string(),
        })?;
        let removed = self.store.delete(&self.table, &id.to_key()).await?;
        debug!(table = %self.table.name, %id, removed, "Deleted from store");
        Ok(())
    }

    pub async fn find_all(&self) -> Result<Vec<T>> {
        let records = self.all_records().await?;
        self.decode_all(records).await
    }

    /// First entity whose `field` equals `value`.
    ///
    /// A to-one relationship field filters on the related id
    /// (`find_where("rank", 7)` compares `rank_id`).
    pub async fn find_where(&self, field: &str, value: impl Into<Value>) -> Result<Option<T>> {
        let records = self.find_records_where(field, value.into(), Some(1)).await?;
        match records.into_iter().next() {
            Some(record) => Ok(Some(self.decode(record).await?)),
            None => Ok(None),
        }
    }

    pub async fn find_all_where(&self, field: &str, value: impl Into<Value>) -> Result<Vec<T>> {
        let records = self.find_records_where(field, value.into(), None).await?;
        self.decode_all(records).await
    }

    /// Delete every entity whose `field` equals `value`. Returns the count.
    pub async fn delete_where(&self, field: &str, value: impl Into<Value>) -> Result<u64> {
        let key = codec::storage_field(T::schema(), field)?;
        let value = value.into();
        let removed = self.store.delete_by_field(&self.table, &key, &value).await?;
        debug!(table = %self.table.name, field = %key, removed, "Deleted by field");
        Ok(removed)
    }

    // =========================================================================
    // Raw records (used by the cache layer)
    // =========================================================================

    pub async fn find_record(&self, id_key: &str) -> Result<Option<CacheRecord>> {
        self.store.get(&self.table, id_key).await
    }

    /// Upsert a cache record as-is. Returns the stored record.
    pub async fn save_record(&self, record: CacheRecord) -> Result<CacheRecord> {
        self.store.upsert(&self.table, record).await
    }

    pub async fn delete_record(&self, id_key: &str) -> Result<bool> {
        self.store.delete(&self.table, id_key).await
    }

    pub async fn all_records(&self) -> Result<Vec<CacheRecord>> {
        self.store.list(&self.table).await
    }

    pub async fn find_records_where(
        &self,
        field: &str,
        value: Value,
        limit: Option<usize>,
    ) -> Result<Vec<CacheRecord>> {
        let key = codec::storage_field(T::schema(), field)?;
        self.store.find_by_field(&self.table, &key, &value, limit).await
    }

    async fn decode(&self, record: CacheRecord) -> Result<T> {
        codec::decode_root::<T>(record, self.resolver.as_ref(), self.max_depth).await
    }

    async fn decode_all(&self, records: Vec<CacheRecord>) -> Result<Vec<T>> {
        let mut entities = Vec::with_capacity(records.len());
        for record in records {
            entities.push(self.decode(record).await?);
        }
        Ok(entities)
    }

    // =========================================================================
    // Async variants
    // =========================================================================

    pub fn save_async<F>(&self, entity: T, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let gateway = self.clone();
        self.submit(async move { gateway.save(entity).await }, callback)
    }

    pub fn find_by_id_async<F>(&self, id: T::Id, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Option<T>>) + Send + 'static,
    {
        let gateway = self.clone();
        self.submit(async move { gateway.find_by_id(&id).await }, callback)
    }

    pub fn delete_async<F>(&self, entity: T, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let gateway = self.clone();
        self.submit(async move { gateway.delete(&entity).await }, callback)
    }

    pub fn find_all_async<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Vec<T>>) + Send + 'static,
    {
        let gateway = self.clone();
        self.submit(async move { gateway.find_all().await }, callback)
    }

    pub fn find_where_async<F>(&self, field: &str, value: impl Into<Value>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Option<T>>) + Send + 'static,
    {
        let gateway = self.clone();
        let field = field.to_string();
        let value = value.into();
        self.submit(async move { gateway.find_where(&field, value).await }, callback)
    }

    pub fn find_all_where_async<F>(
        &self,
        field: &str,
        value: impl Into<Value>,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<Vec<T>>) + Send + 'static,
    {
        let gateway = self.clone();
        let field = field.to_string();
        let value = value.into();
        self.submit(async move { gateway.find_all_where(&field, value).await }, callback)
    }

    pub fn delete_where_async<F>(&self, field: &str, value: impl Into<Value>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<u64>) + Send + 'static,
    {
        let gateway = self.clone();
        let field = field.to_string();
        let value = value.into();
        self.submit(async move { gateway.delete_where(&field, value).await }, callback)
    }

    /// Run `operation` while holding a worker permit, then hand its result to
    /// `callback`.
    fn submit<R, Fut, F>(&self, operation: Fut, callback: F) -> JoinHandle<()>
    where
        R: Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        F: FnOnce(Result<R>) + Send + 'static,
    {
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let result = match workers.acquire().await {
                Ok(_permit) => operation.await,
                Err(_) if workers.is_closed() => Err(RelayError::Shutdown),
                Err(full) => Err(RelayError::WorkerPool(full.to_string())),
            };
            callback(result);
        })
    }
}
