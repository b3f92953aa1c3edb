// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory durable store.
//!
//! Keeps every table in process memory. Counts reads and writes so tests can
//! assert when the store was (or was not) consulted, and can be told to fail
//! writes or go offline to exercise the retry and dead-letter paths.

use super::{DurableStore, StoreTable};
use crate::codec::{self, loosely_equal, CacheRecord};
use crate::entity::IdStrategy;
use crate::error::{BoxFuture, RelayError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Table {
    /// Rows in insertion order.
    rows: Vec<(String, CacheRecord)>,
    last_sequence: i64,
}

impl Table {
    fn position(&self, id: &str) -> Option<usize> {
        self.rows.iter().position(|(key, _)| key == id)
    }
}

/// Durable store held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    /// Fail this many upcoming writes (upsert/delete) with `StoreUnavailable`.
    failing_writes: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read operations served so far (get, list, find).
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Write operations applied so far (upsert, delete).
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` writes fail with a retryable error.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Take the store offline (every call fails) or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of rows in a table.
    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Raw row lookup that bypasses the counters.
    pub async fn peek(&self, table: &str, id: &str) -> Option<CacheRecord> {
        let tables = self.tables.lock().await;
        let t = tables.get(table)?;
        t.position(id).map(|i| t.rows[i].1.clone())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RelayError::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn begin_read(&self) -> Result<()> {
        self.check_online()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn begin_write(&self) -> Result<()> {
        self.check_online()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RelayError::StoreUnavailable("injected write failure".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn matching(table: &Table, field: &str, value: &Value) -> Vec<usize> {
        table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, (_, record))| record.get(field).is_some_and(|v| loosely_equal(v, value)))
            .map(|(i, _)| i)
            .collect()
    }
}

impl DurableStore for MemoryStore {
    fn ensure_table<'a>(&'a self, table: &'a StoreTable) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_online()?;
            self.tables.lock().await.entry(table.name.clone()).or_default();
            Ok(())
        })
    }

    fn upsert<'a>(&'a self, table: &'a StoreTable, mut record: CacheRecord) -> BoxFuture<'a, CacheRecord> {
        Box::pin(async move {
            self.begin_write()?;
            let mut tables = self.tables.lock().await;
            let t = tables.entry(table.name.clone()).or_default();

            let id = match record.get(table.id_field).and_then(codec::id_key) {
                Some(id) => id,
                None => {
                    let allocated = match table.id_strategy {
                        IdStrategy::Sequence => Value::from(t.last_sequence + 1),
                        IdStrategy::Generated => Value::String(Uuid::now_v7().to_string()),
                    };
                    let key = codec::id_key(&allocated)
                        .ok_or_else(|| RelayError::Internal("allocated id has no key form".to_string()))?;
                    record.insert(table.id_field.to_string(), allocated);
                    key
                }
            };

            if let Ok(n) = id.parse::<i64>() {
                t.last_sequence = t.last_sequence.max(n);
            }

            match t.position(&id) {
                Some(i) => t.rows[i].1 = record.clone(),
                None => t.rows.push((id, record.clone())),
            }
            Ok(record)
        })
    }

    fn get<'a>(&'a self, table: &'a StoreTable, id: &'a str) -> BoxFuture<'a, Option<CacheRecord>> {
        Box::pin(async move {
            self.begin_read()?;
            let tables = self.tables.lock().await;
            Ok(tables
                .get(&table.name)
                .and_then(|t| t.position(id).map(|i| t.rows[i].1.clone())))
        })
    }

    fn delete<'a>(&'a self, table: &'a StoreTable, id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.begin_write()?;
            let mut tables = self.tables.lock().await;
            let Some(t) = tables.get_mut(&table.name) else {
                return Ok(false);
            };
            match t.position(id) {
                Some(i) => {
                    t.rows.remove(i);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn list<'a>(&'a self, table: &'a StoreTable) -> BoxFuture<'a, Vec<CacheRecord>> {
        Box::pin(async move {
            self.begin_read()?;
            let tables = self.tables.lock().await;
            Ok(tables
                .get(&table.name)
                .map(|t| t.rows.iter().map(|(_, r)| r.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn find_by_field<'a>(
        &'a self,
        table: &'a StoreTable,
        field: &'a str,
        value: &'a Value,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Vec<CacheRecord>> {
        Box::pin(async move {
            self.begin_read()?;
            let tables = self.tables.lock().await;
            let Some(t) = tables.get(&table.name) else {
                return Ok(Vec::new());
            };
            Ok(Self::matching(t, field, value)
                .into_iter()
                .take(limit.unwrap_or(usize::MAX))
                .map(|i| t.rows[i].1.clone())
                .collect())
        })
    }

    fn delete_by_field<'a>(
        &'a self,
        table: &'a StoreTable,
        field: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.begin_write()?;
            let mut tables = self.tables.lock().await;
            let Some(t) = tables.get_mut(&table.name) else {
                return Ok(0);
            };
            let doomed = Self::matching(t, field, value);
            for i in doomed.iter().rev() {
                t.rows.remove(*i);
            }
            Ok(doomed.len() as u64)
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.check_online() })
    }
}
