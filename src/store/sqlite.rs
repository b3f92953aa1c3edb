// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite durable store.
//!
//! One table per entity type:
//!
//! ```text
//! CREATE TABLE "users" (
//!     id TEXT PRIMARY KEY,      -- identifier key form ("u1", "7", uuid)
//!     record TEXT NOT NULL,     -- flat cache record as JSON
//!     updated_at INTEGER NOT NULL
//! )
//! ```
//!
//! Integer identifiers come from `relay_sequences`, one monotonic counter per
//! table, so an id freed by a delete is never handed out again.
//!
//! Field filters run against the JSON body. Two numbers match by value;
//! otherwise the text forms are compared, so `7` matches `"7"` and `true`
//! matches `"true"`, the same rule as [`codec::loosely_equal`].
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with capped exponential backoff.
//! Each attempt is a fresh transaction, rolled back on any error.

use super::{is_valid_identifier, DurableStore, StoreTable};
use crate::codec::{self, CacheRecord};
use crate::config::StoreConfig;
use crate::entity::IdStrategy;
use crate::error::{BoxFuture, RelayError, Result};
use dashmap::DashSet;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

fn is_busy(e: &RelayError) -> bool {
    matches!(e, RelayError::Store(inner) if is_sqlite_busy_error(inner))
}

/// Execute a store operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_busy(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_busy(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

fn quoted_table(table: &StoreTable) -> Result<String> {
    if !is_valid_identifier(&table.name) {
        return Err(RelayError::Config(format!("invalid table name: {:?}", table.name)));
    }
    Ok(format!("\"{}\"", table.name))
}

fn json_path(field: &str) -> Result<String> {
    if !is_valid_identifier(field) {
        return Err(RelayError::InvalidQuery(format!("invalid field name: {:?}", field)));
    }
    Ok(format!("$.{}", field))
}

const SEQUENCES_TABLE: &str = "relay_sequences";

/// Text form of a JSON value, for loose comparison. Booleans keep their
/// names instead of collapsing to 0/1.
fn loose_text(doc: &str, path: &str) -> String {
    format!(
        "CASE json_type({doc}, {path}) \
            WHEN 'true' THEN 'true' \
            WHEN 'false' THEN 'false' \
            WHEN 'null' THEN NULL \
            ELSE CAST(json_extract({doc}, {path}) AS TEXT) END"
    )
}

/// WHERE clause matching `json_extract(record, ?1)` loosely against the
/// JSON document bound as `?2`.
fn loose_match() -> String {
    format!(
        "((json_type(record, ?1) IN ('integer', 'real') \
           AND json_type(?2, '$') IN ('integer', 'real') \
           AND json_extract(record, ?1) = json_extract(?2, '$')) \
          OR {} = {})",
        loose_text("record", "?1"),
        loose_text("?2", "'$'")
    )
}

fn parse_record(body: &str) -> Result<CacheRecord> {
    serde_json::from_str(body)
        .map_err(|e| RelayError::codec(format!("stored record is not a JSON object: {}", e)))
}

/// Durable store backed by SQLite via sqlx.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
    /// Tables already created by this process.
    known_tables: DashSet<String>,
}

impl SqliteStore {
    /// Open (or create) the database described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Opening durable store");

        let (options, pool_options) = if config.is_in_memory() {
            // A private in-memory database lives exactly as long as its one connection
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| RelayError::Config(format!("Invalid SQLite path: {}", e)))?;
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                .map_err(|e| RelayError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5))
                .create_if_missing(true);
            let pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
            (options, pool_options)
        };

        let pool = pool_options.connect_with(options).await?;

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
            known_tables: DashSet::new(),
        })
    }

    /// Private in-memory database (tests, single-process use).
    pub async fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    /// Database path this store was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the pool (WAL is checkpointed by SQLite on last close).
    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path, "Durable store closed");
    }

    async fn create_table(&self, table: &StoreTable) -> Result<()> {
        if self.known_tables.contains(&table.name) {
            return Ok(());
        }
        let sql_table = quoted_table(table)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            sql_table
        );
        sqlx::query(&sql).execute(&self.pool).await?;

        if table.id_strategy == IdStrategy::Sequence {
            let sequences = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    name TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                )",
                SEQUENCES_TABLE
            );
            sqlx::query(&sequences).execute(&self.pool).await?;

            // Tables written before the counter existed start above their rows
            let seed = format!(
                "INSERT OR IGNORE INTO {} (name, value)
                 SELECT ?, COALESCE(MAX(CAST(id AS INTEGER)), 0) FROM {}",
                SEQUENCES_TABLE, sql_table
            );
            sqlx::query(&seed).bind(&table.name).execute(&self.pool).await?;
        }

        self.known_tables.insert(table.name.clone());
        debug!(table = %table.name, "Table ready");
        Ok(())
    }

    async fn upsert_once(&self, table: &StoreTable, record: CacheRecord) -> Result<CacheRecord> {
        let mut tx = self.pool.begin().await?;
        match Self::write_record(&mut tx, table, record).await {
            Ok(stored) => {
                tx.commit().await?;
                Ok(stored)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(table = %table.name, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn write_record(
        tx: &mut Transaction<'_, Sqlite>,
        table: &StoreTable,
        mut record: CacheRecord,
    ) -> Result<CacheRecord> {
        let sql_table = quoted_table(table)?;

        let id = match record.get(table.id_field).and_then(codec::id_key) {
            Some(id) => {
                // Explicit integer ids move the counter past them
                if let (IdStrategy::Sequence, Ok(n)) = (table.id_strategy, id.parse::<i64>()) {
                    let sql = format!(
                        "INSERT INTO {seq} (name, value) VALUES (?, ?)
                         ON CONFLICT(name) DO UPDATE SET value = MAX({seq}.value, excluded.value)",
                        seq = SEQUENCES_TABLE
                    );
                    sqlx::query(&sql)
                        .bind(&table.name)
                        .bind(n)
                        .execute(&mut **tx)
                        .await?;
                }
                id
            }
            None => {
                let allocated = match table.id_strategy {
                    IdStrategy::Sequence => {
                        let sql = format!(
                            "INSERT INTO {seq} (name, value) VALUES (?, 1)
                             ON CONFLICT(name) DO UPDATE SET value = {seq}.value + 1
                             RETURNING value",
                            seq = SEQUENCES_TABLE
                        );
                        let next = sqlx::query_scalar::<_, i64>(&sql)
                            .bind(&table.name)
                            .fetch_one(&mut **tx)
                            .await?;
                        Value::from(next)
                    }
                    IdStrategy::Generated => Value::String(Uuid::now_v7().to_string()),
                };
                let key = codec::id_key(&allocated)
                    .ok_or_else(|| RelayError::Internal("allocated id has no key form".to_string()))?;
                record.insert(table.id_field.to_string(), allocated);
                key
            }
        };

        let body = serde_json::to_string(&record)?;
        let sql = format!(
            "INSERT INTO {} (id, record, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 record = excluded.record,
                 updated_at = excluded.updated_at",
            sql_table
        );
        sqlx::query(&sql)
            .bind(&id)
            .bind(&body)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut **tx)
            .await?;

        Ok(record)
    }

    async fn delete_where_once(&self, sql: &str, first: String, second: Option<String>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(sql).bind(first);
        if let Some(second) = second {
            query = query.bind(second);
        }
        match query.execute(&mut *tx).await {
            Ok(done) => {
                tx.commit().await?;
                Ok(done.rows_affected())
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e.into())
            }
        }
    }
}

impl DurableStore for SqliteStore {
    fn ensure_table<'a>(&'a self, table: &'a StoreTable) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.create_table(table).await })
    }

    fn upsert<'a>(&'a self, table: &'a StoreTable, record: CacheRecord) -> BoxFuture<'a, CacheRecord> {
        Box::pin(async move {
            self.create_table(table).await?;
            execute_with_retry("upsert", || self.upsert_once(table, record.clone())).await
        })
    }

    fn get<'a>(&'a self, table: &'a StoreTable, id: &'a str) -> BoxFuture<'a, Option<CacheRecord>> {
        Box::pin(async move {
            self.create_table(table).await?;
            let sql = format!("SELECT record FROM {} WHERE id = ?", quoted_table(table)?);
            let body = execute_with_retry("get", || async {
                Ok::<_, RelayError>(sqlx::query_scalar::<_, String>(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?)
            })
            .await?;
            body.as_deref().map(parse_record).transpose()
        })
    }

    fn delete<'a>(&'a self, table: &'a StoreTable, id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.create_table(table).await?;
            let sql = format!("DELETE FROM {} WHERE id = ?", quoted_table(table)?);
            let removed = execute_with_retry("delete", || self.delete_where_once(&sql, id.to_string(), None)).await?;
            Ok(removed > 0)
        })
    }

    fn list<'a>(&'a self, table: &'a StoreTable) -> BoxFuture<'a, Vec<CacheRecord>> {
        Box::pin(async move {
            self.create_table(table).await?;
            let sql = format!("SELECT record FROM {} ORDER BY rowid", quoted_table(table)?);
            let bodies = execute_with_retry("list", || async {
                Ok::<_, RelayError>(sqlx::query_scalar::<_, String>(&sql).fetch_all(&self.pool).await?)
            })
            .await?;
            bodies.iter().map(|b| parse_record(b)).collect()
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
            self.create_table(table).await?;
            let path = json_path(field)?;
            let expected = serde_json::to_string(value)?;
            let mut sql = format!(
                "SELECT record FROM {} WHERE {} ORDER BY rowid",
                quoted_table(table)?,
                loose_match()
            );
            if let Some(limit) = limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }
            let bodies = execute_with_retry("find_by_field", || async {
                Ok::<_, RelayError>(sqlx::query_scalar::<_, String>(&sql)
                    .bind(&path)
                    .bind(&expected)
                    .fetch_all(&self.pool)
                    .await?)
            })
            .await?;
            bodies.iter().map(|b| parse_record(b)).collect()
        })
    }

    fn delete_by_field<'a>(
        &'a self,
        table: &'a StoreTable,
        field: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.create_table(table).await?;
            let path = json_path(field)?;
            let expected = serde_json::to_string(value)?;
            let sql = format!("DELETE FROM {} WHERE {}", quoted_table(table)?, loose_match());
            execute_with_retry("delete_by_field", || {
                self.delete_where_once(&sql, path.clone(), Some(expected.clone()))
            })
            .await
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
    }
}
