// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed cache and message bus.
//!
//! Uses `redis::aio::ConnectionManager` for key-value commands. It is Clone
//! and multiplexed, so each call clones the handle instead of checking a
//! connection out of a pool. Each subscription opens its own async pub/sub
//! connection and forwards payloads from a spawned task.

use super::{CacheStore, MessageBus};
use crate::config::CacheConfig;
use crate::error::{BoxFuture, RelayError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// `SCAN` batch hint.
const SCAN_COUNT: usize = 1000;

/// Redis deployment acting as cache and bus.
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect with retry and a per-attempt timeout.
    pub async fn connect(config: &CacheConfig, retry_config: &RetryConfig) -> Result<Self> {
        info!(url = %config.redis_url, "Connecting to cache");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| RelayError::cache("connect", e))?;

        let mut attempt = 0;
        let mut delay = retry_config.initial_delay;

        loop {
            attempt += 1;

            // Wrap connection attempt in a timeout to avoid hanging on unreachable hosts
            let conn_result = timeout(
                retry_config.connection_timeout,
                client.get_connection_manager(),
            )
            .await;

            match conn_result {
                Ok(Ok(conn)) => {
                    if attempt > 1 {
                        info!(attempt, "Connected to cache after retry");
                    } else {
                        info!("Connected to cache");
                    }
                    return Ok(Self { client, conn });
                }
                Ok(Err(e)) => {
                    if attempt >= retry_config.max_attempts {
                        error!(attempt, error = %e, "Failed to connect to cache after max retries");
                        return Err(RelayError::cache("connect", e));
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Cache connection attempt failed, retrying"
                    );
                }
                Err(_) => {
                    if attempt >= retry_config.max_attempts {
                        error!(
                            attempt,
                            timeout_ms = retry_config.connection_timeout.as_millis(),
                            "Cache connection timed out after max retries"
                        );
                        return Err(RelayError::cache_msg(
                            "connect",
                            format!(
                                "timed out after {} attempts ({}ms timeout)",
                                attempt,
                                retry_config.connection_timeout.as_millis()
                            ),
                        ));
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        timeout_ms = retry_config.connection_timeout.as_millis(),
                        "Cache connection attempt timed out, retrying"
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay = std::cmp::min(
                Duration::from_secs_f64(delay.as_secs_f64() * retry_config.backoff_factor),
                retry_config.max_delay,
            );
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl CacheStore for RedisCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let value: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::cache("get", e))?;
            Ok(value)
        })
    }

    fn get_many<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Vec<Option<String>>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let start = Instant::now();
            let mut conn = self.conn();
            let mut cmd = redis::cmd("MGET");
            for key in keys {
                cmd.arg(key.as_str());
            }
            let values: Vec<Option<String>> = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::cache("mget", e))?;
            metrics::record_cache_latency("mget", start.elapsed());
            Ok(values)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Option<Duration>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn();
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            let _: () = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::cache("set", e))?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn();
            let removed: i64 = redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::cache("del", e))?;
            Ok(removed > 0)
        })
    }

    fn scan<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let start = Instant::now();
            let mut conn = self.conn();
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;

            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| RelayError::cache("scan", e))?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            // SCAN may return a key more than once
            keys.sort();
            keys.dedup();
            metrics::record_cache_latency("scan", start.elapsed());
            Ok(keys)
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn();
            let applied: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::cache("pexpire", e))?;
            Ok(applied == 1)
        })
    }

    fn flush_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn();
            let _: () = redis::cmd("FLUSHDB")
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::cache("flushdb", e))?;
            warn!("Cache flushed");
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn();
            let start = Instant::now();
            let reply: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::cache("ping", e))?;
            metrics::record_cache_latency("ping", start.elapsed());
            if reply == "PONG" {
                Ok(())
            } else {
                Err(RelayError::cache_msg(
                    "ping",
                    format!("unexpected PING response: {}", reply),
                ))
            }
        })
    }
}

impl MessageBus for RedisCache {
    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn();
            let receivers: i64 = redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::cache("publish", e))?;
            debug!(channel, receivers, "Published");
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, mpsc::UnboundedReceiver<String>> {
        Box::pin(async move {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| RelayError::cache("subscribe", e))?;
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| RelayError::cache("subscribe", e))?;

            let (tx, rx) = mpsc::unbounded_channel();
            let task_channel = channel.to_string();
            tokio::spawn(async move {
                let channel = task_channel;
                let mut messages = pubsub.into_on_message();
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Non-text payload on channel");
                            metrics::record_envelope_dropped(&channel, "non_text");
                            continue;
                        }
                    };
                    if tx.send(payload).is_err() {
                        break;
                    }
                }
                debug!(channel = %channel, "Subscription closed");
            });

            info!(channel, "Subscribed");
            Ok(rx)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_floor() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        let config = CacheConfig {
            redis_url: "not a url".to_string(),
            ..Default::default()
        };
        let err = RedisCache::connect(&config, &RetryConfig::testing()).await.err().unwrap();
        assert!(matches!(err, RelayError::Cache { .. }));
    }
}
