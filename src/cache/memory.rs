// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cache and bus.

use super::{glob_match, CacheStore, MessageBus};
use crate::error::{BoxFuture, RelayError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Cache held in process memory, with TTLs on the tokio clock.
///
/// `set_available(false)` makes every call fail with a cache error, which is
/// how tests simulate an outage.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw value lookup that ignores availability.
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map is still structurally valid
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayError::cache_msg(operation, "cache unavailable"));
        }
        Ok(())
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl CacheStore for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check("get")?;
            Ok(self.live_value(key))
        })
    }

    fn get_many<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Vec<Option<String>>> {
        Box::pin(async move {
            self.check("mget")?;
            Ok(keys.iter().map(|k| self.live_value(k)).collect())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Option<Duration>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check("set")?;
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            self.lock().insert(key.to_string(), Entry { value, expires_at });
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.check("del")?;
            let now = Instant::now();
            Ok(self.lock().remove(key).is_some_and(|e| e.is_live(now)))
        })
    }

    fn scan<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.check("scan")?;
            let now = Instant::now();
            let mut keys: Vec<String> = self
                .lock()
                .iter()
                .filter(|(k, e)| e.is_live(now) && glob_match(pattern, k))
                .map(|(k, _)| k.clone())
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.check("pexpire")?;
            let now = Instant::now();
            let mut entries = self.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.is_live(now) => {
                    entry.expires_at = Some(now + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn flush_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.check("flushdb")?;
            self.lock().clear();
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.check("ping") })
    }
}

/// In-process pub/sub. Clones share the same channels, so one bus can be
/// handed to several nodes in a test.
#[derive(Clone, Default)]
pub struct MemoryBus {
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        match channels.get_mut(channel) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }
}

impl MessageBus for MemoryBus {
    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(senders) = channels.get_mut(channel) {
                senders.retain(|tx| tx.send(payload.clone()).is_ok());
            }
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, mpsc::UnboundedReceiver<String>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            self.channels
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .entry(channel.to_string())
                .or_default()
                .push(tx);
            Ok(rx)
        })
    }
}
