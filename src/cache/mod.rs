// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared cache and message bus.
//!
//! The cache is the globally visible read/write path every node talks to.
//! Values are JSON-encoded cache records keyed `<TypeName>:<id>`. The message
//! bus carries mutation envelopes between nodes on `mutation:<TypeName>`.
//!
//! Backends:
//!
//! - [`RedisCache`]: one Redis deployment serving as both [`CacheStore`] and
//!   [`MessageBus`] (multiplexed `ConnectionManager` + async pub/sub)
//! - [`MemoryCache`] / [`MemoryBus`]: in-process stand-ins. Several nodes can
//!   share one `MemoryBus` while each keeps its own `MemoryCache`.

mod memory;
mod redis;

pub use self::memory::{MemoryBus, MemoryCache};
pub use self::redis::RedisCache;

use crate::error::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;

/// Key-value cache.
pub trait CacheStore: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>>;

    /// Values for `keys`, positionally. Missing keys yield `None`.
    fn get_many<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Vec<Option<String>>>;

    /// Set a value, optionally with a time-to-live.
    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Option<Duration>) -> BoxFuture<'a, ()>;

    /// Remove a key. Returns whether it existed.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool>;

    /// Keys matching a glob pattern (`User:*`).
    fn scan<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Vec<String>>;

    /// Set a time-to-live on an existing key. Returns whether the key existed.
    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, bool>;

    /// Remove every key in the cache.
    fn flush_all(&self) -> BoxFuture<'_, ()>;

    /// Liveness check.
    fn ping(&self) -> BoxFuture<'_, ()>;
}

/// Publish/subscribe transport for mutation envelopes.
pub trait MessageBus: Send + Sync + 'static {
    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, ()>;

    /// Subscribe to `channel`. Payloads arrive on the returned receiver until
    /// it is dropped or the bus goes away.
    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, mpsc::UnboundedReceiver<String>>;
}

/// Glob match supporting `*` (any run) and `?` (one character), as Redis
/// `SCAN MATCH` does for the patterns the relay issues.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ki));
            pi += 1;
        } else if let Some((sp, sk)) = star {
            pi = sp + 1;
            ki = sk + 1;
            star = Some((sp, sk + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
