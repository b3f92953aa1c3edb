// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity repositories.
//!
//! - [`CacheRepository`] serves reads from the cache and, on the receiver,
//!   queues writes for the durable store.
//! - [`ReplicaRepository`] adds pub/sub propagation of local mutations.

mod cached;
mod pending;
mod replica;

pub use cached::CacheRepository;
pub use pending::{DeadLetter, DeadLetterLog, FlushReport, PendingWrite};
pub use replica::ReplicaRepository;
