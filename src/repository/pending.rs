// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pending writes, flush reports and dead letters.

use crate::codec::CacheRecord;
use crate::entity::{Entity, EntityId};
use crate::envelope::MutationKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// A durable write waiting for the flush loop.
#[derive(Debug, Clone)]
pub struct PendingWrite<T> {
    pub kind: MutationKind,
    pub entity: T,
    /// Failed attempts so far.
    pub attempts: u32,
}

impl<T> PendingWrite<T> {
    pub fn save(entity: T) -> Self {
        Self {
            kind: MutationKind::Save,
            entity,
            attempts: 0,
        }
    }

    pub fn delete(entity: T) -> Self {
        Self {
            kind: MutationKind::Delete,
            entity,
            attempts: 0,
        }
    }
}

impl<T: Entity> PendingWrite<T> {
    /// Identifier key of the written entity.
    pub fn id_key(&self) -> Option<String> {
        self.entity.id().map(|id| id.to_key())
    }

    pub fn targets(&self, id_key: &str) -> bool {
        self.id_key().as_deref() == Some(id_key)
    }
}

/// Outcome of one `flush_updates()` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub repository: String,
    /// Writes applied to the store.
    pub applied: usize,
    /// Writes put back on the queue for a later attempt.
    pub requeued: usize,
    /// Writes given up and moved to the dead-letter log.
    pub dead_lettered: usize,
    /// The drain did not run (another drain in progress, or backing off).
    pub skipped: bool,
}

impl FlushReport {
    pub fn new(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            ..Default::default()
        }
    }

    pub fn skipped(repository: &str) -> Self {
        Self {
            skipped: true,
            ..Self::new(repository)
        }
    }

    /// Whether the drain touched the store at all.
    pub fn is_empty(&self) -> bool {
        self.applied == 0 && self.requeued == 0 && self.dead_lettered == 0
    }
}

/// A write given up after its retry budget, or rejected outright.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub type_name: String,
    pub kind: MutationKind,
    pub id: Option<String>,
    /// Cache record of the entity at the time of the write.
    pub record: CacheRecord,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Bounded dead-letter log; the oldest entry is evicted first.
#[derive(Debug)]
pub struct DeadLetterLog {
    entries: VecDeque<DeadLetter>,
    capacity: usize,
    evicted: u64,
}

impl DeadLetterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, letter: DeadLetter) {
        if self.capacity == 0 {
            self.evicted += 1;
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(letter);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.iter().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<DeadLetter> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(id: &str) -> DeadLetter {
        DeadLetter {
            type_name: "User".into(),
            kind: MutationKind::Save,
            id: Some(id.into()),
            record: CacheRecord::new(),
            attempts: 5,
            error: "boom".into(),
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn test_dead_letter_log_bounded() {
        let mut log = DeadLetterLog::new(2);
        log.push(letter("a"));
        log.push(letter("b"));
        log.push(letter("c"));
        assert_eq!(log.len(), 2);
        assert_eq!(log.evicted(), 1);
        let ids: Vec<_> = log.snapshot().into_iter().filter_map(|l| l.id).collect();
        assert_eq!(ids, vec!["b", "c"]);

        assert_eq!(log.drain().len(), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn test_dead_letter_log_zero_capacity() {
        let mut log = DeadLetterLog::new(0);
        log.push(letter("a"));
        assert!(log.is_empty());
        assert_eq!(log.evicted(), 1);
    }

    #[test]
    fn test_flush_report() {
        let report = FlushReport::new("users");
        assert!(report.is_empty());
        assert!(!report.skipped);
        let skipped = FlushReport::skipped("users");
        assert!(skipped.skipped);
        assert_eq!(skipped.repository, "users");
    }
}
