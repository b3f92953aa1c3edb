// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the relay handles store failures, cache outages,
//! malformed bus traffic and shutdown under load without panics, deadlocks,
//! or lost writes.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use entity_relay::{
    CacheRepository, CoordinatorState, MemoryBus, MemoryCache, MessageBus, MutationKind,
    RelayConfig, RelayError, ReplicaRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;

// =============================================================================
// Durable store failures
// =============================================================================

/// Test: A failed write puts the whole batch back in order
#[tokio::test]
async fn store_failure_requeues_batch_in_order() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    ranks.save(Rank::new(Some(1), "a", 1)).await.unwrap();
    ranks.save(Rank::new(Some(1), "b", 2)).await.unwrap();
    ranks.save(Rank::new(Some(2), "c", 3)).await.unwrap();

    node.store().fail_next_writes(1);
    let report = ranks.flush_updates().await.unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(report.requeued, 3);
    assert_eq!(ranks.pending_len().await, 3);

    // Backing off
    let report = ranks.flush_updates().await.unwrap();
    assert!(report.skipped);

    sleep(Duration::from_millis(60)).await;
    let report = ranks.flush_updates().await.unwrap();
    assert_eq!(report.applied, 3);
    assert!(ranks.dead_letters().is_empty());

    let stored = node.store().peek("ranks", "1").await.unwrap();
    assert_eq!(stored["name"], "b");
    assert!(node.store().peek("ranks", "2").await.is_some());
}

/// Test: Writes that exhaust the retry budget land in the dead-letter log
#[tokio::test]
async fn store_outage_dead_letters_after_budget() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let max_attempts = node.ctx.config().settings.flush.max_attempts;

    ranks.save(Rank::new(Some(1), "doomed", 1)).await.unwrap();
    node.store().set_offline(true);

    let mut flushes = 0;
    while ranks.dead_letters().is_empty() {
        assert!(flushes < 50, "write never dead-lettered");
        let report = ranks.flush_updates().await.unwrap();
        if !report.skipped {
            flushes += 1;
        }
        sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(flushes, max_attempts as usize);
    let letters = ranks.take_dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].kind, MutationKind::Save);
    assert_eq!(letters[0].id.as_deref(), Some("1"));
    assert_eq!(letters[0].attempts, max_attempts);
    assert_eq!(ranks.pending_len().await, 0);

    // Cache still serves the entity
    assert_eq!(ranks.find_by_id(&1).await.unwrap().unwrap().name, "doomed");

    // Store recovers, later writes go through
    node.store().set_offline(false);
    sleep(Duration::from_millis(60)).await;
    ranks.save(Rank::new(Some(2), "fine", 1)).await.unwrap();
    assert_eq!(ranks.flush_updates().await.unwrap().applied, 1);
}

/// Test: Dead letters make the node unhealthy
#[tokio::test]
async fn dead_letters_surface_in_health() {
    let bus = MemoryBus::new();
    let mut config = RelayConfig::for_testing("rx", true);
    config.settings.flush.max_attempts = 1;
    let node = TestNode::build(config, Arc::new(MemoryCache::new()), &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let mut coordinator = node.coordinator();
    coordinator.start().await.unwrap();

    node.store().set_offline(true);
    ranks.save(Rank::new(Some(1), "x", 1)).await.unwrap();

    let r = ranks.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let r = r.clone();
        async move { !r.dead_letters().is_empty() }
    })
    .await);

    let health = coordinator.health_check().await;
    assert!(!health.healthy);
    assert_eq!(health.repositories[0].dead_letters, 1);
    coordinator.shutdown().await;
}

// =============================================================================
// Cache outages
// =============================================================================

/// Test: The flush loop holds writes while the cache is down and resumes after
#[tokio::test]
async fn cache_outage_pauses_flushing() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    ranks.save(Rank::new(Some(1), "a", 1)).await.unwrap();
    ranks.save(Rank::new(Some(2), "b", 2)).await.unwrap();
    node.cache.set_available(false);

    let mut coordinator = node.coordinator();
    coordinator.start().await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(node.store().row_count("ranks").await, 0);
    assert_eq!(ranks.pending_len().await, 2);
    assert!(!coordinator.health_check().await.cache_reachable);

    node.cache.set_available(true);
    let store = node.store().clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        async move { store.row_count("ranks").await == 2 }
    })
    .await);

    coordinator.shutdown().await;
}

/// Test: Direct calls surface cache errors instead of hiding them
#[tokio::test]
async fn cache_outage_propagates_to_callers() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    node.cache.set_available(false);

    let err = ranks.save(Rank::new(Some(1), "a", 1)).await.unwrap_err();
    assert!(matches!(err, RelayError::Cache { .. }));
    assert!(err.is_retryable());
    assert!(ranks.find_by_id(&1).await.is_err());
    assert_eq!(ranks.pending_len().await, 0);
}

// =============================================================================
// Malformed bus traffic
// =============================================================================

/// Test: Garbage on the channel is dropped and valid envelopes still apply
#[tokio::test]
async fn malformed_envelopes_do_not_stall_dispatch() {
    let bus = MemoryBus::new();
    let node = TestNode::peer("b", &bus);
    let members = ReplicaRepository::<Member>::new(&node.ctx).await.unwrap();

    let payloads = [
        "",
        "not json",
        "{}",
        r#"{"entityTypeName":"","kind":"SAVE","entity":{}}"#,
        r#"{"entityTypeName":"Member","kind":"EXPLODE","entity":{"id":"u1"}}"#,
        r#"{"entityTypeName":"Member","kind":"SAVE","entity":"nope"}"#,
        r#"{"entityTypeName":"Rank","kind":"SAVE","entity":{"id":1}}"#,
    ];
    for payload in payloads {
        bus.publish("mutation:Member", payload.to_string()).await.unwrap();
    }
    // Parses, but has no id: rejected at apply time
    bus.publish(
        "mutation:Member",
        r#"{"entityTypeName":"Member","kind":"SAVE","entity":{"name":"anon"},"origin":"a"}"#.to_string(),
    )
    .await
    .unwrap();
    bus.publish(
        "mutation:Member",
        r#"{"entityTypeName":"Member","kind":"SAVE","entity":{"id":"u1","name":"Alice"},"origin":"a"}"#
            .to_string(),
    )
    .await
    .unwrap();
    settle().await;

    let coordinator = node.coordinator();
    assert_eq!(coordinator.run_dispatch_tick().await, 1);
    assert!(members.is_subscribed());
    let alice = members.find_by_id(&"u1".to_string()).await.unwrap().unwrap();
    assert_eq!(alice.name, "Alice");
}

// =============================================================================
// Shutdown
// =============================================================================

/// Test: Concurrent writers, then shutdown, loses nothing
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_under_load_flushes_everything() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let mut coordinator = node.coordinator();
    coordinator.start().await.unwrap();

    let mut writers = Vec::new();
    for w in 0..4i64 {
        let ranks = Arc::clone(&ranks);
        writers.push(tokio::spawn(async move {
            for n in 0..50i64 {
                let id = w * 1000 + n;
                ranks.save(Rank::new(Some(id), "load", n as i32)).await.unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    coordinator.shutdown().await;
    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    assert_eq!(ranks.pending_len().await, 0);
    assert_eq!(node.store().row_count("ranks").await, 200);
}

/// Test: Async gateway calls fail fast once the worker pool is closed
#[tokio::test]
async fn shutdown_rejects_async_gateway_calls() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let mut coordinator = node.coordinator();
    coordinator.start().await.unwrap();
    coordinator.shutdown().await;

    let (tx, rx) = oneshot::channel();
    ranks
        .gateway()
        .unwrap()
        .save_async(Rank::new(Some(1), "late", 1), move |result| {
            let _ = tx.send(result);
        })
        .await
        .unwrap();
    assert!(matches!(rx.await.unwrap(), Err(RelayError::Shutdown)));
}

/// Test: Shutdown stops subscriptions and rejects a second start
#[tokio::test]
async fn shutdown_is_final() {
    let bus = MemoryBus::new();
    let node = TestNode::peer("a", &bus);
    let members = ReplicaRepository::<Member>::new(&node.ctx).await.unwrap();
    let mut coordinator = node.coordinator();
    coordinator.start().await.unwrap();
    coordinator.shutdown().await;
    coordinator.shutdown().await;

    settle().await;
    assert!(!members.is_subscribed());
    assert!(matches!(
        coordinator.start().await,
        Err(RelayError::InvalidState { .. })
    ));
}
