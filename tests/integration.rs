// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Entity Relay
//!
//! Most tests run against the in-memory cache, bus and store. Tests that need
//! a real Redis use testcontainers and are ignored by default.
//!
//! # Running Tests
//! ```bash
//! # In-memory tests
//! cargo test --test integration
//!
//! # Redis tests (requires Docker / OrbStack)
//! cargo test --test integration -- --ignored
//! ```
//!
//! # Test Organization
//! - `read_*` / `write_*` - cache repository paths on one node
//! - `relation_*` - relationship resolution through the registry
//! - `replica_*` - propagation between nodes over the bus
//! - `coordinator_*` - background loops
//! - `redis_*` - the same paths over a real Redis

mod common;

use common::*;
use entity_relay::cache::CacheStore;
use entity_relay::{
    CacheRecord, CacheRepository, DurableStore, FlushCoordinator, MemoryBus, RelayContext,
    RelayError, ReplicaRepository,
};
use serde_json::Value;
use std::time::Duration;
use testcontainers::clients::Cli;

fn parse(raw: &str) -> CacheRecord {
    serde_json::from_str(raw).unwrap()
}

// =============================================================================
// Read / write paths
// =============================================================================

#[tokio::test]
async fn read_through_populates_cache() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    // Straight into the store, bypassing the cache
    ranks.gateway().unwrap().save(Rank::new(Some(7), "elite", 90)).await.unwrap();
    assert!(node.cache.peek("Rank:7").is_none());

    let before = node.store().reads();
    let first = ranks.find_by_id(&7).await.unwrap().unwrap();
    assert_eq!(first.name, "elite");
    assert_eq!(node.store().reads(), before + 1);
    assert!(node.cache.peek("Rank:7").is_some());

    let second = ranks.find_by_id(&7).await.unwrap().unwrap();
    assert_eq!(second, first);
    assert_eq!(node.store().reads(), before + 1, "second read must be served from cache");
}

#[tokio::test]
async fn read_miss_everywhere_is_none() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    assert!(ranks.find_by_id(&404).await.unwrap().is_none());
}

#[tokio::test]
async fn write_order_last_save_wins() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    ranks.save(Rank::new(Some(1), "first", 1)).await.unwrap();
    ranks.save(Rank::new(Some(1), "second", 2)).await.unwrap();
    assert_eq!(ranks.pending_len().await, 2);

    let report = ranks.flush_updates().await.unwrap();
    assert_eq!(report.applied, 2);

    let stored = node.store().peek("ranks", "1").await.unwrap();
    assert_eq!(stored["name"], "second");
    assert_eq!(stored["power"], 2);
}

#[tokio::test]
async fn write_save_then_delete_leaves_nothing() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    let rank = ranks.save(Rank::new(Some(5), "temp", 1)).await.unwrap();
    ranks.delete(&rank).await.unwrap();
    ranks.flush_updates().await.unwrap();

    assert!(node.store().peek("ranks", "5").await.is_none());
    assert!(node.cache.peek("Rank:5").is_none());
    assert!(ranks.find_by_id(&5).await.unwrap().is_none());
}

#[tokio::test]
async fn write_reads_between_delete_and_flush_do_not_resurrect() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let users = CacheRepository::<User>::new(&node.ctx).await.unwrap();

    let elite = ranks.save(Rank::new(Some(7), "elite", 90)).await.unwrap();
    let mut user = User::new("alice").with_id();
    user.rank = Some(elite.clone());
    let user = users.save(user).await.unwrap();
    ranks.flush_updates().await.unwrap();
    users.flush_updates().await.unwrap();

    ranks.delete(&elite).await.unwrap();
    assert!(ranks.find_by_id(&7).await.unwrap().is_none());
    assert!(ranks.all().await.unwrap().is_empty());
    // Relation resolution takes the same path
    let loaded = users.find_by_id(&user.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(loaded.rank, None);

    ranks.flush_updates().await.unwrap();
    assert!(node.store().peek("ranks", "7").await.is_none());
    assert!(node.cache.peek("Rank:7").is_none());
}

#[tokio::test]
async fn write_convergence_after_flush() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    for id in 1..=5 {
        ranks.save(Rank::new(Some(id), &format!("r{}", id), id as i32)).await.unwrap();
    }
    ranks.save(Rank::new(Some(3), "r3-renamed", 30)).await.unwrap();
    for id in [2, 4] {
        ranks.delete(&Rank::new(Some(id), "", 0)).await.unwrap();
    }
    ranks.flush_updates().await.unwrap();

    for id in 1..=5 {
        let key = id.to_string();
        let stored = node.store().peek("ranks", &key).await;
        let cached = node.cache.peek(&format!("Rank:{}", id)).map(|raw| parse(&raw));
        assert_eq!(stored, cached, "rank {} diverged", id);
    }
    assert_eq!(node.store().row_count("ranks").await, 3);
}

#[tokio::test]
async fn write_flush_is_idempotent() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    ranks.save(Rank::new(Some(1), "a", 1)).await.unwrap();
    ranks.flush_updates().await.unwrap();
    let writes = node.store().writes();

    let report = ranks.flush_updates().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(node.store().writes(), writes);
}

#[tokio::test]
async fn write_receiver_allocates_ids() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let users = CacheRepository::<User>::new(&node.ctx).await.unwrap();

    let a = ranks.save(Rank::new(None, "a", 1)).await.unwrap();
    let b = ranks.save(Rank::new(None, "b", 2)).await.unwrap();
    assert_eq!(a.id, Some(1));
    assert_eq!(b.id, Some(2));

    let user = users.save(User::new("alice")).await.unwrap();
    let id = user.id.unwrap();
    assert_eq!(id.get_version_num(), 7);
    assert!(node.cache.peek(&format!("User:{}", id)).is_some());
}

#[tokio::test]
async fn write_non_receiver_cannot_originate_ids() {
    let bus = MemoryBus::new();
    let receiver = TestNode::receiver("rx", &bus);
    let peer = TestNode::peer_sharing("peer", &receiver.cache, &bus);
    let _rx_users = CacheRepository::<User>::new(&receiver.ctx).await.unwrap();
    let users = CacheRepository::<User>::new(&peer.ctx).await.unwrap();

    let writes = receiver.store().writes();
    match users.save(User::new("nobody")).await {
        Err(RelayError::NotAuthoritative { entity_type }) => assert_eq!(entity_type, "User"),
        other => panic!("Expected NotAuthoritative, got {:?}", other),
    }
    assert_eq!(receiver.store().writes(), writes);
    assert!(receiver.cache.is_empty());
}

#[tokio::test]
async fn write_non_receiver_shares_cache_with_receiver() {
    let bus = MemoryBus::new();
    let receiver = TestNode::receiver("rx", &bus);
    let peer = TestNode::peer_sharing("peer", &receiver.cache, &bus);
    let rx_ranks = CacheRepository::<Rank>::new(&receiver.ctx).await.unwrap();
    let peer_ranks = CacheRepository::<Rank>::new(&peer.ctx).await.unwrap();

    peer_ranks.save(Rank::new(Some(3), "shared", 3)).await.unwrap();
    assert_eq!(peer_ranks.pending_len().await, 0);

    let seen = rx_ranks.find_by_id(&3).await.unwrap().unwrap();
    assert_eq!(seen.name, "shared");
}

#[tokio::test]
async fn read_filters_scan_cache_then_store() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    ranks.save(Rank::new(Some(1), "low", 1)).await.unwrap();
    ranks.save(Rank::new(Some(2), "high", 9)).await.unwrap();
    ranks.save(Rank::new(Some(3), "also-high", 9)).await.unwrap();

    let reads = node.store().reads();
    let high = ranks.find_all_where("power", 9).await.unwrap();
    assert_eq!(high.len(), 2);
    assert_eq!(node.store().reads(), reads);

    // Loose equality: "1" matches 1
    let low = ranks.find_where("power", "1").await.unwrap().unwrap();
    assert_eq!(low.name, "low");

    assert!(ranks.find_where("power", 42).await.unwrap().is_none());
    assert!(node.store().reads() > reads, "no cache match must consult the store");
}

#[tokio::test]
async fn read_all_falls_back_to_store() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    for id in 1..=3 {
        ranks.save(Rank::new(Some(id), "r", 1)).await.unwrap();
    }
    ranks.flush_updates().await.unwrap();
    node.cache.flush_all().await.unwrap();

    let mut all = ranks.all().await.unwrap();
    all.sort_by_key(|r| r.id);
    assert_eq!(all.iter().map(|r| r.id.unwrap()).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(node.cache.len(), 3);
}

// =============================================================================
// Relationships
// =============================================================================

#[tokio::test]
async fn relation_to_one_loads_current_target() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let users = CacheRepository::<User>::new(&node.ctx).await.unwrap();

    let rank = ranks.save(Rank::new(Some(7), "elite", 90)).await.unwrap();
    let mut user = User::new("alice").with_id();
    user.rank = Some(rank);
    let user = users.save(user).await.unwrap();

    // Only the reference is cached on the user
    let raw = parse(&node.cache.peek(&format!("User:{}", user.id.unwrap())).unwrap());
    assert_eq!(raw["rank_id"], 7);
    assert!(!raw.contains_key("rank"));

    ranks.save(Rank::new(Some(7), "legend", 99)).await.unwrap();
    let loaded = users.find_by_id(&user.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(loaded.rank, Some(Rank::new(Some(7), "legend", 99)));
}

#[tokio::test]
async fn relation_orphaned_reference_is_dropped() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let _ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let users = CacheRepository::<User>::new(&node.ctx).await.unwrap();

    let mut user = User::new("bob").with_id();
    user.rank = Some(Rank::new(Some(404), "ghost", 0));
    let user = users.save(user).await.unwrap();

    let loaded = users.find_by_id(&user.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(loaded.rank, None);
}

#[tokio::test]
async fn relation_to_one_filter_matches_reference() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let users = CacheRepository::<User>::new(&node.ctx).await.unwrap();

    let rank = ranks.save(Rank::new(Some(7), "elite", 90)).await.unwrap();
    let mut alice = User::new("alice").with_id();
    alice.rank = Some(rank);
    users.save(alice).await.unwrap();
    users.save(User::new("carol").with_id()).await.unwrap();

    let elites = users.find_all_where("rank", 7).await.unwrap();
    assert_eq!(elites.len(), 1);
    assert_eq!(elites[0].username, "alice");
}

#[tokio::test]
async fn relation_to_many_filter_is_rejected() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let users = CacheRepository::<User>::new(&node.ctx).await.unwrap();

    let err = users.find_where("friends", "anyone").await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidQuery(_)));
}

#[tokio::test]
async fn relation_cycles_terminate() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let friends = CacheRepository::<Friend>::new(&node.ctx).await.unwrap();
    let users = CacheRepository::<User>::new(&node.ctx).await.unwrap();

    let mut a = Friend::new("a", 1);
    let mut b = Friend::new("b", 2);
    a.buddies = vec![b.clone()];
    b.buddies = vec![a.clone()];
    let a = friends.save(a).await.unwrap();
    let b = friends.save(b).await.unwrap();

    let loaded = friends.find_by_id(&a.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(loaded.buddies.len(), 1);
    assert_eq!(loaded.buddies[0].name, "b");
    // b's reference back to a sits on the current path and stays unresolved
    assert!(loaded.buddies[0].buddies.is_empty());

    let mut user = User::new("dave").with_id();
    user.friends = vec![a.clone(), b.clone()];
    let user = users.save(user).await.unwrap();
    let loaded = users.find_by_id(&user.id.unwrap()).await.unwrap().unwrap();
    let names: Vec<_> = loaded.friends.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(loaded.friends[0].buddies[0].name, "b");
}

// =============================================================================
// Replication
// =============================================================================

#[tokio::test]
async fn replica_peer_serves_replicated_save_from_own_cache() {
    let bus = MemoryBus::new();
    let a = TestNode::peer("a", &bus);
    let b = TestNode::peer("b", &bus);
    let members_a = ReplicaRepository::<Member>::new(&a.ctx).await.unwrap();
    let members_b = ReplicaRepository::<Member>::new(&b.ctx).await.unwrap();

    members_a.save(Member::new("u1", "Alice")).await.unwrap();
    settle().await;

    let coordinator = b.coordinator();
    assert_eq!(coordinator.run_dispatch_tick().await, 1);

    assert!(b.cache.peek("Member:u1").is_some());
    let found = members_b.find_by_id(&"u1".to_string()).await.unwrap().unwrap();
    assert_eq!(found.name, "Alice");
    assert!(b.store.is_none());
}

#[tokio::test]
async fn replica_delete_propagates() {
    let bus = MemoryBus::new();
    let a = TestNode::peer("a", &bus);
    let b = TestNode::peer("b", &bus);
    let members_a = ReplicaRepository::<Member>::new(&a.ctx).await.unwrap();
    let members_b = ReplicaRepository::<Member>::new(&b.ctx).await.unwrap();

    let alice = members_a.save(Member::new("u1", "Alice")).await.unwrap();
    settle().await;
    b.coordinator().run_dispatch_tick().await;
    assert!(members_b.find_by_id(&"u1".to_string()).await.unwrap().is_some());

    members_a.delete(&alice).await.unwrap();
    settle().await;
    b.coordinator().run_dispatch_tick().await;
    assert!(members_b.find_by_id(&"u1".to_string()).await.unwrap().is_none());
}

#[tokio::test]
async fn replica_receiver_persists_peer_mutations() {
    let bus = MemoryBus::new();
    let rx = TestNode::receiver("rx", &bus);
    let peer = TestNode::peer("peer", &bus);
    let members_rx = ReplicaRepository::<Member>::new(&rx.ctx).await.unwrap();
    let members_peer = ReplicaRepository::<Member>::new(&peer.ctx).await.unwrap();

    members_peer.save(Member::new("u2", "Bea")).await.unwrap();
    settle().await;
    rx.coordinator().run_dispatch_tick().await;

    let stored = rx.store().peek("members", "u2").await.unwrap();
    assert_eq!(stored["name"], "Bea");
    // Applied directly, never queued
    assert_eq!(members_rx.pending_len().await, 0);
}

#[tokio::test]
async fn replica_peer_save_overrides_receiver_queued_write() {
    let bus = MemoryBus::new();
    let rx = TestNode::receiver("rx", &bus);
    let peer = TestNode::peer("peer", &bus);
    let members_rx = ReplicaRepository::<Member>::new(&rx.ctx).await.unwrap();
    let members_peer = ReplicaRepository::<Member>::new(&peer.ctx).await.unwrap();

    members_rx.save(Member::new("u7", "local-old")).await.unwrap();
    assert_eq!(members_rx.pending_len().await, 1);

    members_peer.save(Member::new("u7", "remote-new")).await.unwrap();
    settle().await;
    let coordinator = rx.coordinator();
    coordinator.run_dispatch_tick().await;
    coordinator.run_flush_tick().await;

    let stored = rx.store().peek("members", "u7").await.unwrap();
    let cached = parse(&rx.cache.peek("Member:u7").unwrap());
    assert_eq!(stored["name"], "remote-new");
    assert_eq!(cached["name"], "remote-new");
}

#[tokio::test]
async fn replica_receiver_id_allocation_reaches_peers() {
    let bus = MemoryBus::new();
    let rx = TestNode::receiver("rx", &bus);
    let peer = TestNode::peer("peer", &bus);
    let ranks_rx = ReplicaRepository::<Rank>::new(&rx.ctx).await.unwrap();
    let ranks_peer = ReplicaRepository::<Rank>::new(&peer.ctx).await.unwrap();

    let saved = ranks_rx.save(Rank::new(None, "fresh", 1)).await.unwrap();
    settle().await;
    peer.coordinator().run_dispatch_tick().await;

    let seen = ranks_peer.find_by_id(&saved.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(seen.name, "fresh");
}

#[tokio::test]
async fn replica_reads_never_touch_bus() {
    let bus = MemoryBus::new();
    let a = TestNode::peer("a", &bus);
    let members = ReplicaRepository::<Member>::new(&a.ctx).await.unwrap();
    let mut tap = {
        use entity_relay::MessageBus;
        bus.subscribe("mutation:Member").await.unwrap()
    };

    members.find_by_id(&"u1".to_string()).await.unwrap();
    members.find_all_where("name", "x").await.unwrap();
    members.all().await.unwrap();
    assert!(tap.try_recv().is_err());
}

// =============================================================================
// Coordinator
// =============================================================================

#[tokio::test]
async fn coordinator_flush_loop_persists_writes() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let mut coordinator = node.coordinator();
    coordinator.start().await.unwrap();

    ranks.save(Rank::new(Some(1), "a", 1)).await.unwrap();
    let store = node.store().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let store = store.clone();
            async move { store.peek("ranks", "1").await.is_some() }
        })
        .await
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn coordinator_dispatch_loop_applies_envelopes() {
    let bus = MemoryBus::new();
    let a = TestNode::peer("a", &bus);
    let b = TestNode::peer("b", &bus);
    let members_a = ReplicaRepository::<Member>::new(&a.ctx).await.unwrap();
    let _members_b = ReplicaRepository::<Member>::new(&b.ctx).await.unwrap();
    let mut coordinator = b.coordinator();
    coordinator.start().await.unwrap();

    members_a.save(Member::new("u9", "Zed")).await.unwrap();
    let cache = b.cache.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let cache = cache.clone();
            async move { cache.peek("Member:u9").is_some() }
        })
        .await
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn coordinator_shutdown_drains_pending_writes() {
    let bus = MemoryBus::new();
    let mut config = entity_relay::RelayConfig::for_testing("rx", true);
    config.settings.flush.interval = "1h".to_string();
    let node = TestNode::build(config, std::sync::Arc::new(entity_relay::MemoryCache::new()), &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();

    let mut coordinator = FlushCoordinator::new(node.ctx.clone());
    coordinator.start().await.unwrap();
    // Let the first immediate tick pass
    tokio::time::sleep(Duration::from_millis(50)).await;

    for id in 1..=3 {
        ranks.save(Rank::new(Some(id), "late", 1)).await.unwrap();
    }
    coordinator.shutdown().await;

    assert_eq!(node.store().row_count("ranks").await, 3);
    assert_eq!(ranks.pending_len().await, 0);
}

#[tokio::test]
async fn coordinator_health_reports_repositories() {
    let bus = MemoryBus::new();
    let node = TestNode::receiver("rx", &bus);
    let ranks = CacheRepository::<Rank>::new(&node.ctx).await.unwrap();
    let _users = CacheRepository::<User>::new(&node.ctx).await.unwrap();
    ranks.save(Rank::new(Some(1), "a", 1)).await.unwrap();

    let coordinator = node.coordinator();
    let health = coordinator.health_check().await;
    let names: Vec<_> = health.repositories.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["ranks", "users"]);
    assert_eq!(health.repositories[0].pending, 1);
    assert!(health.cache_reachable);
}

// =============================================================================
// Redis (testcontainers)
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_cache_repository_round_trip() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);

    let ctx = RelayContext::connect(redis_config("rx", true, &url)).await.unwrap();
    let ranks = CacheRepository::<Rank>::new(&ctx).await.unwrap();

    ranks.save(Rank::new(Some(7), "elite", 90)).await.unwrap();
    let mut conn = raw_connection(&url).await;
    let raw: String = redis::cmd("GET").arg("Rank:7").query_async(&mut conn).await.unwrap();
    let value: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["name"], "elite");

    let found = ranks.find_where("power", 90).await.unwrap().unwrap();
    assert_eq!(found.id, Some(7));

    ranks.flush_updates().await.unwrap();
    ctx.cache().flush_all().await.unwrap();
    let reloaded = ranks.find_by_id(&7).await.unwrap().unwrap();
    assert_eq!(reloaded.name, "elite");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_ttl_expires_entries() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);

    let ctx = RelayContext::connect(redis_config("peer", false, &url)).await.unwrap();
    let ranks = CacheRepository::<Rank>::new(&ctx).await.unwrap();
    ranks.save(Rank::new(Some(1), "short", 1)).await.unwrap();
    assert!(ranks.expire(&1, Duration::from_millis(100)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ranks.find_by_id(&1).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_replication_between_nodes() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);

    let a = RelayContext::connect(redis_config("a", false, &url)).await.unwrap();
    let rx = RelayContext::connect(redis_config("rx", true, &url)).await.unwrap();
    let members_a = ReplicaRepository::<Member>::new(&a).await.unwrap();
    let _members_rx = ReplicaRepository::<Member>::new(&rx).await.unwrap();

    let mut coordinator = FlushCoordinator::new(rx.clone());
    coordinator.start().await.unwrap();

    members_a.save(Member::new("u1", "Alice")).await.unwrap();
    let store = rx.store().unwrap().clone();
    let table = entity_relay::StoreTable::for_entity::<Member>();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let store = store.clone();
            let table = table.clone();
            async move { matches!(store.get(&table, "u1").await, Ok(Some(_))) }
        })
        .await
    );

    coordinator.shutdown().await;
}
