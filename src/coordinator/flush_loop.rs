// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flush loop: moves pending writes into the durable store.
//!
//! Runs on the receiver only. Each tick pings the cache first; while the cache
//! is unreachable the loop backs off exponentially instead of draining queues
//! it cannot confirm against. A failing repository is logged and skipped, it
//! never stops the loop.
//!
//! ```text
//! tick ──→ PING cache ──ok──→ flush_updates() per repository
//!              │
//!              └─fail──→ sleep(delay_for_attempt(n)) ──→ tick
//! ```

use crate::context::RelayContext;
use crate::metrics;
use crate::repository::FlushReport;
use std::sync::Arc;
use tokio::sync::watch;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

const FINAL_DRAIN_RETRIES: usize = 5;
const FINAL_DRAIN_PAUSE: Duration = Duration::from_millis(10);

/// Flush every registered repository once.
pub(super) async fn flush_tick(ctx: &RelayContext) -> Vec<FlushReport> {
    let repositories = ctx.registry().repositories();
    let mut reports = Vec::with_capacity(repositories.len());

    for repository in repositories {
        match repository.flush_updates().await {
            Ok(report) => {
                if !report.is_empty() {
                    debug!(
                        repository = %report.repository,
                        applied = report.applied,
                        requeued = report.requeued,
                        dead_lettered = report.dead_lettered,
                        "Flush tick"
                    );
                }
                reports.push(report);
            }
            Err(e) => {
                warn!(
                    repository = %repository.repository_name(),
                    error = %e,
                    "Flush failed"
                );
            }
        }
    }

    reports
}

pub(super) async fn run_flush_loop(ctx: Arc<RelayContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let span = tracing::info_span!("flush_loop", node_id = %ctx.node_id());

    async move {
        let _ = shutdown_rx.borrow_and_update();

        let flush = &ctx.config().settings.flush;
        let interval = flush.interval_duration();
        let backoff = flush.retry_config();

        info!(interval_ms = interval.as_millis() as u64, "Starting flush loop");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cache_failures: usize = 0;

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            if let Err(e) = ctx.cache().ping().await {
                cache_failures += 1;
                let delay = backoff.delay_for_attempt(cache_failures);
                warn!(
                    consecutive_failures = cache_failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Cache unreachable, backing off"
                );
                metrics::record_cache_backoff(delay);

                tokio::select! {
                    biased;
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            if cache_failures > 0 {
                info!(after_failures = cache_failures, "Cache reachable again");
                cache_failures = 0;
            }

            flush_tick(&ctx).await;
        }

        info!("Shutdown signal received, draining pending writes");
        let mut reports = flush_tick(&ctx).await;
        let mut applied: usize = reports.iter().map(|r| r.applied).sum();
        // A drain skipped because a remote apply holds the lock gets another go
        for _ in 0..FINAL_DRAIN_RETRIES {
            if !reports.iter().any(|r| r.skipped) {
                break;
            }
            tokio::time::sleep(FINAL_DRAIN_PAUSE).await;
            reports = flush_tick(&ctx).await;
            applied += reports.iter().map(|r| r.applied).sum::<usize>();
        }
        let left: usize = reports.iter().map(|r| r.requeued).sum();
        if left > 0 {
            warn!(applied, left, "Final drain left writes queued");
        } else {
            info!(applied, "Flush loop stopped");
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBus, MemoryCache};
    use crate::config::RelayConfig;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_flush_tick_without_repositories() {
        let ctx = RelayContext::builder(RelayConfig::for_testing("rx", true))
            .cache(Arc::new(MemoryCache::new()))
            .bus(Arc::new(MemoryBus::new()))
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        assert!(flush_tick(&ctx).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_on_shutdown_while_backing_off() {
        let cache = Arc::new(MemoryCache::new());
        cache.set_available(false);
        let ctx = RelayContext::builder(RelayConfig::for_testing("rx", true))
            .cache(cache)
            .bus(Arc::new(MemoryBus::new()))
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();

        let handle = tokio::spawn(run_flush_loop(Arc::clone(&ctx), ctx.shutdown_signal()));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        ctx.signal_shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
