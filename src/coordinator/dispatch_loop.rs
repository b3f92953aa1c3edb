// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch loop: applies received envelopes to their repositories.

use crate::context::RelayContext;
use crate::envelope::InboundAction;
use crate::metrics;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Drain the inbound queue once and apply each action.
///
/// The stop signal is checked between items; anything not yet dispatched goes
/// back to the head of the queue. Returns the number of actions applied.
pub(super) async fn dispatch_tick(ctx: &RelayContext) -> usize {
    let mut actions = ctx.inbound().drain().await.into_iter();
    let mut applied = 0;

    while let Some(action) = actions.next() {
        if ctx.is_shutting_down() {
            let mut remaining = vec![action];
            remaining.extend(actions);
            debug!(remaining = remaining.len(), "Stopping dispatch, requeueing remainder");
            ctx.inbound().requeue_front(remaining).await;
            break;
        }

        if dispatch_one(ctx, action).await {
            applied += 1;
        }
    }

    applied
}

async fn dispatch_one(ctx: &RelayContext, action: InboundAction) -> bool {
    let InboundAction { envelope, repository } = action;
    let type_name = envelope.entity_type_name.clone();

    let target = ctx
        .registry()
        .by_type_name(&type_name)
        .or_else(|| ctx.registry().get(&repository));

    let Some(target) = target else {
        warn!(
            entity_type = %type_name,
            repository = %repository,
            "No repository for received envelope"
        );
        metrics::record_dispatch(&type_name, false);
        return false;
    };

    let kind = envelope.kind;
    match target.apply_remote(envelope).await {
        Ok(()) => {
            debug!(entity_type = %type_name, kind = %kind, "Applied remote mutation");
            metrics::record_dispatch(&type_name, true);
            true
        }
        Err(e) => {
            warn!(entity_type = %type_name, kind = %kind, error = %e, "Dispatch failed");
            metrics::record_dispatch(&type_name, false);
            false
        }
    }
}

pub(super) async fn run_dispatch_loop(ctx: Arc<RelayContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let span = tracing::info_span!("dispatch_loop", node_id = %ctx.node_id());

    async move {
        let _ = shutdown_rx.borrow_and_update();

        let interval = ctx.config().settings.dispatch.interval_duration();
        info!(interval_ms = interval.as_millis() as u64, "Starting dispatch loop");

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                // Woken early by a push, otherwise once per interval
                _ = ctx.inbound().wait(interval) => {}
            }

            dispatch_tick(&ctx).await;
        }

        let left = ctx.inbound().len().await;
        info!(left, "Dispatch loop stopped");
    }
    .instrument(span)
    .await
}
