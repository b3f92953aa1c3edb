// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flush coordinator.
//!
//! Owns the two background loops of a node:
//! - the flush loop ([`flush_loop`]), receiver only, which drains every
//!   repository's pending writes into the durable store
//! - the dispatch loop ([`dispatch_loop`]), which applies envelopes received
//!   from other nodes
//!
//! # Lifecycle
//!
//! 1. Build repositories against a [`RelayContext`]
//! 2. `start()` spawns the loops
//! 3. `shutdown()` signals them, waits up to the shutdown grace, then aborts
//!    whatever is left and closes the worker pool

mod dispatch_loop;
mod flush_loop;
mod inbound;
mod types;

pub use inbound::InboundQueue;
pub use types::{CoordinatorState, HealthCheck, RepositoryHealth};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::repository::FlushReport;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Drives flushing and dispatch for one node.
pub struct FlushCoordinator {
    ctx: Arc<RelayContext>,

    /// Coordinator state (broadcast to watchers)
    state_tx: watch::Sender<CoordinatorState>,
    state_rx: watch::Receiver<CoordinatorState>,

    /// Loop task handles, named for shutdown logging
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl FlushCoordinator {
    /// Create a coordinator in the `Created` state.
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Created);
        Self {
            ctx,
            state_tx,
            state_rx,
            handles: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CoordinatorState::Running
    }

    fn set_state(&self, state: CoordinatorState) {
        let _ = self.state_tx.send(state);
        metrics::set_coordinator_state(&state.to_string());
    }

    /// Spawn the background loops.
    ///
    /// The flush loop runs only on the receiver. The dispatch loop runs on the
    /// receiver, and on other nodes when `settings.dispatch.on_non_receiver`
    /// is set.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != CoordinatorState::Created {
            return Err(RelayError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let receiver = self.ctx.is_receiver();
        let dispatch = receiver || self.ctx.config().settings.dispatch.on_non_receiver;

        info!(
            node_id = %self.ctx.node_id(),
            receiver,
            repositories = self.ctx.registry().len(),
            "Starting flush coordinator"
        );

        if receiver {
            let handle = tokio::spawn(flush_loop::run_flush_loop(
                Arc::clone(&self.ctx),
                self.ctx.shutdown_signal(),
            ));
            self.handles.push(("flush", handle));
        }

        if dispatch {
            let handle = tokio::spawn(dispatch_loop::run_dispatch_loop(
                Arc::clone(&self.ctx),
                self.ctx.shutdown_signal(),
            ));
            self.handles.push(("dispatch", handle));
        }

        self.set_state(CoordinatorState::Running);
        info!(loops = self.handles.len(), "Flush coordinator running");
        Ok(())
    }

    /// Run one flush pass over every repository, outside the loop.
    ///
    /// Useful for tests and for nodes that drive flushing themselves.
    pub async fn run_flush_tick(&self) -> Vec<FlushReport> {
        flush_loop::flush_tick(&self.ctx).await
    }

    /// Drain the inbound queue once. Returns the number of actions applied.
    pub async fn run_dispatch_tick(&self) -> usize {
        dispatch_loop::dispatch_tick(&self.ctx).await
    }

    /// Stop the loops gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal every loop and subscription task
    /// 2. Wait for the loops (the flush loop runs a final drain) up to
    ///    `settings.flush.shutdown_grace`
    /// 3. Abort whatever is still running
    /// 4. Close the worker pool so async repository calls fail fast
    pub async fn shutdown(&mut self) {
        if self.state() == CoordinatorState::Stopped {
            return;
        }

        info!(node_id = %self.ctx.node_id(), "Shutting down flush coordinator");
        self.set_state(CoordinatorState::ShuttingDown);
        self.ctx.signal_shutdown();

        let grace = self.ctx.config().settings.flush.shutdown_grace_duration();
        let deadline = Instant::now() + grace;

        for (name, mut handle) in std::mem::take(&mut self.handles) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = name, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = name, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = name, "Task exceeded shutdown grace, aborting");
                    handle.abort();
                }
            }
        }

        self.ctx.workers().close();

        self.set_state(CoordinatorState::Stopped);
        info!("Flush coordinator stopped");
    }

    /// Health snapshot. Performs one cache PING; everything else is local state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let cache_reachable = self.ctx.cache().ping().await.is_ok();
        let inbound_depth = self.ctx.inbound().len().await;

        let mut repositories = Vec::new();
        for repository in self.ctx.registry().repositories() {
            let pending = match repository.pending_writes().await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(repository = %repository.repository_name(), error = %e, "Pending count unavailable");
                    0
                }
            };
            repositories.push(RepositoryHealth {
                name: repository.repository_name().to_string(),
                pending,
                dead_letters: repository.dead_letter_count(),
            });
        }

        let healthy = state == CoordinatorState::Running
            && cache_reachable
            && repositories.iter().all(|r| r.dead_letters == 0);

        HealthCheck {
            state,
            receiver: self.ctx.is_receiver(),
            cache_reachable,
            inbound_depth,
            repositories,
            healthy,
        }
    }
}

impl Drop for FlushCoordinator {
    fn drop(&mut self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}
