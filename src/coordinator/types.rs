// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coordinator state and health types.
//!
//! # State Transitions
//!
//! ```text
//!            start()
//! Created ──────────→ Running
//!    │                   │
//!    │ shutdown()        │ shutdown()
//!    ↓                   ↓
//! Stopped ←──────── ShuttingDown
//! ```
//!
//! - **Created**: after `FlushCoordinator::new()`. No loops spawned.
//! - **Running**: flush loop (receiver) and dispatch loop are live.
//! - **ShuttingDown**: loops signalled; waiting up to the shutdown grace.
//! - **Stopped**: loops gone, worker pool closed. Cannot be restarted.

use serde::Serialize;

/// Lifecycle state of the [`FlushCoordinator`](super::FlushCoordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    /// Call [`start()`](super::FlushCoordinator::start) to spawn the loops.
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Created => write!(f, "Created"),
            CoordinatorState::Running => write!(f, "Running"),
            CoordinatorState::ShuttingDown => write!(f, "ShuttingDown"),
            CoordinatorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Health snapshot for monitoring endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: CoordinatorState,
    /// Whether this node owns the durable store.
    pub receiver: bool,
    /// Result of a cache PING taken for this snapshot.
    pub cache_reachable: bool,
    /// Received envelopes not yet dispatched.
    pub inbound_depth: usize,
    pub repositories: Vec<RepositoryHealth>,
    /// Running, cache reachable, and no dead letters anywhere.
    pub healthy: bool,
}

/// Per-repository queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryHealth {
    pub name: String,
    pub pending: usize,
    pub dead_letters: usize,
}
