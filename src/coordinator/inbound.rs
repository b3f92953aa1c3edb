// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound action queue.
//!
//! Subscription tasks push envelopes received from other nodes; the dispatch
//! loop is the only consumer. Pushing wakes the dispatch loop early.

use crate::envelope::InboundAction;
use crate::metrics;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Process-wide FIFO of received mutations.
#[derive(Default)]
pub struct InboundQueue {
    actions: Mutex<VecDeque<InboundAction>>,
    notify: Notify,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, action: InboundAction) {
        let depth = {
            let mut actions = self.actions.lock().await;
            actions.push_back(action);
            actions.len()
        };
        metrics::set_inbound_depth(depth);
        self.notify.notify_one();
    }

    /// Take everything currently queued.
    pub async fn drain(&self) -> Vec<InboundAction> {
        let drained: Vec<InboundAction> = std::mem::take(&mut *self.actions.lock().await).into();
        metrics::set_inbound_depth(0);
        drained
    }

    /// Put undispatched actions back at the head, ahead of anything pushed since.
    pub async fn requeue_front(&self, remaining: Vec<InboundAction>) {
        if remaining.is_empty() {
            return;
        }
        let depth = {
            let mut actions = self.actions.lock().await;
            for action in remaining.into_iter().rev() {
                actions.push_front(action);
            }
            actions.len()
        };
        metrics::set_inbound_depth(depth);
    }

    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actions.lock().await.is_empty()
    }

    /// Wait until something is pushed or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
