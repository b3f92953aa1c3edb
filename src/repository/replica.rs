// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica repository: a cache repository that propagates its mutations.
//!
//! Local writes are published on `mutation:<TypeName>` before they are
//! applied locally. Every node subscribes to the same channel; received
//! envelopes land on the inbound action queue and are applied by the
//! dispatch loop, never inline on the subscription task.
//!
//! Publishing first means delivery is at-least-once: a peer may apply a
//! mutation the origin then fails to write.

use super::cached::CacheRepository;
use super::pending::{DeadLetter, FlushReport};
use crate::context::RelayContext;
use crate::coordinator::InboundQueue;
use crate::entity::Entity;
use crate::envelope::{InboundAction, MutationEnvelope, MutationKind};
use crate::error::{RelayError, Result};
use crate::gateway::StoreGateway;
use crate::metrics;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Replicated repository for entity type `T`.
pub struct ReplicaRepository<T: Entity> {
    inner: Arc<CacheRepository<T>>,
    channel: String,
    subscription: JoinHandle<()>,
}

impl<T: Entity> ReplicaRepository<T> {
    /// Build the inner cache repository and subscribe to the type's channel.
    pub async fn new(ctx: &Arc<RelayContext>) -> Result<Self> {
        let inner = CacheRepository::<T>::new(ctx).await?;
        let schema = T::schema();
        let channel = schema.channel();

        let payloads = ctx.bus().subscribe(&channel).await?;
        let subscriber = Subscriber {
            channel: channel.clone(),
            type_name: schema.type_name,
            repository: inner.name().to_string(),
            node_id: ctx.node_id().to_string(),
            inbound: Arc::clone(ctx.inbound()),
        };
        let subscription = tokio::spawn(subscriber.run(payloads, ctx.shutdown_signal()));

        info!(channel = %channel, repository = %inner.name(), "Replica repository subscribed");
        Ok(Self {
            inner,
            channel,
            subscription,
        })
    }

    /// Publish SAVE, then save locally.
    ///
    /// An entity without an id is saved locally first (the receiver allocates
    /// the id) and published afterwards, so the envelope carries the id.
    pub async fn save(&self, entity: T) -> Result<T> {
        if entity.id().is_none() {
            let saved = self.inner.save(entity).await?;
            self.publish(MutationKind::Save, &saved).await?;
            return Ok(saved);
        }

        self.publish(MutationKind::Save, &entity).await?;
        self.inner.save(entity).await
    }

    /// Publish DELETE, then delete locally.
    pub async fn delete(&self, entity: &T) -> Result<()> {
        if entity.id().is_none() {
            return Err(RelayError::MissingId {
                entity_type: T::schema().type_name.to_string(),
            });
        }
        self.publish(MutationKind::Delete, entity).await?;
        self.inner.delete(entity).await
    }

    pub async fn find_by_id(&self, id: &T::Id) -> Result<Option<T>> {
        self.inner.find_by_id(id).await
    }

    pub async fn find_where(&self, field: &str, value: impl Into<Value>) -> Result<Option<T>> {
        self.inner.find_where(field, value).await
    }

    pub async fn find_all_where(&self, field: &str, value: impl Into<Value>) -> Result<Vec<T>> {
        self.inner.find_all_where(field, value).await
    }

    pub async fn all(&self) -> Result<Vec<T>> {
        self.inner.all().await
    }

    pub async fn expire(&self, id: &T::Id, ttl: Duration) -> Result<bool> {
        self.inner.expire(id, ttl).await
    }

    pub async fn flush_updates(&self) -> Result<FlushReport> {
        self.inner.flush_updates().await
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.pending_len().await
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters()
    }

    pub fn gateway(&self) -> Option<&StoreGateway<T>> {
        self.inner.gateway()
    }

    /// The wrapped cache repository.
    pub fn inner(&self) -> &Arc<CacheRepository<T>> {
        &self.inner
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the subscription task is still running.
    pub fn is_subscribed(&self) -> bool {
        !self.subscription.is_finished()
    }

    async fn publish(&self, kind: MutationKind, entity: &T) -> Result<()> {
        let type_name = T::schema().type_name;
        let ctx = self.inner.context();
        let envelope = MutationEnvelope::new(kind, entity, ctx.node_id())?;
        let payload = envelope.to_json()?;

        let result = ctx.bus().publish(&self.channel, payload).await;
        metrics::record_publish(type_name, &kind.to_string(), result.is_ok());
        if let Err(e) = &result {
            warn!(channel = %self.channel, kind = %kind, error = %e, "Publish failed");
        }
        result
    }
}

impl<T: Entity> Drop for ReplicaRepository<T> {
    fn drop(&mut self) {
        self.subscription.abort();
    }
}

/// Forwards payloads from one channel subscription to the inbound queue.
struct Subscriber {
    channel: String,
    type_name: &'static str,
    repository: String,
    node_id: String,
    inbound: Arc<InboundQueue>,
}

impl Subscriber {
    async fn run(self, mut payloads: mpsc::UnboundedReceiver<String>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                payload = payloads.recv() => {
                    match payload {
                        Some(payload) => self.accept(&payload).await,
                        None => {
                            debug!(channel = %self.channel, "Subscription stream ended");
                            break;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(channel = %self.channel, "Subscription task stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn accept(&self, payload: &str) {
        let envelope = match MutationEnvelope::from_json(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Dropping malformed envelope");
                metrics::record_envelope_dropped(&self.channel, "malformed");
                return;
            }
        };

        if envelope.entity_type_name != self.type_name {
            warn!(
                channel = %self.channel,
                entity_type = %envelope.entity_type_name,
                "Dropping envelope for another type"
            );
            metrics::record_envelope_dropped(&self.channel, "wrong_type");
            return;
        }

        if envelope.is_from(&self.node_id) {
            debug!(channel = %self.channel, "Dropping own envelope");
            metrics::record_envelope_dropped(&self.channel, "self_origin");
            return;
        }

        if envelope.kind == MutationKind::Unspecified {
            debug!(channel = %self.channel, "Dropping NONE envelope");
            metrics::record_envelope_dropped(&self.channel, "no_op");
            return;
        }

        self.inbound
            .push(InboundAction {
                envelope,
                repository: self.repository.clone(),
            })
            .await;
    }
}
