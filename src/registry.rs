// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Repository registry.
//!
//! Maps a repository name (`users`) to the live repository for that type.
//! The codec resolves relationship references through it, and the dispatch
//! loop routes inbound envelopes with it.
//!
//! Entries are weak: dropping a repository makes its name available again.

use crate::codec::{RelationResolver, ResolveContext};
use crate::envelope::MutationEnvelope;
use crate::error::{BoxFuture, RelayError, Result};
use crate::repository::FlushReport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Type-erased view of a repository, as the registry and the coordinator see it.
pub trait RepositoryRef: Send + Sync + 'static {
    /// Simple entity type name (`User`).
    fn type_name(&self) -> &'static str;

    /// Registry name (`users`).
    fn repository_name(&self) -> &str;

    /// Writes waiting on the pending queue.
    fn pending_writes(&self) -> BoxFuture<'_, usize>;

    fn dead_letter_count(&self) -> usize;

    /// Drain the pending queue into the store.
    fn flush_updates(&self) -> BoxFuture<'_, FlushReport>;

    /// Apply a mutation received from another node.
    fn apply_remote(&self, envelope: MutationEnvelope) -> BoxFuture<'_, ()>;

    /// Look up an entity by id and return its materialized JSON tree, with
    /// its own relationships resolved under `ctx`.
    fn resolve_record<'a>(
        &'a self,
        id: &'a Value,
        ctx: &'a mut ResolveContext,
    ) -> BoxFuture<'a, Option<Value>>;

    /// Load every stored row into the cache. Returns the row count.
    fn warm(&self) -> BoxFuture<'_, usize>;
}

/// Name → repository map.
#[derive(Default)]
pub struct RepositoryRegistry {
    repositories: DashMap<String, Weak<dyn RepositoryRef>>,
    /// Type name → repository name, for envelope routing.
    by_type: DashMap<String, String>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository under its name.
    ///
    /// Fails if a live repository already holds the name.
    pub fn register(&self, repository: &Arc<dyn RepositoryRef>) -> Result<()> {
        let name = repository.repository_name().to_string();
        let type_name = repository.type_name().to_string();

        match self.repositories.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().upgrade().is_some() {
                    return Err(RelayError::DuplicateRepository(name));
                }
                occupied.insert(Arc::downgrade(repository));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(repository));
            }
        }
        self.by_type.insert(type_name.clone(), name.clone());

        debug!(repository = %name, type_name = %type_name, "Repository registered");
        Ok(())
    }

    /// Live repository by registry name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn RepositoryRef>> {
        self.repositories.get(name).and_then(|weak| weak.upgrade())
    }

    /// Live repository by entity type name, falling back to the registry name.
    pub fn by_type_name(&self, type_name: &str) -> Option<Arc<dyn RepositoryRef>> {
        let name = self.by_type.get(type_name).map(|n| n.value().clone());
        match name {
            Some(name) => self.get(&name),
            None => self.get(type_name),
        }
    }

    /// Every live repository, sorted by name.
    pub fn repositories(&self) -> Vec<Arc<dyn RepositoryRef>> {
        let mut live: Vec<_> = self
            .repositories
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        live.sort_by(|a, b| a.repository_name().cmp(b.repository_name()));
        live
    }

    /// Drop a name if its repository is gone. Returns whether it was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .repositories
            .remove_if(name, |_, weak| weak.upgrade().is_none())
            .is_some();
        if removed {
            self.by_type.retain(|_, repo| repo.as_str() != name);
            debug!(repository = %name, "Repository unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.repositories.iter().filter(|e| e.value().strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RelationResolver for RepositoryRegistry {
    fn resolve<'a>(
        &'a self,
        repository: &'a str,
        id: &'a Value,
        ctx: &'a mut ResolveContext,
    ) -> futures::future::BoxFuture<'a, Option<Value>> {
        Box::pin(async move {
            // Clone the Arc out so no map guard is held across the await
            let Some(repo) = self.get(repository) else {
                warn!(repository, id = %id, "Relationship targets an unknown repository");
                return None;
            };
            match repo.resolve_record(id, ctx).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(repository, id = %id, error = %e, "Failed to resolve relationship");
                    None
                }
            }
        })
    }
}
