// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutation envelopes: the unit published on the message bus.
//!
//! # Wire Format
//!
//! Envelopes travel as JSON on the channel `mutation:<TypeName>`:
//!
//! ```json
//! {
//!   "entityTypeName": "User",
//!   "kind": "SAVE",
//!   "entity": { "id": "u1", "name": "Alice", "rank_id": 7 },
//!   "origin": "node-a"
//! }
//! ```
//!
//! `entity` is the flat cache record produced by the codec. `origin` is the
//! publishing node; subscribers drop envelopes carrying their own node id.
//! Envelopes without `origin` are accepted from every node.

use crate::codec::{self, CacheRecord};
use crate::entity::Entity;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel prefix for mutation envelopes.
pub const CHANNEL_PREFIX: &str = "mutation:";

/// Channel carrying mutations of `type_name`.
pub fn channel_name(type_name: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, type_name)
}

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    #[serde(rename = "SAVE")]
    Save,
    #[serde(rename = "DELETE")]
    Delete,
    /// Placeholder kind; dispatch ignores it.
    #[serde(rename = "NONE")]
    Unspecified,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Save => write!(f, "SAVE"),
            MutationKind::Delete => write!(f, "DELETE"),
            MutationKind::Unspecified => write!(f, "NONE"),
        }
    }
}

/// A mutation of one entity, as published to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEnvelope {
    /// Simple type name; routes the envelope to its repository.
    pub entity_type_name: String,
    pub kind: MutationKind,
    /// Flat cache record of the entity.
    pub entity: CacheRecord,
    /// Node id of the publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl MutationEnvelope {
    /// Build an envelope for `entity`.
    pub fn new<T: Entity>(kind: MutationKind, entity: &T, origin: &str) -> Result<Self> {
        Ok(Self {
            entity_type_name: T::schema().type_name.to_string(),
            kind,
            entity: codec::encode(entity)?,
            origin: Some(origin.to_string()),
        })
    }

    pub fn save<T: Entity>(entity: &T, origin: &str) -> Result<Self> {
        Self::new(MutationKind::Save, entity, origin)
    }

    pub fn delete<T: Entity>(entity: &T, origin: &str) -> Result<Self> {
        Self::new(MutationKind::Delete, entity, origin)
    }

    /// Parse a bus payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(payload)
            .map_err(|e| RelayError::EnvelopeParse(format!("invalid envelope: {}", e)))?;
        if envelope.entity_type_name.is_empty() {
            return Err(RelayError::EnvelopeParse(
                "empty entityTypeName".to_string(),
            ));
        }
        Ok(envelope)
    }

    /// Serialize for publishing.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Channel this envelope is published on.
    pub fn channel(&self) -> String {
        channel_name(&self.entity_type_name)
    }

    /// Whether this node published the envelope.
    pub fn is_from(&self, node_id: &str) -> bool {
        self.origin.as_deref() == Some(node_id)
    }
}

/// An envelope waiting on the inbound queue, tagged with the repository
/// that received it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAction {
    pub envelope: MutationEnvelope,
    pub repository: String,
}
