// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity codec: entity ↔ flat cache record.
//!
//! # Encoding
//!
//! [`encode()`] serializes an entity and flattens it with its
//! [`EntitySchema`](crate::entity::EntitySchema):
//!
//! ```text
//! User { id: "u1", name: "Alice", rank: Rank { id: 7, .. }, friends: [F1, F2] }
//!                                  │
//!                                  ▼
//! { "id": "u1", "name": "Alice", "rank_id": 7, "friends_ids": ["f1", "f2"] }
//! ```
//!
//! Null scalars and empty or null relationships are omitted. A cache record
//! never embeds another entity's body.
//!
//! # Decoding
//!
//! [`decode()`] coerces scalars to their declared type, normalizes the
//! identifier, then resolves every `<field>_id` / `<field>_ids` reference
//! through a [`RelationResolver`] (the repository registry in practice, which
//! routes to the related repository's read-through lookup). The resulting JSON
//! tree is handed to serde.
//!
//! Identifiers that resolve to nothing are left out, so `Option` fields decode
//! to `None` and collections skip the element. A [`ResolveContext`] tracks the
//! entities on the current resolution path: a reference back into the path, or
//! a path longer than `max_depth`, stays unresolved.

use crate::entity::{CollectionKind, Entity, EntityId, EntitySchema, FieldKind, ScalarType};
use crate::error::{RelayError, Result};
use serde_json::{Map, Number, Value};
use tracing::{debug, trace};
use uuid::Uuid;

/// Flat, JSON-object representation of an entity as stored in the cache.
pub type CacheRecord = Map<String, Value>;

/// Resolves a relationship reference to the related entity's JSON tree.
///
/// Returns `None` when the identifier is orphaned, the target repository is
/// unknown, or the reference would revisit an entity on the current path.
pub trait RelationResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        repository: &'a str,
        id: &'a Value,
        ctx: &'a mut ResolveContext,
    ) -> futures::future::BoxFuture<'a, Option<Value>>;
}

/// Resolution state for decoding one entity graph.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    path: Vec<String>,
    max_depth: usize,
}

impl ResolveContext {
    pub fn new(max_depth: usize) -> Self {
        Self {
            path: Vec::new(),
            max_depth,
        }
    }

    /// Number of entities on the current resolution path.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Push a node (`Type:id`) onto the path.
    ///
    /// Returns `false` without pushing if the node is already on the path
    /// (cycle) or the path is at `max_depth`.
    pub fn enter(&mut self, node: &str) -> bool {
        if self.path.iter().any(|p| p == node) {
            trace!(node, depth = self.path.len(), "Reference cycle, leaving unresolved");
            return false;
        }
        if self.path.len() >= self.max_depth {
            debug!(node, max_depth = self.max_depth, "Resolution depth limit reached");
            return false;
        }
        self.path.push(node.to_string());
        true
    }

    /// Pop a node previously accepted by [`enter()`](Self::enter).
    pub fn leave(&mut self, node: &str) {
        if self.path.last().map(String::as_str) == Some(node) {
            self.path.pop();
        }
    }
}

/// Node key used on the resolution path and as the cache key.
pub fn node_key(type_name: &str, id_key: &str) -> String {
    format!("{}:{}", type_name, id_key)
}

/// Encode an entity into its flat cache record.
pub fn encode<T: Entity>(entity: &T) -> Result<CacheRecord> {
    let schema = T::schema();
    match serde_json::to_value(entity)? {
        Value::Object(object) => Ok(flatten(schema, object)),
        other => Err(RelayError::codec(format!(
            "{} serialized to {} instead of an object",
            schema.type_name,
            json_kind(&other)
        ))),
    }
}

/// Flatten a serialized entity object according to its schema.
pub fn flatten(schema: &EntitySchema, mut object: Map<String, Value>) -> CacheRecord {
    let mut record = CacheRecord::new();

    for field in schema.relations() {
        let Some(raw) = object.remove(field.name) else {
            continue;
        };
        match field.kind {
            FieldKind::ToOne { target_id, .. } => {
                if let Some(id) = reference_id(&raw, target_id) {
                    record.insert(field.record_key(), id);
                }
            }
            FieldKind::ToMany { target_id, .. } => {
                if let Value::Array(items) = raw {
                    let ids: Vec<Value> = items
                        .iter()
                        .filter_map(|item| reference_id(item, target_id))
                        .collect();
                    if !ids.is_empty() {
                        record.insert(field.record_key(), Value::Array(ids));
                    }
                }
            }
            FieldKind::Scalar(_) => {}
        }
    }

    for (key, value) in object {
        if !value.is_null() {
            record.insert(key, value);
        }
    }

    record
}

/// Identifier of a related value: the id key of a nested object, or the
/// value itself when it is already a bare reference.
fn reference_id(value: &Value, target_id: &str) -> Option<Value> {
    match value {
        Value::Object(nested) => nested.get(target_id).filter(|v| !v.is_null()).cloned(),
        Value::String(s) if !s.is_empty() => Some(value.clone()),
        Value::Number(_) => Some(value.clone()),
        _ => None,
    }
}

/// Decode a cache record into `T`, resolving relationships through `resolver`.
pub async fn decode<T: Entity>(
    record: CacheRecord,
    resolver: &dyn RelationResolver,
    ctx: &mut ResolveContext,
) -> Result<T> {
    let tree = materialize::<T>(record, resolver, ctx).await;
    serde_json::from_value(Value::Object(tree))
        .map_err(|e| RelayError::codec(format!("{}: {}", T::schema().type_name, e)))
}

/// Decode a top-level record. The entity itself starts the resolution path,
/// so a reference straight back to it stays unresolved.
pub async fn decode_root<T: Entity>(
    record: CacheRecord,
    resolver: &dyn RelationResolver,
    max_depth: usize,
) -> Result<T> {
    let schema = T::schema();
    let mut ctx = ResolveContext::new(max_depth);
    if let Some(id) = record_id_key(schema, &record) {
        ctx.enter(&node_key(schema.type_name, &id));
    }
    decode(record, resolver, &mut ctx).await
}

/// Decode a record without resolving any relationship. Relationship fields
/// come out empty; used to validate records received from peers.
pub async fn decode_shallow<T: Entity>(record: CacheRecord) -> Result<T> {
    decode(record, &Unresolved, &mut ResolveContext::new(0)).await
}

struct Unresolved;

impl RelationResolver for Unresolved {
    fn resolve<'a>(
        &'a self,
        _repository: &'a str,
        _id: &'a Value,
        _ctx: &'a mut ResolveContext,
    ) -> futures::future::BoxFuture<'a, Option<Value>> {
        Box::pin(async { None })
    }
}

/// Coerce scalars and resolve references, producing the JSON tree serde
/// deserializes `T` from.
pub async fn materialize<T: Entity>(
    mut record: CacheRecord,
    resolver: &dyn RelationResolver,
    ctx: &mut ResolveContext,
) -> CacheRecord {
    let schema = T::schema();

    if let Some(id) = record.get(schema.id_field).and_then(T::Id::from_json) {
        record.insert(schema.id_field.to_string(), id.to_json());
    }

    for field in schema.fields {
        match field.kind {
            FieldKind::Scalar(ty) => {
                if let Some(value) = record.remove(field.name) {
                    record.insert(field.name.to_string(), coerce(value, ty));
                }
            }
            FieldKind::ToOne { target, .. } => {
                let reference = record.remove(&field.record_key());
                record.remove(field.name);
                let Some(id) = reference.filter(|v| !v.is_null()) else {
                    continue;
                };
                if let Some(related) = resolver.resolve(target, &id, ctx).await {
                    record.insert(field.name.to_string(), related);
                }
            }
            FieldKind::ToMany {
                target, collection, ..
            } => {
                let ids = match record.remove(&field.record_key()) {
                    Some(Value::Array(ids)) => ids,
                    Some(Value::Null) | None => {
                        record.remove(field.name);
                        continue;
                    }
                    Some(single) => vec![single],
                };
                record.remove(field.name);

                let ids = match collection {
                    CollectionKind::List => ids,
                    CollectionKind::Set => dedupe(ids),
                };

                let mut items = Vec::with_capacity(ids.len());
                for id in &ids {
                    if let Some(related) = resolver.resolve(target, id, ctx).await {
                        items.push(related);
                    }
                }
                record.insert(field.name.to_string(), Value::Array(items));
            }
        }
    }

    record
}

fn dedupe(ids: Vec<Value>) -> Vec<Value> {
    let mut seen: Vec<String> = Vec::with_capacity(ids.len());
    ids.into_iter()
        .filter(|id| {
            let key = id_key(id).unwrap_or_else(|| id.to_string());
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        })
        .collect()
}

/// Coerce a stored scalar into the declared type where the conversion is
/// lossless or conventional. Anything else is returned unchanged.
pub fn coerce(value: Value, ty: ScalarType) -> Value {
    match (ty, value) {
        (ScalarType::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(s),
        },
        (ScalarType::Integer, Value::Number(n)) if n.is_f64() => match n.as_f64() {
            Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Value::from(f.trunc() as i64),
            _ => Value::Number(n),
        },
        (ScalarType::Float, Value::String(s)) => {
            match s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
                Some(n) => Value::Number(n),
                None => Value::String(s),
            }
        }
        (ScalarType::Text, Value::Number(n)) => Value::String(n.to_string()),
        (ScalarType::Text, Value::Bool(b)) => Value::String(b.to_string()),
        (ScalarType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::String(s),
        },
        (ScalarType::Bool, Value::Number(n)) => match n.as_i64() {
            Some(0) => Value::Bool(false),
            Some(1) => Value::Bool(true),
            _ => Value::Number(n),
        },
        (ScalarType::Uuid, Value::String(s)) => match Uuid::parse_str(s.trim()) {
            Ok(id) => Value::String(id.hyphenated().to_string()),
            Err(_) => Value::String(s),
        },
        (_, value) => value,
    }
}

/// Key form of an identifier value (`"u1"`, `7`, ...).
pub fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Identifier key of a record, if it carries one.
pub fn record_id_key(schema: &EntitySchema, record: &CacheRecord) -> Option<String> {
    record.get(schema.id_field).and_then(id_key)
}

/// Record key a filter on `field` compares against.
///
/// To-one fields compare their identifier (`rank` → `rank_id`). To-many
/// fields cannot be used as an equality filter against the store.
pub fn storage_field(schema: &EntitySchema, field: &str) -> Result<String> {
    if field == schema.id_field {
        return Ok(field.to_string());
    }
    match schema.field(field) {
        Some(f) => match f.kind {
            FieldKind::Scalar(_) | FieldKind::ToOne { .. } => Ok(f.record_key()),
            FieldKind::ToMany { .. } => Err(RelayError::InvalidQuery(format!(
                "{}.{} is a to-many relationship",
                schema.type_name, field
            ))),
        },
        None => Ok(field.to_string()),
    }
}

/// Whether a cached record matches `field == expected` (loose equality).
///
/// To-many fields match when any referenced id equals `expected`.
pub fn field_matches(schema: &EntitySchema, record: &CacheRecord, field: &str, expected: &Value) -> bool {
    if let Some(f) = schema.field(field) {
        if let FieldKind::ToMany { .. } = f.kind {
            return match record.get(&f.record_key()) {
                Some(Value::Array(ids)) => ids.iter().any(|id| loosely_equal(id, expected)),
                _ => false,
            };
        }
        return record
            .get(&f.record_key())
            .map(|v| loosely_equal(v, expected))
            .unwrap_or(false);
    }
    record
        .get(field)
        .map(|v| loosely_equal(v, expected))
        .unwrap_or(false)
}

/// Equality that treats `7`, `7.0` and `"7"` (or `true` and `"true"`) as equal.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return x.as_f64() == y.as_f64();
    }
    match (scalar_text(a), scalar_text(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
