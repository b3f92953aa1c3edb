// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity model.
//!
//! An [`Entity`] is a serde-serializable record type with a stable identifier
//! and a static [`EntitySchema`] describing which of its fields are plain
//! scalars and which point at other entities. The codec reads the schema to
//! flatten relationships into identifier references and to resolve them again.
//!
//! # Example
//!
//! ```rust
//! use entity_relay::entity::{Entity, EntitySchema, Field, ScalarType};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! #[serde(default)]
//! struct Rank {
//!     id: Option<i64>,
//!     name: String,
//!     power: i32,
//! }
//!
//! impl Entity for Rank {
//!     type Id = i64;
//!
//!     fn schema() -> &'static EntitySchema {
//!         static SCHEMA: EntitySchema = EntitySchema::new(
//!             "Rank",
//!             &[
//!                 Field::scalar("name", ScalarType::Text),
//!                 Field::scalar("power", ScalarType::Integer),
//!             ],
//!         );
//!         &SCHEMA
//!     }
//!
//!     fn id(&self) -> Option<i64> {
//!         self.id
//!     }
//!
//!     fn set_id(&mut self, id: i64) {
//!         self.id = Some(id);
//!     }
//! }
//!
//! assert_eq!(Rank::schema().repository_name(), "ranks");
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// How the durable store allocates identifiers for new rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// Monotonic integer sequence per table.
    Sequence,
    /// Time-ordered UUID (v7), stored as its hyphenated string.
    Generated,
}

/// An entity identifier.
///
/// Implemented for `i64` (sequence ids), `String` and `Uuid` (generated ids).
pub trait EntityId:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Allocation strategy used when a receiver persists an entity without an id.
    const STRATEGY: IdStrategy;

    /// Parse an identifier out of a cache record value, coercing where the
    /// representation is unambiguous (numeric strings, UUID strings).
    fn from_json(value: &Value) -> Option<Self>;

    /// The identifier as a JSON value, in the form written to cache records.
    fn to_json(&self) -> Value;

    /// The identifier as it appears in cache keys and store primary keys.
    fn to_key(&self) -> String {
        self.to_string()
    }
}

impl EntityId for i64 {
    const STRATEGY: IdStrategy = IdStrategy::Sequence;

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        Value::from(*self)
    }
}

impl EntityId for String {
    const STRATEGY: IdStrategy = IdStrategy::Generated;

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        Value::String(self.clone())
    }
}

impl EntityId for Uuid {
    const STRATEGY: IdStrategy = IdStrategy::Generated;

    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| Uuid::parse_str(s.trim()).ok())
    }

    fn to_json(&self) -> Value {
        Value::String(self.hyphenated().to_string())
    }
}

/// A record type managed by a repository.
///
/// The serde representation must be a JSON object whose keys match the
/// field names in [`schema()`](Entity::schema). Relationship fields hold the
/// related entity (to-one, usually `Option<R>`) or a collection of them
/// (to-many, `Vec<R>`). Structs should use `#[serde(default)]` so records
/// with absent optional fields still decode.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Identifier type.
    type Id: EntityId;

    /// Static field description for this type.
    fn schema() -> &'static EntitySchema;

    /// The identifier, if one has been assigned.
    fn id(&self) -> Option<Self::Id>;

    /// Assign the identifier (called after the store allocates one).
    fn set_id(&mut self, id: Self::Id);
}

/// Scalar value kinds the codec knows how to coerce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    /// Leave the value exactly as stored.
    Any,
    Integer,
    Float,
    Text,
    Bool,
    Uuid,
}

/// Collection semantics for to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Ordered, duplicates allowed.
    List,
    /// Duplicate identifiers collapse to one element, first occurrence wins.
    Set,
}

/// What a declared field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarType),
    /// Reference to one entity owned by the repository named `target`.
    ToOne {
        target: &'static str,
        target_id: &'static str,
    },
    /// Ordered references to entities owned by the repository named `target`.
    ToMany {
        target: &'static str,
        target_id: &'static str,
        collection: CollectionKind,
    },
}

/// One declared field of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub const fn scalar(name: &'static str, ty: ScalarType) -> Self {
        Self {
            name,
            kind: FieldKind::Scalar(ty),
        }
    }

    /// To-one relationship. `target` is the related repository's registry name.
    pub const fn to_one(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::ToOne {
                target,
                target_id: "id",
            },
        }
    }

    /// Ordered to-many relationship.
    pub const fn to_many(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::ToMany {
                target,
                target_id: "id",
                collection: CollectionKind::List,
            },
        }
    }

    /// To-many relationship with set semantics.
    pub const fn to_set(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::ToMany {
                target,
                target_id: "id",
                collection: CollectionKind::Set,
            },
        }
    }

    /// Override the related entity's identifier key (default `"id"`).
    pub const fn keyed_by(self, target_id: &'static str) -> Self {
        let kind = match self.kind {
            FieldKind::ToOne { target, .. } => FieldKind::ToOne { target, target_id },
            FieldKind::ToMany {
                target, collection, ..
            } => FieldKind::ToMany {
                target,
                target_id,
                collection,
            },
            scalar => scalar,
        };
        Self {
            name: self.name,
            kind,
        }
    }

    /// Cache record key this field is stored under.
    ///
    /// Scalars keep their name; to-one becomes `<name>_id`, to-many `<name>_ids`.
    pub fn record_key(&self) -> String {
        match self.kind {
            FieldKind::Scalar(_) => self.name.to_string(),
            FieldKind::ToOne { .. } => format!("{}_id", self.name),
            FieldKind::ToMany { .. } => format!("{}_ids", self.name),
        }
    }

    pub fn is_relation(&self) -> bool {
        !matches!(self.kind, FieldKind::Scalar(_))
    }
}

/// Static description of an entity type.
#[derive(Debug, PartialEq, Eq)]
pub struct EntitySchema {
    /// Simple type name. Used for cache key prefixes, channel names and
    /// envelope routing.
    pub type_name: &'static str,
    /// Identifier key in the serialized record.
    pub id_field: &'static str,
    pub fields: &'static [Field],
}

impl EntitySchema {
    pub const fn new(type_name: &'static str, fields: &'static [Field]) -> Self {
        Self {
            type_name,
            id_field: "id",
            fields,
        }
    }

    /// Use a different identifier key than `"id"`.
    pub const fn with_id_field(mut self, id_field: &'static str) -> Self {
        self.id_field = id_field;
        self
    }

    /// Registry name: lowercase type name plus `s` (`User` → `users`).
    pub fn repository_name(&self) -> String {
        format!("{}s", self.type_name.to_lowercase())
    }

    /// Pub/sub channel carrying mutations of this type.
    pub fn channel(&self) -> String {
        crate::envelope::channel_name(self.type_name)
    }

    /// Declared field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Relationship fields only.
    pub fn relations(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_relation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    static USER: EntitySchema = EntitySchema::new(
        "User",
        &[
            Field::scalar("username", ScalarType::Text),
            Field::to_one("rank", "ranks"),
            Field::to_many("friends", "friends").keyed_by("uuid"),
        ],
    );

    #[test]
    fn test_repository_name() {
        assert_eq!(USER.repository_name(), "users");
        static CATEGORY: EntitySchema = EntitySchema::new("Category", &[]);
        assert_eq!(CATEGORY.repository_name(), "categorys");
    }

    #[test]
    fn test_channel() {
        assert_eq!(USER.channel(), "mutation:User");
    }

    #[test]
    fn test_record_keys() {
        assert_eq!(USER.field("username").unwrap().record_key(), "username");
        assert_eq!(USER.field("rank").unwrap().record_key(), "rank_id");
        assert_eq!(USER.field("friends").unwrap().record_key(), "friends_ids");
        assert!(USER.field("missing").is_none());
    }

    #[test]
    fn test_relations() {
        let names: Vec<_> = USER.relations().map(|f| f.name).collect();
        assert_eq!(names, vec!["rank", "friends"]);
    }

    #[test]
    fn test_keyed_by() {
        match USER.field("friends").unwrap().kind {
            FieldKind::ToMany {
                target,
                target_id,
                collection,
            } => {
                assert_eq!(target, "friends");
                assert_eq!(target_id, "uuid");
                assert_eq!(collection, CollectionKind::List);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        let scalar = Field::scalar("x", ScalarType::Any).keyed_by("ignored");
        assert_eq!(scalar.kind, FieldKind::Scalar(ScalarType::Any));
    }

    #[test]
    fn test_with_id_field() {
        static ODD: EntitySchema = EntitySchema::new("Odd", &[]).with_id_field("uuid");
        assert_eq!(ODD.id_field, "uuid");
    }

    #[test]
    fn test_i64_from_json() {
        assert_eq!(i64::from_json(&json!(7)), Some(7));
        assert_eq!(i64::from_json(&json!("42")), Some(42));
        assert_eq!(i64::from_json(&json!(3.0)), Some(3));
        assert_eq!(i64::from_json(&json!(3.5)), None);
        assert_eq!(i64::from_json(&json!("abc")), None);
        assert_eq!(i64::from_json(&json!(null)), None);
        assert_eq!(i64::STRATEGY, IdStrategy::Sequence);
    }

    #[test]
    fn test_string_from_json() {
        assert_eq!(String::from_json(&json!("u1")), Some("u1".to_string()));
        assert_eq!(String::from_json(&json!(12)), Some("12".to_string()));
        assert_eq!(String::from_json(&json!("")), None);
        assert_eq!(String::STRATEGY, IdStrategy::Generated);
    }

    #[test]
    fn test_uuid_from_json() {
        let id = Uuid::now_v7();
        let upper = id.hyphenated().to_string().to_uppercase();
        assert_eq!(Uuid::from_json(&json!(upper)), Some(id));
        assert_eq!(Uuid::from_json(&json!("not-a-uuid")), None);
        assert_eq!(id.to_json(), json!(id.hyphenated().to_string()));
        assert_eq!(id.to_key(), id.hyphenated().to_string());
    }
}
