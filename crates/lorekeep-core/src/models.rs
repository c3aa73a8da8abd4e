//! Data models for lorekeep
//!
//! Every collection is a tagged variant with a declared core schema plus an
//! `extra` map that carries fields this version does not know about, so that
//! records written by newer clients survive a round trip untouched.
//!
//! References between entities are declared per collection in
//! [`Collection::reference_fields`], together with the policy applied when the
//! referenced entity is deleted.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Identifier of an entity within its collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl EntityId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(EntityId)
    }
}

/// The keyed collections of the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Person,
    Group,
    Relationship,
    Entry,
    Title,
}

impl Collection {
    /// All collections, in dependency order (referenced collections first)
    pub const ALL: [Collection; 5] = [
        Collection::Group,
        Collection::Person,
        Collection::Relationship,
        Collection::Entry,
        Collection::Title,
    ];

    /// Position in [`Collection::ALL`]; referenced collections rank lower
    pub fn dependency_rank(&self) -> usize {
        match self {
            Collection::Group => 0,
            Collection::Person => 1,
            Collection::Relationship => 2,
            Collection::Entry => 3,
            Collection::Title => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Person => "person",
            Collection::Group => "group",
            Collection::Relationship => "relationship",
            Collection::Entry => "entry",
            Collection::Title => "title",
        }
    }

    /// Plural name, used for bundle sub-files and remote paths
    pub fn plural(&self) -> &'static str {
        match self {
            Collection::Person => "people",
            Collection::Group => "groups",
            Collection::Relationship => "relationships",
            Collection::Entry => "entries",
            Collection::Title => "titles",
        }
    }

    /// Reference fields declared by records of this collection
    pub fn reference_fields(&self) -> &'static [RefField] {
        match self {
            Collection::Person => &[RefField {
                name: "group_id",
                target: Collection::Group,
                on_delete: OnDelete::Clear,
            }],
            Collection::Group => &[RefField {
                name: "parent_id",
                target: Collection::Group,
                on_delete: OnDelete::Clear,
            }],
            Collection::Relationship => &[
                RefField {
                    name: "source_id",
                    target: Collection::Person,
                    on_delete: OnDelete::Cascade,
                },
                RefField {
                    name: "target_id",
                    target: Collection::Person,
                    on_delete: OnDelete::Cascade,
                },
            ],
            Collection::Entry => &[
                RefField {
                    name: "group_id",
                    target: Collection::Group,
                    on_delete: OnDelete::Clear,
                },
                RefField {
                    name: "subject_id",
                    target: Collection::Person,
                    on_delete: OnDelete::Clear,
                },
            ],
            Collection::Title => &[
                RefField {
                    name: "holder_id",
                    target: Collection::Person,
                    on_delete: OnDelete::Clear,
                },
                RefField {
                    name: "group_id",
                    target: Collection::Group,
                    on_delete: OnDelete::Clear,
                },
            ],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" | "people" | "persons" => Ok(Collection::Person),
            "group" | "groups" => Ok(Collection::Group),
            "relationship" | "relationships" => Ok(Collection::Relationship),
            "entry" | "entries" => Ok(Collection::Entry),
            "title" | "titles" => Ok(Collection::Title),
            other => Err(ValidationError::UnknownCollection(other.to_string())),
        }
    }
}

/// What happens to a referencing entity when its target is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    /// Delete the referencing entity as well
    Cascade,
    /// Set the reference field to null
    Clear,
}

/// Declaration of one reference field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefField {
    pub name: &'static str,
    pub target: Collection,
    pub on_delete: OnDelete,
}

/// Fields not covered by the core schema
pub type Extra = BTreeMap<String, Value>;

/// A person in the world
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Person {
    pub name: String,
    /// Group (house, faction, guild) the person belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A group of people
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A directed relationship between two people
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub source_id: EntityId,
    pub target_id: EntityId,
    /// Free-form kind ("sibling", "rival", "liege")
    pub kind: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// An encyclopedia entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<EntityId>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A title or office, optionally held by a person
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Title {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<EntityId>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Typed record body, tagged by collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum Record {
    Person(Person),
    Group(Group),
    Relationship(Relationship),
    Entry(Entry),
    Title(Title),
}

impl Record {
    pub fn collection(&self) -> Collection {
        match self {
            Record::Person(_) => Collection::Person,
            Record::Group(_) => Collection::Group,
            Record::Relationship(_) => Collection::Relationship,
            Record::Entry(_) => Collection::Entry,
            Record::Title(_) => Collection::Title,
        }
    }

    fn reference_slot(&mut self, field: &str) -> Option<RefSlot<'_>> {
        match (self, field) {
            (Record::Person(p), "group_id") => Some(RefSlot::Optional(&mut p.group_id)),
            (Record::Group(g), "parent_id") => Some(RefSlot::Optional(&mut g.parent_id)),
            (Record::Relationship(r), "source_id") => Some(RefSlot::Required(&mut r.source_id)),
            (Record::Relationship(r), "target_id") => Some(RefSlot::Required(&mut r.target_id)),
            (Record::Entry(e), "group_id") => Some(RefSlot::Optional(&mut e.group_id)),
            (Record::Entry(e), "subject_id") => Some(RefSlot::Optional(&mut e.subject_id)),
            (Record::Title(t), "holder_id") => Some(RefSlot::Optional(&mut t.holder_id)),
            (Record::Title(t), "group_id") => Some(RefSlot::Optional(&mut t.group_id)),
            _ => None,
        }
    }

    fn reference(&self, field: &str) -> Option<EntityId> {
        match (self, field) {
            (Record::Person(p), "group_id") => p.group_id,
            (Record::Group(g), "parent_id") => g.parent_id,
            (Record::Relationship(r), "source_id") => Some(r.source_id),
            (Record::Relationship(r), "target_id") => Some(r.target_id),
            (Record::Entry(e), "group_id") => e.group_id,
            (Record::Entry(e), "subject_id") => e.subject_id,
            (Record::Title(t), "holder_id") => t.holder_id,
            (Record::Title(t), "group_id") => t.group_id,
            _ => None,
        }
    }
}

enum RefSlot<'a> {
    Required(&'a mut EntityId),
    Optional(&'a mut Option<EntityId>),
}

/// A non-null reference held by an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub field: &'static str,
    pub target: Collection,
    pub id: EntityId,
    pub on_delete: OnDelete,
}

/// A stored entity: identifier plus typed record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub record: Record,
}

/// Collection-qualified entity key
pub type EntityKey = (Collection, EntityId);

impl Entity {
    pub fn new(id: EntityId, record: Record) -> Self {
        Self { id, record }
    }

    pub fn person(id: i64, name: impl Into<String>, group_id: Option<i64>) -> Self {
        Self::new(
            EntityId(id),
            Record::Person(Person {
                name: name.into(),
                group_id: group_id.map(EntityId),
                summary: None,
                extra: Extra::new(),
            }),
        )
    }

    pub fn group(id: i64, name: impl Into<String>) -> Self {
        Self::new(
            EntityId(id),
            Record::Group(Group {
                name: name.into(),
                parent_id: None,
                summary: None,
                extra: Extra::new(),
            }),
        )
    }

    pub fn relationship(id: i64, source: i64, target: i64, kind: impl Into<String>) -> Self {
        Self::new(
            EntityId(id),
            Record::Relationship(Relationship {
                source_id: EntityId(source),
                target_id: EntityId(target),
                kind: kind.into(),
                extra: Extra::new(),
            }),
        )
    }

    pub fn entry(id: i64, title: impl Into<String>, group_id: Option<i64>) -> Self {
        Self::new(
            EntityId(id),
            Record::Entry(Entry {
                title: title.into(),
                body: String::new(),
                group_id: group_id.map(EntityId),
                subject_id: None,
                extra: Extra::new(),
            }),
        )
    }

    pub fn title(id: i64, name: impl Into<String>, holder_id: Option<i64>) -> Self {
        Self::new(
            EntityId(id),
            Record::Title(Title {
                name: name.into(),
                holder_id: holder_id.map(EntityId),
                group_id: None,
                extra: Extra::new(),
            }),
        )
    }

    pub fn collection(&self) -> Collection {
        self.record.collection()
    }

    pub fn key(&self) -> EntityKey {
        (self.collection(), self.id)
    }

    /// Human-readable label (name or title)
    pub fn label(&self) -> &str {
        match &self.record {
            Record::Person(p) => &p.name,
            Record::Group(g) => &g.name,
            Record::Relationship(r) => &r.kind,
            Record::Entry(e) => &e.title,
            Record::Title(t) => &t.name,
        }
    }

    /// All non-null references this entity holds
    pub fn references(&self) -> Vec<Reference> {
        self.collection()
            .reference_fields()
            .iter()
            .filter_map(|decl| {
                self.record.reference(decl.name).map(|id| Reference {
                    field: decl.name,
                    target: decl.target,
                    id,
                    on_delete: decl.on_delete,
                })
            })
            .collect()
    }

    /// Whether any reference field points at `(target, id)`
    pub fn refers_to(&self, target: Collection, id: EntityId) -> bool {
        self.references()
            .iter()
            .any(|r| r.target == target && r.id == id)
    }

    /// Rewrite every reference to `(target, from)` so it points at `to`
    ///
    /// Returns true if any field changed.
    pub fn rewrite_reference(&mut self, target: Collection, from: EntityId, to: EntityId) -> bool {
        let mut changed = false;
        for decl in self.collection().reference_fields() {
            if decl.target != target {
                continue;
            }
            match self.record.reference_slot(decl.name) {
                Some(RefSlot::Required(slot)) if *slot == from => {
                    *slot = to;
                    changed = true;
                }
                Some(RefSlot::Optional(slot)) if *slot == Some(from) => {
                    *slot = Some(to);
                    changed = true;
                }
                _ => {}
            }
        }
        changed
    }

    /// Null out an optional reference field
    ///
    /// Returns false if the field is unknown or required.
    pub fn clear_reference(&mut self, field: &str) -> bool {
        match self.record.reference_slot(field) {
            Some(RefSlot::Optional(slot)) => {
                let had = slot.is_some();
                *slot = None;
                had
            }
            _ => false,
        }
    }

    /// Check the core schema constraints
    pub fn validate(&self) -> Result<(), ValidationError> {
        let collection = self.collection();
        let empty = |field: &'static str, value: &str| {
            if value.trim().is_empty() {
                Err(ValidationError::Empty { collection, field })
            } else {
                Ok(())
            }
        };
        match &self.record {
            Record::Person(p) => empty("name", &p.name),
            Record::Group(g) => {
                empty("name", &g.name)?;
                if g.parent_id == Some(self.id) {
                    return Err(ValidationError::SelfReference {
                        collection,
                        id: self.id,
                    });
                }
                Ok(())
            }
            Record::Relationship(r) => {
                empty("kind", &r.kind)?;
                if r.source_id == r.target_id {
                    return Err(ValidationError::SelfReference {
                        collection,
                        id: self.id,
                    });
                }
                Ok(())
            }
            Record::Entry(e) => empty("title", &e.title),
            Record::Title(t) => empty("name", &t.name),
        }
    }

    /// Plain field map representation (`id` plus record fields)
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = match serde_json::to_value(&self.record) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        fields.remove("collection");
        fields.insert("id".to_string(), Value::from(self.id.0));
        fields
    }

    /// Build and validate an entity from a plain field map
    pub fn from_fields(
        collection: Collection,
        mut fields: Map<String, Value>,
    ) -> Result<Self, ValidationError> {
        let id = fields
            .remove("id")
            .and_then(|v| v.as_i64())
            .map(EntityId)
            .ok_or(ValidationError::MissingId)?;
        fields.insert(
            "collection".to_string(),
            Value::String(collection.as_str().to_string()),
        );
        let record: Record = serde_json::from_value(Value::Object(fields)).map_err(|e| {
            ValidationError::Malformed {
                collection,
                message: e.to_string(),
            }
        })?;
        let entity = Entity::new(id, record);
        entity.validate()?;
        Ok(entity)
    }
}

/// Kind of a local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Add,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(OpKind::Add),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            other => Err(ValidationError::UnknownOperation(other.to_string())),
        }
    }
}

/// Schema validation failures at the store boundary
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("{collection} field '{field}' must not be empty")]
    Empty {
        collection: Collection,
        field: &'static str,
    },

    #[error("{collection} {id} cannot reference itself")]
    SelfReference { collection: Collection, id: EntityId },

    #[error("field map has no integer 'id'")]
    MissingId,

    #[error("invalid {collection} fields: {message}")]
    Malformed {
        collection: Collection,
        message: String,
    },

    #[error("record is a {found}, expected a {expected}")]
    WrongCollection {
        expected: Collection,
        found: Collection,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_parse() {
        assert_eq!("people".parse::<Collection>().unwrap(), Collection::Person);
        assert_eq!("Group".parse::<Collection>().unwrap(), Collection::Group);
        assert!("planet".parse::<Collection>().is_err());
    }

    #[test]
    fn test_references_skip_nulls() {
        let lone = Entity::person(1, "Aldric", None);
        assert!(lone.references().is_empty());

        let member = Entity::person(2, "Bera", Some(7));
        let refs = member.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, Collection::Group);
        assert_eq!(refs[0].id, EntityId(7));
        assert_eq!(refs[0].on_delete, OnDelete::Clear);
    }

    #[test]
    fn test_rewrite_reference_only_matching_target() {
        let mut rel = Entity::relationship(10, 5, 6, "rival");
        assert!(rel.rewrite_reference(Collection::Person, EntityId(5), EntityId(9)));
        assert!(rel.refers_to(Collection::Person, EntityId(9)));
        assert!(!rel.refers_to(Collection::Person, EntityId(5)));

        // A group with id 6 is not the person with id 6
        assert!(!rel.rewrite_reference(Collection::Group, EntityId(6), EntityId(1)));
        assert!(rel.refers_to(Collection::Person, EntityId(6)));
    }

    #[test]
    fn test_clear_reference() {
        let mut title = Entity::title(1, "Warden", Some(3));
        assert!(title.clear_reference("holder_id"));
        assert!(title.references().is_empty());

        let mut rel = Entity::relationship(2, 1, 3, "ally");
        assert!(!rel.clear_reference("source_id"));
    }

    #[test]
    fn test_validate() {
        assert!(Entity::person(1, "  ", None).validate().is_err());
        assert!(Entity::relationship(1, 4, 4, "self").validate().is_err());
        assert!(Entity::group(1, "Alder").validate().is_ok());
    }

    #[test]
    fn test_fields_round_trip_keeps_extension_fields() {
        let fields = json!({
            "id": 3,
            "name": "Aldric",
            "group_id": 1,
            "eye_colour": "grey"
        });
        let Value::Object(map) = fields else {
            unreachable!()
        };

        let entity = Entity::from_fields(Collection::Person, map).unwrap();
        match &entity.record {
            Record::Person(p) => {
                assert_eq!(p.name, "Aldric");
                assert_eq!(p.extra.get("eye_colour"), Some(&json!("grey")));
            }
            other => panic!("unexpected record {:?}", other),
        }

        let back = entity.to_fields();
        assert_eq!(back.get("id"), Some(&json!(3)));
        assert_eq!(back.get("eye_colour"), Some(&json!("grey")));
        assert!(back.get("collection").is_none());
    }

    #[test]
    fn test_from_fields_rejects_missing_core_field() {
        let Value::Object(map) = json!({ "id": 1, "target_id": 2, "kind": "ally" }) else {
            unreachable!()
        };
        let err = Entity::from_fields(Collection::Relationship, map).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { .. }));
    }

    #[test]
    fn test_record_json_is_tagged() {
        let entity = Entity::group(4, "Alder");
        let body = serde_json::to_string(&entity.record).unwrap();
        assert!(body.contains("\"collection\":\"group\""));
        let parsed: Record = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed, entity.record);
    }
}
