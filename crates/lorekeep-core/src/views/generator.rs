//! Context bundle generation
//!
//! A bundle is a named set of self-describing JSON sub-files. Each sub-file
//! declares its `kind` and `item_count`; `index.json` lists every member and
//! carries summary statistics.
//!
//! Generation is a full rebuild from the entity set and is deterministic:
//! items are ordered by id, maps serialize with sorted keys, and no timestamp
//! is written into bundle content. Regenerating an unchanged scope yields
//! byte-identical files.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::discovery::Discovery;
use super::scope::ArtifactScope;
use crate::models::{Collection, Entity, EntityId};
use crate::storage::StoreError;

/// Name of the index sub-file present in every bundle
pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("group {0} no longer exists")]
    MissingGroup(EntityId),

    #[error("failed to serialize bundle: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub name: String,
    pub kind: String,
    pub item_count: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub files: Vec<BundleFile>,
}

impl Bundle {
    pub fn file(&self, name: &str) -> Option<&BundleFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Parsed `items` array of one sub-file
    pub fn items(&self, name: &str) -> Option<Vec<Value>> {
        let file = self.file(name)?;
        let value: Value = serde_json::from_str(&file.content).ok()?;
        value.get("items")?.as_array().cloned()
    }

    pub fn index(&self) -> Option<Value> {
        serde_json::from_str(&self.file(INDEX_FILE)?.content).ok()
    }

    /// Items per kind, excluding the index
    pub fn source_counts(&self) -> BTreeMap<String, usize> {
        self.files
            .iter()
            .filter(|f| f.name != INDEX_FILE)
            .map(|f| (f.kind.clone(), f.item_count))
            .collect()
    }

    pub fn item_count(&self) -> usize {
        self.source_counts().values().sum()
    }
}

struct BundleBuilder {
    scope: ArtifactScope,
    files: Vec<BundleFile>,
}

impl BundleBuilder {
    fn new(scope: ArtifactScope) -> Self {
        Self {
            scope,
            files: Vec::new(),
        }
    }

    fn entities(self, kind: &str, entities: &[Entity]) -> Result<Self, ViewError> {
        let items = entities.iter().map(|e| Value::Object(e.to_fields())).collect();
        self.values(kind, items)
    }

    fn values(mut self, kind: &str, items: Vec<Value>) -> Result<Self, ViewError> {
        let item_count = items.len();
        let content = serde_json::to_string_pretty(&json!({
            "kind": kind,
            "item_count": item_count,
            "items": items,
        }))?;
        self.files.push(BundleFile {
            name: format!("{}.json", kind),
            kind: kind.to_string(),
            item_count,
            content,
        });
        Ok(self)
    }

    fn finish(self, stats: Value) -> Result<Bundle, ViewError> {
        let name = self.scope.bundle_name();
        let members: Vec<Value> = self
            .files
            .iter()
            .map(|f| json!({ "name": f.name, "kind": f.kind, "item_count": f.item_count }))
            .collect();
        let index = serde_json::to_string_pretty(&json!({
            "bundle": name,
            "scope": self.scope.key(),
            "kind": "index",
            "item_count": members.len(),
            "members": members,
            "stats": stats,
        }))?;

        let mut files = Vec::with_capacity(self.files.len() + 1);
        files.push(BundleFile {
            name: INDEX_FILE.to_string(),
            kind: "index".to_string(),
            item_count: members.len(),
            content: index,
        });
        files.extend(self.files);
        Ok(Bundle { name, files })
    }
}

/// Rebuild the bundle for `scope`
///
/// `promoted` is the set of groups with a dedicated artifact; every other
/// group belongs to the minor overflow bundle.
pub fn build(
    scope: ArtifactScope,
    entities: &[Entity],
    discovery: &Discovery,
    promoted: &BTreeSet<EntityId>,
) -> Result<Bundle, ViewError> {
    match scope {
        ArtifactScope::Global => build_global(entities, discovery, promoted),
        ArtifactScope::Group(id) => build_group(id, discovery),
        ArtifactScope::Minor => build_minor(discovery, promoted),
    }
}

fn of_collection(entities: &[Entity], collection: Collection) -> Vec<Entity> {
    let mut selected: Vec<Entity> = entities
        .iter()
        .filter(|e| e.collection() == collection)
        .cloned()
        .collect();
    selected.sort_by_key(|e| e.id);
    selected
}

fn build_global(
    entities: &[Entity],
    discovery: &Discovery,
    promoted: &BTreeSet<EntityId>,
) -> Result<Bundle, ViewError> {
    let mut builder = BundleBuilder::new(ArtifactScope::Global);
    let mut counts = serde_json::Map::new();
    for collection in Collection::ALL {
        let selected = of_collection(entities, collection);
        counts.insert(collection.plural().to_string(), json!(selected.len()));
        builder = builder.entities(collection.plural(), &selected)?;
    }

    let dedicated = discovery
        .groups
        .keys()
        .filter(|id| promoted.contains(id))
        .count();
    builder.finish(json!({
        "counts": counts,
        "dedicated_groups": dedicated,
        "minor_groups": discovery.groups.len() - dedicated,
    }))
}

fn build_group(id: EntityId, discovery: &Discovery) -> Result<Bundle, ViewError> {
    let group = discovery.groups.get(&id).ok_or(ViewError::MissingGroup(id))?;
    let partition = discovery
        .partitions
        .get(&id)
        .ok_or(ViewError::MissingGroup(id))?;
    let metrics = discovery
        .metrics
        .get(&id)
        .ok_or(ViewError::MissingGroup(id))?;

    BundleBuilder::new(ArtifactScope::Group(id))
        .entities("group", std::slice::from_ref(group))?
        .entities("members", &partition.members)?
        .entities("relationships", &partition.relationships)?
        .entities("titles", &partition.titles)?
        .entities("entries", &partition.entries)?
        .finish(json!({
            "group_id": id,
            "name": metrics.name,
            "member_count": metrics.member_count,
            "secondary_count": metrics.secondary_count,
            "cross_reference_count": metrics.cross_reference_count,
        }))
}

fn build_minor(discovery: &Discovery, promoted: &BTreeSet<EntityId>) -> Result<Bundle, ViewError> {
    let minor: Vec<EntityId> = discovery
        .groups
        .keys()
        .filter(|id| !promoted.contains(id))
        .copied()
        .collect();

    let groups: Vec<Value> = minor
        .iter()
        .filter_map(|id| {
            let group = discovery.groups.get(id)?;
            let metrics = discovery.metrics.get(id)?;
            let mut fields = group.to_fields();
            fields.insert("member_count".to_string(), json!(metrics.member_count));
            fields.insert(
                "cross_reference_count".to_string(),
                json!(metrics.cross_reference_count),
            );
            Some(Value::Object(fields))
        })
        .collect();

    let mut members: Vec<Entity> = minor
        .iter()
        .filter_map(|id| discovery.partitions.get(id))
        .flat_map(|p| p.members.iter().cloned())
        .collect();
    members.sort_by_key(|e| e.id);

    let member_count = members.len();
    BundleBuilder::new(ArtifactScope::Minor)
        .values("groups", groups)?
        .entities("members", &members)?
        .finish(json!({
            "group_count": minor.len(),
            "member_count": member_count,
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::discovery::{discover_groups, Thresholds};

    const THRESHOLDS: Thresholds = Thresholds {
        min_members: 2,
        min_cross_references: 5,
    };

    fn world() -> Vec<Entity> {
        vec![
            Entity::group(1, "Alder"),
            Entity::group(2, "Birch"),
            Entity::person(1, "Aldric", Some(1)),
            Entity::person(2, "Alys", Some(1)),
            Entity::person(3, "Bera", Some(2)),
            Entity::relationship(1, 1, 2, "sibling"),
            Entity::title(1, "Warden", Some(1)),
        ]
    }

    #[test]
    fn test_group_bundle_layout() {
        let entities = world();
        let discovery = discover_groups(&entities, THRESHOLDS);
        let bundle = build(
            ArtifactScope::Group(EntityId(1)),
            &entities,
            &discovery,
            &BTreeSet::from([EntityId(1)]),
        )
        .unwrap();

        assert_eq!(bundle.name, "group-1");
        assert_eq!(bundle.files[0].name, INDEX_FILE);
        assert_eq!(bundle.file("members.json").unwrap().item_count, 2);

        let index = bundle.index().unwrap();
        assert_eq!(index["stats"]["member_count"], 2);
        assert_eq!(index["members"].as_array().unwrap().len(), 5);

        let members = bundle.items("members.json").unwrap();
        assert_eq!(members[0]["name"], "Aldric");
        assert_eq!(members[0]["id"], 1);
    }

    #[test]
    fn test_sub_files_are_self_describing() {
        let entities = world();
        let discovery = discover_groups(&entities, THRESHOLDS);
        let bundle = build(ArtifactScope::Global, &entities, &discovery, &BTreeSet::new()).unwrap();

        for file in &bundle.files {
            let value: Value = serde_json::from_str(&file.content).unwrap();
            assert_eq!(value["kind"], file.kind.as_str());
            assert_eq!(value["item_count"], file.item_count);
        }
        assert_eq!(bundle.source_counts()["people"], 3);
        assert_eq!(bundle.item_count(), 7);
    }

    #[test]
    fn test_rebuild_is_byte_identical_regardless_of_input_order() {
        let entities = world();
        let mut shuffled = world();
        shuffled.reverse();

        let promoted = BTreeSet::from([EntityId(1)]);
        for scope in [
            ArtifactScope::Global,
            ArtifactScope::Group(EntityId(1)),
            ArtifactScope::Minor,
        ] {
            let first = build(scope, &entities, &discover_groups(&entities, THRESHOLDS), &promoted)
                .unwrap();
            let second = build(scope, &shuffled, &discover_groups(&shuffled, THRESHOLDS), &promoted)
                .unwrap();
            assert_eq!(first, second, "{} differs", scope);
        }
    }

    #[test]
    fn test_minor_bundle_excludes_promoted_groups() {
        let entities = world();
        let discovery = discover_groups(&entities, THRESHOLDS);
        let bundle = build(
            ArtifactScope::Minor,
            &entities,
            &discovery,
            &BTreeSet::from([EntityId(1)]),
        )
        .unwrap();

        let members = bundle.items("members.json").unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0]["name"], "Bera");
        assert_eq!(bundle.items("groups.json").unwrap()[0]["member_count"], 1);
    }

    #[test]
    fn test_missing_group_fails() {
        let entities = world();
        let discovery = discover_groups(&entities, THRESHOLDS);
        let err = build(
            ArtifactScope::Group(EntityId(9)),
            &entities,
            &discovery,
            &BTreeSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ViewError::MissingGroup(EntityId(9))));
    }
}
