//! Group discovery
//!
//! Partitions the entity graph by group and measures each group:
//!
//! - **members**: people whose `group_id` is the group
//! - **secondary**: titles and entries linked to the group or to a member
//! - **cross references**: relationships touching a member
//!
//! A group qualifies for a dedicated artifact when it reaches either
//! threshold; otherwise it is minor and folded into the overflow artifact.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::config::ViewSettings;
use crate::models::{Entity, EntityId, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub min_members: usize,
    pub min_cross_references: usize,
}

impl From<&ViewSettings> for Thresholds {
    fn from(settings: &ViewSettings) -> Self {
        Self {
            min_members: settings.min_members,
            min_cross_references: settings.min_cross_references,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMetrics {
    pub group_id: EntityId,
    pub name: String,
    pub member_count: usize,
    pub secondary_count: usize,
    pub cross_reference_count: usize,
    /// Meets a threshold on this pass
    pub qualifying: bool,
}

/// Everything belonging to one group, each list ordered by id
#[derive(Debug, Clone, Default)]
pub struct GroupPartition {
    pub members: Vec<Entity>,
    pub relationships: Vec<Entity>,
    pub titles: Vec<Entity>,
    pub entries: Vec<Entity>,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub groups: BTreeMap<EntityId, Entity>,
    pub partitions: BTreeMap<EntityId, GroupPartition>,
    pub metrics: BTreeMap<EntityId, GroupMetrics>,
}

impl Discovery {
    pub fn qualifying(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.metrics
            .values()
            .filter(|m| m.qualifying)
            .map(|m| m.group_id)
    }
}

/// Partition and classify every group of `entities`
pub fn discover_groups(entities: &[Entity], thresholds: Thresholds) -> Discovery {
    let mut groups: BTreeMap<EntityId, Entity> = BTreeMap::new();
    let mut person_group: BTreeMap<EntityId, EntityId> = BTreeMap::new();

    for entity in entities {
        match &entity.record {
            Record::Group(_) => {
                groups.insert(entity.id, entity.clone());
            }
            Record::Person(p) => {
                if let Some(group_id) = p.group_id {
                    person_group.insert(entity.id, group_id);
                }
            }
            _ => {}
        }
    }

    let mut partitions: BTreeMap<EntityId, GroupPartition> = groups
        .keys()
        .map(|id| (*id, GroupPartition::default()))
        .collect();

    let mut sorted: Vec<&Entity> = entities.iter().collect();
    sorted.sort_by_key(|e| e.key());

    for entity in sorted {
        if matches!(entity.record, Record::Group(_)) {
            continue;
        }
        let touched = groups_touched(entity, |id| person_group.get(&id).copied());

        for group_id in touched {
            let Some(partition) = partitions.get_mut(&group_id) else {
                continue;
            };
            let bucket = match &entity.record {
                Record::Person(_) => &mut partition.members,
                Record::Relationship(_) => &mut partition.relationships,
                Record::Entry(_) => &mut partition.entries,
                Record::Title(_) => &mut partition.titles,
                Record::Group(_) => continue,
            };
            bucket.push(entity.clone());
        }
    }

    let metrics = partitions
        .iter()
        .map(|(id, partition)| {
            let member_count = partition.members.len();
            let cross_reference_count = partition.relationships.len();
            let metrics = GroupMetrics {
                group_id: *id,
                name: groups
                    .get(id)
                    .map(|g| g.label().to_string())
                    .unwrap_or_default(),
                member_count,
                secondary_count: partition.titles.len() + partition.entries.len(),
                cross_reference_count,
                qualifying: member_count >= thresholds.min_members
                    || cross_reference_count >= thresholds.min_cross_references,
            };
            (*id, metrics)
        })
        .collect();

    Discovery {
        groups,
        partitions,
        metrics,
    }
}

/// Groups an entity belongs to, judged against current person memberships
pub fn groups_touched(
    entity: &Entity,
    person_group: impl Fn(EntityId) -> Option<EntityId>,
) -> BTreeSet<EntityId> {
    match &entity.record {
        Record::Group(_) => BTreeSet::from([entity.id]),
        Record::Person(p) => p.group_id.into_iter().collect(),
        Record::Relationship(r) => [r.source_id, r.target_id]
            .into_iter()
            .filter_map(&person_group)
            .collect(),
        Record::Entry(e) => e
            .group_id
            .into_iter()
            .chain(e.subject_id.and_then(&person_group))
            .collect(),
        Record::Title(t) => t
            .group_id
            .into_iter()
            .chain(t.holder_id.and_then(&person_group))
            .collect(),
    }
}
