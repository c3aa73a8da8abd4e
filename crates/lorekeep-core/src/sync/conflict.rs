//! Conflict detection and resolution
//!
//! Both steps are pure functions over in-memory entity sets. Detection
//! compares the local set, the remote set and the sync base (the last copy
//! both sides agreed on). Resolution turns a plan plus an operator-chosen
//! [`Strategy`] into a [`CommitPlan`], validated as a whole before anything
//! is written.
//!
//! Detection is whole-entity: edits to different fields on both sides still
//! produce one conflict for the entity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::models::{Collection, Entity, EntityId, EntityKey, OpKind};
use crate::storage::{EntityStore, MemoryStore, StoreError};

/// Divergent copies of one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub collection: Collection,
    pub id: EntityId,
    /// Local copy (absent if deleted locally)
    pub local: Option<Entity>,
    /// Remote copy (absent if deleted remotely)
    pub remote: Option<Entity>,
    /// Strategy applied, once resolved
    pub strategy: Option<Strategy>,
}

impl Conflict {
    pub fn key(&self) -> EntityKey {
        (self.collection, self.id)
    }

    /// One side deleted the entity while the other changed it
    pub fn is_update_delete(&self) -> bool {
        self.local.is_none() != self.remote.is_none()
    }
}

/// How to resolve a batch of conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Remote copy wins
    Skip,
    /// Local copy replaces the remote one
    Overwrite,
    /// Remote keeps the id, the local copy moves to a fresh id
    KeepBoth,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Skip => "skip",
            Strategy::Overwrite => "overwrite",
            Strategy::KeepBoth => "keep-both",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Strategy::Skip),
            "overwrite" => Ok(Strategy::Overwrite),
            "keep-both" | "keep_both" => Ok(Strategy::KeepBoth),
            other => Err(format!(
                "unknown strategy '{}' (expected skip, overwrite or keep-both)",
                other
            )),
        }
    }
}

/// A local change that must be queued for the remote
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outgoing {
    pub collection: Collection,
    pub id: EntityId,
    pub op: OpKind,
    pub payload: Option<Entity>,
}

impl Outgoing {
    fn upsert(entity: &Entity, exists_remotely: bool) -> Self {
        Self {
            collection: entity.collection(),
            id: entity.id,
            op: if exists_remotely {
                OpKind::Update
            } else {
                OpKind::Add
            },
            payload: Some(entity.clone()),
        }
    }

    fn delete(key: EntityKey) -> Self {
        Self {
            collection: key.0,
            id: key.1,
            op: OpKind::Delete,
            payload: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        (self.collection, self.id)
    }
}

/// A local entity moved to a fresh id by keep-both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remap {
    pub collection: Collection,
    pub from: EntityId,
    pub to: EntityId,
}

/// Outcome of comparing local, remote and base
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncPlan {
    /// Changed on both sides
    pub conflicts: Vec<Conflict>,
    /// Changed remotely only: take the remote copy
    pub adopt: Vec<Entity>,
    /// Deleted remotely only: delete locally
    pub remove: Vec<EntityKey>,
    /// Changed locally only, with nothing queued yet
    pub outgoing: Vec<Outgoing>,
    /// Identical on both sides but the base is out of date
    pub settle: Vec<Entity>,
    /// Gone on both sides, base still present
    pub forget: Vec<EntityKey>,
    /// Entities already identical
    pub in_sync: usize,
}

impl SyncPlan {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Whether applying the plan would change anything
    pub fn is_noop(&self) -> bool {
        self.conflicts.is_empty()
            && self.adopt.is_empty()
            && self.remove.is_empty()
            && self.outgoing.is_empty()
            && self.settle.is_empty()
            && self.forget.is_empty()
    }

    /// Turn one-sided changes that would break a reference into conflicts
    ///
    /// A remote delete is held while a surviving local entity still points at
    /// the deleted entity. An adopted remote copy is held while it points at
    /// something missing locally. Returns how many changes were held.
    pub fn hold_dangling(&mut self, local: &[Entity]) -> usize {
        let local: BTreeMap<EntityKey, &Entity> = local.iter().map(|e| (e.key(), e)).collect();
        let mut held = 0;

        loop {
            let mut merged: BTreeMap<EntityKey, &Entity> = local.clone();
            for key in &self.remove {
                merged.remove(key);
            }
            for entity in &self.adopt {
                merged.insert(entity.key(), entity);
            }

            let mut removals = BTreeSet::new();
            let mut adoptions = BTreeSet::new();
            for entity in merged.values() {
                for reference in entity.references() {
                    let target = (reference.target, reference.id);
                    if merged.contains_key(&target) {
                        continue;
                    }
                    if self.remove.contains(&target) {
                        removals.insert(target);
                    } else if self.adopt.iter().any(|e| e.key() == entity.key()) {
                        adoptions.insert(entity.key());
                    }
                }
            }
            if removals.is_empty() && adoptions.is_empty() {
                return held;
            }
            held += removals.len() + adoptions.len();

            let conflicts = &mut self.conflicts;
            self.remove.retain(|key| {
                if !removals.contains(key) {
                    return true;
                }
                conflicts.push(Conflict {
                    collection: key.0,
                    id: key.1,
                    local: local.get(key).map(|e| (*e).clone()),
                    remote: None,
                    strategy: None,
                });
                false
            });
            self.adopt.retain(|entity| {
                let key = entity.key();
                if !adoptions.contains(&key) {
                    return true;
                }
                conflicts.push(Conflict {
                    collection: key.0,
                    id: key.1,
                    local: local.get(&key).map(|e| (*e).clone()),
                    remote: Some(entity.clone()),
                    strategy: None,
                });
                false
            });
        }
    }

    /// The conflict-free part of the plan
    pub fn one_sided(&self) -> CommitPlan {
        CommitPlan {
            adopt: self.adopt.clone(),
            remove: self.remove.clone(),
            outgoing: self.outgoing.clone(),
            settle: self.settle.clone(),
            forget: self.forget.clone(),
            ..CommitPlan::default()
        }
    }
}

/// Everything a reconciliation writes, applied in one local transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitPlan {
    /// Entities whose queued ops are dropped first
    pub discard: Vec<EntityKey>,
    /// Remote copies written locally and recorded as the base
    pub adopt: Vec<Entity>,
    /// Entities deleted locally along with their base
    pub remove: Vec<EntityKey>,
    /// Local-only writes (moved or rewritten copies)
    pub local_puts: Vec<Entity>,
    /// Ops appended to the queue, in push order
    pub outgoing: Vec<Outgoing>,
    /// Base snapshots refreshed without touching entities
    pub settle: Vec<Entity>,
    /// Base snapshots removed
    pub forget: Vec<EntityKey>,
    /// Ids reassigned by keep-both
    pub remapped: Vec<Remap>,
}

impl CommitPlan {
    /// Order outgoing ops so referenced entities reach the remote first
    /// and are deleted last
    fn order_outgoing(&mut self) {
        self.outgoing.sort_by_key(|o| match o.op {
            OpKind::Delete => (1, usize::MAX - o.collection.dependency_rank(), o.id),
            _ => (0, o.collection.dependency_rank(), o.id),
        });
    }
}

/// Resolution aborted; nothing was applied
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(
        "resolution would leave {collection} {id} field '{field}' pointing at missing {target} {target_id}"
    )]
    DanglingReference {
        collection: Collection,
        id: EntityId,
        field: &'static str,
        target: Collection,
        target_id: EntityId,
    },

    #[error("resolution produced an invalid batch: {0}")]
    Store(#[from] StoreError),
}

/// Compare local and remote sets against the sync base
///
/// `pending` holds keys with unconfirmed local ops; such an entity counts as
/// locally changed even if its content matches the base.
pub fn plan(
    local: &[Entity],
    remote: &[Entity],
    base: &BTreeMap<EntityKey, Entity>,
    pending: &BTreeSet<EntityKey>,
) -> SyncPlan {
    let local: BTreeMap<EntityKey, &Entity> = local.iter().map(|e| (e.key(), e)).collect();
    let remote: BTreeMap<EntityKey, &Entity> = remote.iter().map(|e| (e.key(), e)).collect();
    let keys: BTreeSet<EntityKey> = local
        .keys()
        .chain(remote.keys())
        .chain(base.keys())
        .copied()
        .collect();

    let mut plan = SyncPlan::default();
    for key in keys {
        let l = local.get(&key).copied();
        let r = remote.get(&key).copied();
        let b = base.get(&key);

        if l == r {
            match (l, b) {
                (Some(entity), b) if b != Some(entity) => plan.settle.push(entity.clone()),
                (None, Some(_)) => plan.forget.push(key),
                _ => {}
            }
            plan.in_sync += 1;
            continue;
        }

        let queued = pending.contains(&key);
        let local_changed = queued || l != b;
        let remote_changed = r != b;

        match (local_changed, remote_changed) {
            (true, true) => plan.conflicts.push(Conflict {
                collection: key.0,
                id: key.1,
                local: l.cloned(),
                remote: r.cloned(),
                strategy: None,
            }),
            (true, false) if !queued => plan.outgoing.push(match l {
                Some(entity) => Outgoing::upsert(entity, r.is_some()),
                None => Outgoing::delete(key),
            }),
            (false, true) => match r {
                Some(entity) => plan.adopt.push(entity.clone()),
                None => plan.remove.push(key),
            },
            _ => {}
        }
    }
    plan
}

/// Apply `strategy` to every conflict of `plan`
///
/// `local` and `remote` are the full sets the plan was computed from. The
/// returned commit includes the plan's conflict-free changes. The merged
/// result is checked for dangling references before it is returned.
pub fn resolve(
    plan: &SyncPlan,
    local: &[Entity],
    remote: &[Entity],
    strategy: Strategy,
) -> Result<(CommitPlan, Vec<Conflict>), ResolveError> {
    let mut commit = plan.one_sided();
    let remote_keys: BTreeSet<EntityKey> = remote.iter().map(|e| e.key()).collect();

    match strategy {
        Strategy::Skip => {
            for conflict in &plan.conflicts {
                commit.discard.push(conflict.key());
                match &conflict.remote {
                    Some(entity) => commit.adopt.push(entity.clone()),
                    None => commit.remove.push(conflict.key()),
                }
            }
        }
        Strategy::Overwrite => {
            for conflict in &plan.conflicts {
                commit.discard.push(conflict.key());
                commit.outgoing.push(match &conflict.local {
                    Some(entity) => Outgoing::upsert(entity, conflict.remote.is_some()),
                    None => Outgoing::delete(conflict.key()),
                });
            }
        }
        Strategy::KeepBoth => keep_both(plan, local, remote, &remote_keys, &mut commit),
    }

    commit.order_outgoing();
    validate_merged(local, &commit)?;

    let resolved = plan
        .conflicts
        .iter()
        .cloned()
        .map(|mut conflict| {
            conflict.strategy = Some(strategy);
            conflict
        })
        .collect();
    Ok((commit, resolved))
}

fn keep_both(
    plan: &SyncPlan,
    local: &[Entity],
    remote: &[Entity],
    remote_keys: &BTreeSet<EntityKey>,
    commit: &mut CommitPlan,
) {
    let mut next_id: BTreeMap<Collection, i64> = BTreeMap::new();
    for entity in local.iter().chain(remote) {
        let max = next_id.entry(entity.collection()).or_insert(0);
        *max = (*max).max(entity.id.0);
    }

    let mut moved = Vec::new();
    for conflict in &plan.conflicts {
        commit.discard.push(conflict.key());
        match (&conflict.local, &conflict.remote) {
            (Some(mine), Some(theirs)) => {
                let counter = next_id.entry(conflict.collection).or_insert(0);
                *counter += 1;
                let to = EntityId(*counter);
                commit.remapped.push(Remap {
                    collection: conflict.collection,
                    from: conflict.id,
                    to,
                });
                commit.adopt.push(theirs.clone());
                let mut copy = mine.clone();
                copy.id = to;
                moved.push(copy);
            }
            (Some(mine), None) => commit.outgoing.push(Outgoing::upsert(mine, false)),
            (None, Some(theirs)) => commit.adopt.push(theirs.clone()),
            (None, None) => {}
        }
    }

    // Remote copies and remote deletions are never rewritten
    let mut remote_owned: BTreeSet<EntityKey> = commit.adopt.iter().map(|e| e.key()).collect();
    remote_owned.extend(commit.remove.iter().copied());

    let rewrite = |entity: &mut Entity| {
        let mut changed = false;
        for remap in &commit.remapped {
            changed |= entity.rewrite_reference(remap.collection, remap.from, remap.to);
        }
        changed
    };

    let mut rewritten = Vec::new();
    for entity in local {
        if remote_owned.contains(&entity.key()) {
            continue;
        }
        let mut copy = entity.clone();
        if rewrite(&mut copy) {
            rewritten.push(copy);
        }
    }
    for copy in &mut moved {
        rewrite(copy);
    }

    for entity in rewritten {
        let key = entity.key();
        commit.outgoing.retain(|o| o.key() != key);
        commit.discard.push(key);
        commit
            .outgoing
            .push(Outgoing::upsert(&entity, remote_keys.contains(&key)));
        commit.local_puts.push(entity);
    }
    for entity in moved {
        commit.outgoing.push(Outgoing::upsert(&entity, false));
        commit.local_puts.push(entity);
    }
}

/// Check every reference in the state the commit would produce
pub(crate) fn validate_merged(local: &[Entity], commit: &CommitPlan) -> Result<(), ResolveError> {
    let mut merged = MemoryStore::from_entities(local.iter().cloned());
    for key in &commit.remove {
        merged.remove(key);
    }
    for outgoing in &commit.outgoing {
        if outgoing.op == OpKind::Delete {
            merged.remove(&outgoing.key());
        }
    }
    for entity in commit.adopt.iter().chain(&commit.local_puts) {
        merged.put(entity)?;
    }

    for entity in merged.iter() {
        for reference in entity.references() {
            if !merged.contains(&(reference.target, reference.id)) {
                return Err(ResolveError::DanglingReference {
                    collection: entity.collection(),
                    id: entity.id,
                    field: reference.field,
                    target: reference.target,
                    target_id: reference.id,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_of(entities: &[Entity]) -> BTreeMap<EntityKey, Entity> {
        entities.iter().map(|e| (e.key(), e.clone())).collect()
    }

    fn person(id: i64, name: &str) -> Entity {
        Entity::person(id, name, None)
    }

    #[test]
    fn test_both_changed_is_one_conflict() {
        let base = base_of(&[person(3, "Aldric the Younger")]);
        let local = [person(3, "Aldric")];
        let remote = [person(3, "Aldric Storm")];

        let plan = plan(&local, &remote, &base, &BTreeSet::new());

        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].key(), (Collection::Person, EntityId(3)));
        assert!(plan.adopt.is_empty());
        assert!(plan.outgoing.is_empty());
    }

    #[test]
    fn test_one_sided_changes_are_not_conflicts() {
        let base = base_of(&[person(1, "Aldric"), person(2, "Bera")]);
        let local = [person(1, "Aldric Storm"), person(2, "Bera")];
        let remote = [person(1, "Aldric"), person(2, "Bera of Alder")];

        let plan = plan(&local, &remote, &base, &BTreeSet::new());

        assert!(!plan.has_conflicts());
        assert_eq!(plan.outgoing.len(), 1);
        assert_eq!(plan.outgoing[0].op, OpKind::Update);
        assert_eq!(plan.adopt, vec![person(2, "Bera of Alder")]);
    }

    #[test]
    fn test_queued_entity_counts_as_locally_changed() {
        let base = base_of(&[person(1, "Aldric")]);
        let local = [person(1, "Aldric")];
        let remote = [person(1, "Aldric Storm")];
        let pending = BTreeSet::from([(Collection::Person, EntityId(1))]);

        let plan = plan(&local, &remote, &base, &pending);
        assert_eq!(plan.conflicts.len(), 1);
    }

    #[test]
    fn test_queued_local_change_is_not_requeued() {
        let base = base_of(&[person(1, "Aldric")]);
        let pending = BTreeSet::from([(Collection::Person, EntityId(1))]);

        let plan = plan(&[person(1, "Aldric Storm")], &[person(1, "Aldric")], &base, &pending);
        assert!(plan.outgoing.is_empty());
        assert!(!plan.has_conflicts());
    }

    #[test]
    fn test_first_sync_without_base() {
        let local = [person(1, "Aldric"), person(2, "Bera")];
        let remote = [person(1, "Aldric"), person(2, "Bera Storm"), person(3, "Cato")];

        let plan = plan(&local, &remote, &BTreeMap::new(), &BTreeSet::new());

        assert_eq!(plan.in_sync, 1);
        assert_eq!(plan.settle, vec![person(1, "Aldric")]);
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.adopt, vec![person(3, "Cato")]);
    }

    #[test]
    fn test_delete_against_edit_is_conflict() {
        let base = base_of(&[person(1, "Aldric")]);
        let plan = plan(&[], &[person(1, "Aldric Storm")], &base, &BTreeSet::new());

        assert_eq!(plan.conflicts.len(), 1);
        assert!(plan.conflicts[0].is_update_delete());
        assert!(plan.conflicts[0].local.is_none());
    }

    #[test]
    fn test_both_deleted_forgets_base() {
        let base = base_of(&[person(1, "Aldric")]);
        let plan = plan(&[], &[], &base, &BTreeSet::new());
        assert_eq!(plan.forget, vec![(Collection::Person, EntityId(1))]);
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn test_remote_delete_is_removed_locally() {
        let base = base_of(&[person(1, "Aldric")]);
        let plan = plan(&[person(1, "Aldric")], &[], &base, &BTreeSet::new());
        assert_eq!(plan.remove, vec![(Collection::Person, EntityId(1))]);
    }

    #[test]
    fn test_remote_delete_of_referenced_entity_is_held() {
        let alder = Entity::group(1, "Alder");
        let base = base_of(&[alder.clone()]);
        let local = [alder.clone(), Entity::person(1, "Aldric", Some(1))];
        let pending = BTreeSet::from([(Collection::Person, EntityId(1))]);
        let mut plan = plan(&local, &[], &base, &pending);
        assert_eq!(plan.remove, vec![alder.key()]);

        assert_eq!(plan.hold_dangling(&local), 1);
        assert!(plan.remove.is_empty());
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].local, Some(alder));
        assert!(plan.conflicts[0].remote.is_none());
    }

    #[test]
    fn test_remote_cascade_is_not_held() {
        let local = [
            person(1, "Aldric"),
            person(2, "Bera"),
            Entity::relationship(1, 1, 2, "sibling"),
        ];
        let base = base_of(&local);
        let mut plan = plan(&local, &[person(2, "Bera")], &base, &BTreeSet::new());

        assert_eq!(plan.hold_dangling(&local), 0);
        assert_eq!(plan.remove.len(), 2);
        assert!(!plan.has_conflicts());
    }

    #[test]
    fn test_skip_takes_remote_and_keeps_local_only_pushes() {
        let base = base_of(&[person(3, "Aldric the Younger")]);
        let local = [person(3, "Aldric"), person(4, "Dara")];
        let remote = [person(3, "Aldric Storm")];
        let plan = plan(&local, &remote, &base, &BTreeSet::new());

        let (commit, resolved) = resolve(&plan, &local, &remote, Strategy::Skip).unwrap();

        assert_eq!(commit.adopt, vec![person(3, "Aldric Storm")]);
        assert_eq!(commit.discard, vec![(Collection::Person, EntityId(3))]);
        assert_eq!(commit.outgoing.len(), 1);
        assert_eq!(commit.outgoing[0].id, EntityId(4));
        assert_eq!(resolved[0].strategy, Some(Strategy::Skip));
    }

    #[test]
    fn test_overwrite_queues_local_copy() {
        let base = base_of(&[person(3, "Aldric the Younger")]);
        let local = [person(3, "Aldric")];
        let remote = [person(3, "Aldric Storm")];
        let plan = plan(&local, &remote, &base, &BTreeSet::new());

        let (commit, _) = resolve(&plan, &local, &remote, Strategy::Overwrite).unwrap();

        assert!(commit.adopt.is_empty());
        assert_eq!(commit.outgoing.len(), 1);
        assert_eq!(commit.outgoing[0].op, OpKind::Update);
        assert_eq!(commit.outgoing[0].payload, Some(person(3, "Aldric")));
    }

    #[test]
    fn test_keep_both_rewrites_references() {
        let base = base_of(&[person(5, "Aldric"), person(6, "Bera")]);
        let local = [
            person(5, "Aldric Storm"),
            person(6, "Bera"),
            Entity::relationship(1, 5, 6, "sibling"),
            Entity::title(1, "Warden", Some(5)),
        ];
        let remote = [person(5, "Aldric of Alder"), person(6, "Bera"), person(8, "Cato")];
        let plan = plan(&local, &remote, &base, &BTreeSet::new());

        let (commit, _) = resolve(&plan, &local, &remote, Strategy::KeepBoth).unwrap();

        assert_eq!(
            commit.remapped,
            vec![Remap {
                collection: Collection::Person,
                from: EntityId(5),
                to: EntityId(9),
            }]
        );
        // Remote keeps id 5
        assert!(commit.adopt.contains(&person(5, "Aldric of Alder")));

        let puts: BTreeMap<EntityKey, &Entity> =
            commit.local_puts.iter().map(|e| (e.key(), e)).collect();
        assert_eq!(puts[&(Collection::Person, EntityId(9))].label(), "Aldric Storm");
        let rel = puts[&(Collection::Relationship, EntityId(1))];
        assert!(rel.refers_to(Collection::Person, EntityId(9)));
        assert!(!rel.refers_to(Collection::Person, EntityId(5)));
        let title = puts[&(Collection::Title, EntityId(1))];
        assert!(title.refers_to(Collection::Person, EntityId(9)));

        // Moved copy and rewritten dependents are queued, referenced first
        let queued: Vec<EntityKey> = commit.outgoing.iter().map(|o| o.key()).collect();
        let moved_at = queued
            .iter()
            .position(|k| *k == (Collection::Person, EntityId(9)))
            .unwrap();
        let rel_at = queued
            .iter()
            .position(|k| *k == (Collection::Relationship, EntityId(1)))
            .unwrap();
        assert!(moved_at < rel_at);
    }

    #[test]
    fn test_keep_both_fresh_ids_do_not_collide() {
        let local = [person(1, "Aldric"), person(2, "Bera")];
        let remote = [person(1, "Aldric Storm"), person(2, "Bera Storm"), person(7, "Cato")];
        let plan = plan(&local, &remote, &BTreeMap::new(), &BTreeSet::new());

        let (commit, _) = resolve(&plan, &local, &remote, Strategy::KeepBoth).unwrap();
        let new_ids: Vec<EntityId> = commit.remapped.iter().map(|r| r.to).collect();
        assert_eq!(new_ids, vec![EntityId(8), EntityId(9)]);
    }

    #[test]
    fn test_dangling_reference_aborts() {
        // Remote deleted the group that a locally edited person still uses
        let alder = Entity::group(1, "Alder");
        let base = base_of(&[alder.clone(), Entity::person(1, "Aldric", Some(1))]);
        let local = [
            Entity::group(1, "Alder Reach"),
            Entity::person(1, "Aldric", Some(1)),
        ];
        let remote = [Entity::person(1, "Aldric", Some(1))];
        let plan = plan(&local, &remote, &base, &BTreeSet::new());
        assert_eq!(plan.conflicts.len(), 1);

        let err = resolve(&plan, &local, &remote, Strategy::Skip).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::DanglingReference {
                target: Collection::Group,
                ..
            }
        ));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("keep-both".parse::<Strategy>().unwrap(), Strategy::KeepBoth);
        assert_eq!(Strategy::Overwrite.to_string(), "overwrite");
        assert!("merge".parse::<Strategy>().is_err());
    }
}
