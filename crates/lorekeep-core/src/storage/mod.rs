//! Storage layer
//!
//! ## Architecture
//!
//! - **[`EntityStore`]**: the only storage contract the core consumes
//!   (`get`, `put`, `delete`, `list`), so the backend can be swapped.
//! - **[`SqliteStore`]**: durable system of record for offline operation.
//!   Writes go through [`SqliteStore::write`], which runs one transaction and
//!   guards against concurrent writers in other processes.
//! - **[`MemoryStore`]**: in-memory implementation, used for batches that are
//!   assembled and validated before they are committed.
//!
//! Reference integrity (missing targets, cascade/clear on delete) is computed
//! here against any `EntityStore`, and applied by the use-case layer.

pub mod error;
pub mod local;
pub mod memory;
pub mod persistence;
pub mod schema;

pub use error::{StoreError, StoreResult};
pub use local::{SqliteStore, WriteTx};
pub use memory::MemoryStore;
pub use persistence::{atomic_write, ContextExport};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};

use std::collections::BTreeSet;

use crate::models::{Collection, Entity, EntityId, EntityKey, OnDelete};

/// Keyed entity collections
pub trait EntityStore {
    /// Get one entity
    fn get(&self, collection: Collection, id: EntityId) -> StoreResult<Option<Entity>>;

    /// Insert or replace an entity (validated against its core schema)
    fn put(&mut self, entity: &Entity) -> StoreResult<()>;

    /// Delete an entity, returning whether it existed
    fn delete(&mut self, collection: Collection, id: EntityId) -> StoreResult<bool>;

    /// All entities of a collection, ordered by id
    fn list(&self, collection: Collection) -> StoreResult<Vec<Entity>>;

    /// Smallest id greater than every id in the collection
    fn next_id(&self, collection: Collection) -> StoreResult<EntityId> {
        let max = self
            .list(collection)?
            .iter()
            .map(|e| e.id.0)
            .max()
            .unwrap_or(0);
        Ok(EntityId(max + 1))
    }

    /// Every entity in every collection
    fn list_all(&self) -> StoreResult<Vec<Entity>> {
        let mut all = Vec::new();
        for collection in Collection::ALL {
            all.extend(self.list(collection)?);
        }
        Ok(all)
    }
}

/// Fail if any non-null reference of `entity` targets a missing entity
pub fn check_references<S: EntityStore + ?Sized>(store: &S, entity: &Entity) -> StoreResult<()> {
    for reference in entity.references() {
        if store.get(reference.target, reference.id)?.is_none() {
            return Err(StoreError::MissingReference {
                collection: entity.collection(),
                id: entity.id,
                field: reference.field,
                target: reference.target,
                target_id: reference.id,
            });
        }
    }
    Ok(())
}

/// Dependent changes required by deleting one entity
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeletePlan {
    /// Entities removed, the requested one first, cascaded dependents after
    pub deleted: Vec<Entity>,
    /// Dependents whose clear-on-delete references were nulled (new state)
    pub cleared: Vec<Entity>,
}

/// Compute the cascade/clear closure of deleting `(collection, id)`
///
/// Nothing is written; the caller applies the plan inside its own transaction.
pub fn plan_delete<S: EntityStore + ?Sized>(
    store: &S,
    collection: Collection,
    id: EntityId,
) -> StoreResult<DeletePlan> {
    let root = store
        .get(collection, id)?
        .ok_or(StoreError::NotFound { collection, id })?;

    let all = store.list_all()?;
    let mut plan = DeletePlan::default();
    let mut doomed: BTreeSet<EntityKey> = BTreeSet::new();
    let mut frontier = vec![root];

    while let Some(victim) = frontier.pop() {
        if !doomed.insert(victim.key()) {
            continue;
        }
        for candidate in &all {
            if doomed.contains(&candidate.key()) {
                continue;
            }
            let cascades = candidate.references().iter().any(|r| {
                r.target == victim.collection()
                    && r.id == victim.id
                    && r.on_delete == OnDelete::Cascade
            });
            if cascades {
                frontier.push(candidate.clone());
            }
        }
        plan.deleted.push(victim);
    }

    for candidate in &all {
        if doomed.contains(&candidate.key()) {
            continue;
        }
        let mut updated = candidate.clone();
        let mut changed = false;
        for reference in candidate.references() {
            if reference.on_delete == OnDelete::Clear
                && doomed.contains(&(reference.target, reference.id))
            {
                changed |= updated.clear_reference(reference.field);
            }
        }
        if changed {
            plan.cleared.push(updated);
        }
    }

    Ok(plan)
}
