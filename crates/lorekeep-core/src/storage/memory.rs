//! In-memory entity store

use std::collections::BTreeMap;

use super::{EntityStore, StoreResult};
use crate::models::{Collection, Entity, EntityId, EntityKey};

/// Entity store backed by an ordered map
///
/// Used to assemble and validate batches (e.g. conflict resolution) before
/// anything touches the durable store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemoryStore {
    entities: BTreeMap<EntityKey, Entity>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        Self {
            entities: entities.into_iter().map(|e| (e.key(), e)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.values_mut()
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<Entity> {
        self.entities.remove(key)
    }

    pub fn into_entities(self) -> Vec<Entity> {
        self.entities.into_values().collect()
    }
}

impl EntityStore for MemoryStore {
    fn get(&self, collection: Collection, id: EntityId) -> StoreResult<Option<Entity>> {
        Ok(self.entities.get(&(collection, id)).cloned())
    }

    fn put(&mut self, entity: &Entity) -> StoreResult<()> {
        entity.validate()?;
        self.entities.insert(entity.key(), entity.clone());
        Ok(())
    }

    fn delete(&mut self, collection: Collection, id: EntityId) -> StoreResult<bool> {
        Ok(self.entities.remove(&(collection, id)).is_some())
    }

    fn list(&self, collection: Collection) -> StoreResult<Vec<Entity>> {
        Ok(self
            .entities
            .range((collection, EntityId(i64::MIN))..=(collection, EntityId(i64::MAX)))
            .map(|(_, e)| e.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_is_scoped_to_collection() {
        let mut store = MemoryStore::new();
        store.put(&Entity::group(2, "Alder")).unwrap();
        store.put(&Entity::person(1, "Aldric", None)).unwrap();
        store.put(&Entity::person(5, "Bera", None)).unwrap();

        let people = store.list(Collection::Person).unwrap();
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].id, EntityId(1));
        assert_eq!(store.list(Collection::Group).unwrap().len(), 1);
    }

    #[test]
    fn test_put_validates() {
        let mut store = MemoryStore::new();
        assert!(store.put(&Entity::group(1, "")).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete() {
        let mut store = MemoryStore::from_entities([Entity::group(1, "Alder")]);
        assert!(store.delete(Collection::Group, EntityId(1)).unwrap());
        assert!(!store.delete(Collection::Group, EntityId(1)).unwrap());
    }
}
