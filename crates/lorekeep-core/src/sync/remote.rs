//! Remote authority contract
//!
//! The remote authority is the single shared store that becomes the source of
//! truth once reconciled. It exposes two network-fallible calls: pull a whole
//! collection, and push one entity mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;

use crate::config::SyncContext;
use crate::models::{Collection, Entity, EntityId, EntityKey, OpKind};

/// Whether a failed call is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Network trouble, timeouts, server overload: retry with backoff
    Transient,
    /// The remote rejected the operation: retrying cannot succeed
    Permanent,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::Transient => f.write_str("transient"),
            RemoteErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind} remote error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }
}

/// One entity mutation sent to the remote
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushRequest {
    pub collection: Collection,
    pub id: EntityId,
    pub op: OpKind,
    /// Entity state to store (absent for deletes)
    pub payload: Option<Entity>,
}

impl PushRequest {
    pub fn key(&self) -> EntityKey {
        (self.collection, self.id)
    }
}

/// Remote authority operations
///
/// Every call receives the [`SyncContext`] naming the identity, workspace and
/// dataset it acts on.
pub trait RemoteAuthority: Send + Sync {
    /// Full current set of one collection
    fn pull(
        &self,
        ctx: &SyncContext,
        collection: Collection,
    ) -> impl Future<Output = Result<Vec<Entity>, RemoteError>> + Send;

    /// Apply one mutation
    fn push_one(
        &self,
        ctx: &SyncContext,
        request: &PushRequest,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// In-process remote authority
///
/// Useful for tests and offline demos. Can be switched offline and told to
/// fail pushes for particular entities.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    entities: Mutex<BTreeMap<EntityKey, Entity>>,
    offline: AtomicBool,
    failing: Mutex<BTreeSet<EntityKey>>,
    rejecting: Mutex<BTreeSet<EntityKey>>,
    rejections: AtomicUsize,
    pushes: Mutex<Vec<PushRequest>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let remote = Self::new();
        remote.seed(entities);
        remote
    }

    /// Insert entities directly, bypassing the push path
    pub fn seed(&self, entities: impl IntoIterator<Item = Entity>) {
        let mut map = lock(&self.entities);
        for entity in entities {
            map.insert(entity.key(), entity);
        }
    }

    /// Remove an entity directly, bypassing the push path
    pub fn remove(&self, key: &EntityKey) -> Option<Entity> {
        lock(&self.entities).remove(key)
    }

    pub fn get(&self, collection: Collection, id: EntityId) -> Option<Entity> {
        lock(&self.entities).get(&(collection, id)).cloned()
    }

    pub fn entities(&self) -> Vec<Entity> {
        lock(&self.entities).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entities).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate losing connectivity: every call fails transiently
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make pushes for one entity fail transiently until cleared
    pub fn fail_pushes_for(&self, key: EntityKey, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    /// Make pushes for one entity fail permanently until cleared
    pub fn reject_pushes_for(&self, key: EntityKey, rejecting: bool) {
        let mut set = lock(&self.rejecting);
        if rejecting {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    /// Pushes refused permanently so far
    pub fn rejections(&self) -> usize {
        self.rejections.load(Ordering::SeqCst)
    }

    /// Every push received, in arrival order
    pub fn pushes(&self) -> Vec<PushRequest> {
        lock(&self.pushes).clone()
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("remote unreachable"));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RemoteAuthority for MemoryRemote {
    async fn pull(&self, _ctx: &SyncContext, collection: Collection) -> Result<Vec<Entity>, RemoteError> {
        self.check_online()?;
        Ok(lock(&self.entities)
            .values()
            .filter(|e| e.collection() == collection)
            .cloned()
            .collect())
    }

    async fn push_one(&self, _ctx: &SyncContext, request: &PushRequest) -> Result<(), RemoteError> {
        self.check_online()?;
        if lock(&self.failing).contains(&request.key()) {
            return Err(RemoteError::transient(format!(
                "{} {} temporarily rejected",
                request.collection, request.id
            )));
        }
        if lock(&self.rejecting).contains(&request.key()) {
            self.rejections.fetch_add(1, Ordering::SeqCst);
            return Err(RemoteError::permanent(format!(
                "{} {} rejected",
                request.collection, request.id
            )));
        }

        let mut entities = lock(&self.entities);
        match (request.op, &request.payload) {
            (OpKind::Delete, _) => {
                if entities.remove(&request.key()).is_none() {
                    return Err(RemoteError::permanent(format!(
                        "{} {} does not exist",
                        request.collection, request.id
                    )));
                }
            }
            (_, Some(entity)) => {
                entities.insert(request.key(), entity.clone());
            }
            (op, None) => {
                return Err(RemoteError::permanent(format!("{} without payload", op)));
            }
        }
        drop(entities);

        lock(&self.pushes).push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SyncContext {
        SyncContext::default()
    }

    #[tokio::test]
    async fn test_pull_filters_collection() {
        let remote = MemoryRemote::with_entities([
            Entity::group(1, "Alder"),
            Entity::person(1, "Aldric", Some(1)),
        ]);

        let people = remote.pull(&ctx(), Collection::Person).await.unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].label(), "Aldric");
    }

    #[tokio::test]
    async fn test_offline_is_transient() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);

        let err = remote.pull(&ctx(), Collection::Group).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_delete_of_missing_entity_is_permanent() {
        let remote = MemoryRemote::new();
        let request = PushRequest {
            collection: Collection::Person,
            id: EntityId(4),
            op: OpKind::Delete,
            payload: None,
        };

        let err = remote.push_one(&ctx(), &request).await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Permanent);
        assert!(remote.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_failing_entity_only() {
        let remote = MemoryRemote::new();
        let alder = Entity::group(1, "Alder");
        let birch = Entity::group(2, "Birch");
        remote.fail_pushes_for(alder.key(), true);

        let push = |entity: &Entity| PushRequest {
            collection: entity.collection(),
            id: entity.id,
            op: OpKind::Add,
            payload: Some(entity.clone()),
        };

        assert!(remote.push_one(&ctx(), &push(&alder)).await.unwrap_err().is_transient());
        remote.push_one(&ctx(), &push(&birch)).await.unwrap();
        assert_eq!(remote.len(), 1);
    }
}
