//! Workspace facade
//!
//! The `Workspace` is the use-case layer over the local store. Every mutation:
//!
//! 1. validates the record and its references,
//! 2. writes the entity, its dependents and their pending operations in one
//!    transaction,
//! 3. notifies change listeners after commit,
//! 4. schedules the affected context artifacts for regeneration.
//!
//! ## Usage
//!
//! ```ignore
//! let mut workspace = Workspace::open(Config::load()?)?;
//!
//! let alder = workspace.create(Entity::group(0, "Alder").record)?;
//! workspace.flush()?;
//!
//! for artifact in workspace.artifacts()? {
//!     println!("{} {}", artifact.name, artifact.generated_at);
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{Collection, Entity, EntityId, EntityKey, OpKind, Record};
use crate::notify::{ChangeEvent, ChangeNotifier, SubscriptionId, ViewEvent};
use crate::queue::{PendingLog, PendingOp, SweepReport, Sweeper};
use crate::storage::{
    check_references, plan_delete, ContextExport, EntityStore, SqliteStore, StoreError,
    StoreResult,
};
use crate::sync::conflict::CommitPlan;
use crate::sync::SyncState;
use crate::views::{
    Artifact, ArtifactRegistry, ArtifactScope, ArtifactSummary, AuditEntry, PassReport,
    ViewEngine,
};
use crate::{from_ms, now_ms};

/// Entities touched by a delete
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteReport {
    /// The requested entity first, then cascaded dependents
    pub deleted: Vec<EntityKey>,
    /// Dependents whose references were cleared
    pub cleared: Vec<EntityKey>,
}

/// What a sync commit changed locally
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Remote copies recorded as the base (written if they differed)
    pub adopted: usize,
    /// Local entities removed
    pub removed: usize,
    /// Entity rows actually written
    pub written: usize,
    /// Ops appended to the queue
    pub queued: usize,
    /// Queued ops dropped
    pub discarded: usize,
    /// Base snapshots refreshed
    pub settled: usize,
    /// Base snapshots removed
    pub forgotten: usize,
    /// Ids moved by keep-both
    pub remapped: usize,
}

/// Local, base and queue state read in one go
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub local: Vec<Entity>,
    pub base: BTreeMap<EntityKey, Entity>,
    pub pending: BTreeSet<EntityKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnhealthyScope {
    pub scope: ArtifactScope,
    pub reason: String,
}

/// User-visible health of the workspace
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub pending_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_regeneration_at: Option<DateTime<Utc>>,
    /// Scopes waiting for the debounce timer
    pub pending_scopes: Vec<ArtifactScope>,
    pub unhealthy: Vec<UnhealthyScope>,
    /// Another instance wrote since this one last looked
    pub outdated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub root: PathBuf,
    pub bundles: Vec<PathBuf>,
}

pub struct Workspace {
    store: SqliteStore,
    notifier: ChangeNotifier,
    views: ViewEngine,
    config: Config,
}

impl Workspace {
    /// Open the workspace stored under `config.data_dir`
    ///
    /// Without a configured remote identity, the one stored with the data is
    /// used, generated on first open.
    pub fn open(config: Config) -> Result<Self> {
        let store = SqliteStore::open(&config).context("Failed to open local store")?;
        Self::with_store(store, config)
    }

    /// In-memory workspace with default settings
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    pub fn open_in_memory_with_config(config: Config) -> Result<Self> {
        let store = SqliteStore::open_in_memory().context("Failed to open in-memory store")?;
        Self::with_store(store, config)
    }

    fn with_store(store: SqliteStore, mut config: Config) -> Result<Self> {
        if config.context.remote_identity.is_empty() {
            config.context.remote_identity = SyncState::new(store.connection())
                .remote_identity(generate_identity)
                .context("Failed to load remote identity")?;
        }

        let mut notifier = ChangeNotifier::new();
        let views = ViewEngine::new(config.views.clone(), notifier.subscribe_channel());
        Ok(Self {
            store,
            notifier,
            views,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ==================== Mutations ====================

    /// Create an entity with the next free id of its collection
    pub fn create(&mut self, record: Record) -> Result<Entity> {
        let entity = self
            .store
            .write(|tx| {
                let id = tx.next_id(record.collection())?;
                let entity = Entity::new(id, record);
                check_references(&*tx, &entity)?;
                tx.put(&entity)?;
                tx.log()
                    .append(&entity.key(), OpKind::Add, Some(&entity), tx.now())?;
                Ok(entity)
            })
            .context("Failed to create entity")?;

        debug!(collection = %entity.collection(), id = %entity.id, "Created entity");
        self.after_commit(vec![ChangeEvent::added(entity.clone())]);
        Ok(entity)
    }

    /// Create an entity with an explicit id
    pub fn insert(&mut self, entity: Entity) -> Result<Entity> {
        let (collection, id) = entity.key();
        if self.store.get(collection, id)?.is_some() {
            bail!("{} {} already exists", collection, id);
        }

        let entity = self
            .store
            .write(|tx| {
                check_references(&*tx, &entity)?;
                tx.put(&entity)?;
                tx.log()
                    .append(&entity.key(), OpKind::Add, Some(&entity), tx.now())?;
                Ok(entity)
            })
            .with_context(|| format!("Failed to insert {} {}", collection, id))?;

        self.after_commit(vec![ChangeEvent::added(entity.clone())]);
        Ok(entity)
    }

    /// Replace an existing entity
    ///
    /// An update identical to the stored entity writes and queues nothing.
    pub fn update(&mut self, entity: Entity) -> Result<Entity> {
        let (collection, id) = entity.key();
        let previous = self
            .store
            .write(|tx| {
                let previous = tx
                    .get(collection, id)?
                    .ok_or(StoreError::NotFound { collection, id })?;
                if previous == entity {
                    return Ok(None);
                }
                check_references(&*tx, &entity)?;
                tx.put(&entity)?;
                tx.log()
                    .append(&entity.key(), OpKind::Update, Some(&entity), tx.now())?;
                Ok(Some(previous))
            })
            .with_context(|| format!("Failed to update {} {}", collection, id))?;

        if let Some(previous) = previous {
            self.after_commit(vec![ChangeEvent::updated(previous, entity.clone())]);
        }
        Ok(entity)
    }

    /// Delete an entity, cascading or clearing dependents per reference policy
    ///
    /// Every dependent change queues its own operation. Cleared references are
    /// queued first, then deletes with dependents ahead of what they point at.
    pub fn delete(&mut self, collection: Collection, id: EntityId) -> Result<DeleteReport> {
        let (report, events) = self
            .store
            .write(|tx| {
                let plan = plan_delete(&*tx, collection, id)?;
                let report = DeleteReport {
                    deleted: plan.deleted.iter().map(Entity::key).collect(),
                    cleared: plan.cleared.iter().map(Entity::key).collect(),
                };
                let mut events = Vec::new();

                for updated in plan.cleared {
                    let previous = tx
                        .get(updated.collection(), updated.id)?
                        .ok_or(StoreError::NotFound {
                            collection: updated.collection(),
                            id: updated.id,
                        })?;
                    tx.put(&updated)?;
                    tx.log()
                        .append(&updated.key(), OpKind::Update, Some(&updated), tx.now())?;
                    events.push(ChangeEvent::updated(previous, updated));
                }
                for victim in dependents_first(plan.deleted) {
                    tx.delete(victim.collection(), victim.id)?;
                    tx.log()
                        .append(&victim.key(), OpKind::Delete, None, tx.now())?;
                    events.push(ChangeEvent::deleted(victim));
                }
                Ok((report, events))
            })
            .with_context(|| format!("Failed to delete {} {}", collection, id))?;

        debug!(
            %collection,
            %id,
            cascaded = report.deleted.len() - 1,
            cleared = report.cleared.len(),
            "Deleted entity"
        );
        self.after_commit(events);
        Ok(report)
    }

    /// Notify listeners and schedule regeneration for committed changes
    ///
    /// The mutation is already durable; failures here are logged only.
    fn after_commit(&mut self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            self.notifier.notify(event);
        }
        if let Err(e) = self.views.ingest(&mut self.store, Instant::now()) {
            warn!(error = %e, "Failed to schedule context regeneration");
        }
    }

    // ==================== Queries ====================

    pub fn get(&self, collection: Collection, id: EntityId) -> Result<Option<Entity>> {
        self.store
            .get(collection, id)
            .with_context(|| format!("Failed to get {} {}", collection, id))
    }

    pub fn list(&self, collection: Collection) -> Result<Vec<Entity>> {
        self.store
            .list(collection)
            .with_context(|| format!("Failed to list {}", collection.plural()))
    }

    pub fn list_all(&self) -> Result<Vec<Entity>> {
        self.store.list_all().context("Failed to list entities")
    }

    /// Unconfirmed operations, oldest first
    pub fn pending_ops(&self) -> Result<Vec<PendingOp>> {
        self.queued_ops().context("Failed to read pending operations")
    }

    /// Whether any local mutation has not reached the remote yet
    pub fn has_pending(&self) -> Result<bool> {
        PendingLog::new(self.store.connection())
            .has_pending()
            .context("Failed to read pending operations")
    }

    // ==================== Notifications ====================

    /// Listen to every committed entity mutation
    pub fn subscribe_changes(
        &mut self,
        callback: impl Fn(&ChangeEvent) -> Result<()> + Send + 'static,
    ) -> SubscriptionId {
        self.notifier.subscribe(callback)
    }

    pub fn unsubscribe_changes(&mut self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Listen to `generation-complete` and `contexts-updated`
    pub fn subscribe(
        &mut self,
        callback: impl Fn(&ViewEvent) -> Result<()> + Send + 'static,
    ) -> SubscriptionId {
        self.views.events().subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.views.events().unsubscribe(id)
    }

    // ==================== Context views ====================

    /// Regenerate every debounced scope now
    pub fn flush(&mut self) -> Result<Option<PassReport>> {
        self.views
            .flush(&mut self.store)
            .context("Failed to flush context regeneration")
    }

    /// Regenerate the given scopes, or all of them, bypassing the debounce
    pub fn regenerate_now(
        &mut self,
        scopes: Option<BTreeSet<ArtifactScope>>,
    ) -> Result<PassReport> {
        self.views
            .regenerate_now(&mut self.store, scopes)
            .context("Failed to regenerate contexts")
    }

    /// Run the debounced pass if its quiet period has elapsed
    pub fn run_due_regeneration(&mut self, now: Instant) -> Result<Option<PassReport>> {
        self.views
            .run_due(&mut self.store, now)
            .context("Failed to run debounced regeneration")
    }

    pub fn next_regeneration_at(&self) -> Option<Instant> {
        self.views.deadline()
    }

    pub fn artifacts(&self) -> Result<Vec<ArtifactSummary>> {
        ArtifactRegistry::new(self.store.connection())
            .artifacts()
            .context("Failed to list artifacts")
    }

    pub fn artifact(&self, scope: ArtifactScope) -> Result<Option<Artifact>> {
        ArtifactRegistry::new(self.store.connection())
            .artifact(scope)
            .with_context(|| format!("Failed to read artifact {}", scope))
    }

    pub fn audit_log(&self, scope: Option<ArtifactScope>, limit: usize) -> Result<Vec<AuditEntry>> {
        ArtifactRegistry::new(self.store.connection())
            .audit_log(scope, limit)
            .context("Failed to read regeneration log")
    }

    /// Flush, then write every artifact bundle under `dir`
    /// (default `{data_dir}/contexts`)
    pub fn export_contexts(&mut self, dir: Option<&Path>) -> Result<ExportReport> {
        self.flush()?;

        let export = match dir {
            Some(dir) => ContextExport::new(dir),
            None => ContextExport::for_config(&self.config),
        };
        let mut bundles = Vec::new();
        for summary in self.artifacts()? {
            if let Some(artifact) = self.artifact(summary.scope)? {
                bundles.push(export.write_bundle(&artifact.bundle)?);
            }
        }
        Ok(ExportReport {
            root: export.root().to_path_buf(),
            bundles,
        })
    }

    // ==================== Maintenance ====================

    pub fn status(&self) -> Result<Status> {
        let conn = self.store.connection();
        let registry = ArtifactRegistry::new(conn);
        let stale_after_ms = i64::try_from(self.config.views.stale_after().as_millis())
            .unwrap_or(i64::MAX);
        let cutoff = from_ms(now_ms().saturating_sub(stale_after_ms));

        let unhealthy = registry
            .artifacts()?
            .into_iter()
            .filter(|a| a.is_unhealthy(cutoff))
            .map(|a| UnhealthyScope {
                scope: a.scope,
                reason: match a.last_error {
                    Some(error) => format!("last regeneration failed: {}", error),
                    None => "stale beyond the expected bound".to_string(),
                },
            })
            .collect();

        Ok(Status {
            pending_count: PendingLog::new(conn).pending_count()?,
            last_sync_at: SyncState::new(conn).last_sync_at()?,
            last_regeneration_at: registry.last_regeneration_at()?,
            pending_scopes: self.views.pending_scopes().iter().copied().collect(),
            unhealthy,
            outdated: self.store.is_outdated()?,
        })
    }

    pub fn sweep(&mut self, sweeper: &Sweeper) -> Result<SweepReport> {
        sweeper
            .sweep(&mut self.store, now_ms())
            .context("Failed to sweep pending operations")
    }

    /// Accept writes made by another instance so this one may write again
    pub fn reload(&mut self) -> Result<i64> {
        self.store.reload().context("Failed to reload store")
    }

    // ==================== Sync hooks ====================

    pub fn sync_snapshot(&self) -> StoreResult<SyncSnapshot> {
        let conn = self.store.connection();
        Ok(SyncSnapshot {
            local: self.store.list_all()?,
            base: SyncState::new(conn).load_base()?,
            pending: PendingLog::new(conn).pending_keys()?,
        })
    }

    pub fn queued_ops(&self) -> StoreResult<Vec<PendingOp>> {
        PendingLog::new(self.store.connection()).list_pending()
    }

    /// Record that the remote accepted `op`
    ///
    /// Later ops of the same entity stay queued.
    pub fn confirm_pushed(&mut self, op: &PendingOp) -> StoreResult<()> {
        self.store.write(|tx| {
            tx.log().confirm_through(&op.key(), op.seq, tx.now())?;
            let state = SyncState::new(tx.conn());
            match (&op.op, &op.payload) {
                (OpKind::Delete, _) => {
                    state.clear_base(&op.key())?;
                }
                (_, Some(payload)) => state.set_base(payload, tx.now())?,
                (_, None) => {}
            }
            Ok(())
        })
    }

    /// Drop an op the remote rejected permanently
    ///
    /// The base moves to the rejected state so the change is not queued
    /// again; the next refresh then adopts whatever the remote holds.
    pub fn drop_op(&mut self, op: &PendingOp) -> StoreResult<()> {
        self.store.write(|tx| {
            tx.log().discard(op.seq)?;
            let state = SyncState::new(tx.conn());
            match (&op.op, &op.payload) {
                (OpKind::Delete, _) => {
                    state.clear_base(&op.key())?;
                }
                (_, Some(payload)) => state.set_base(payload, tx.now())?,
                (_, None) => {}
            }
            Ok(())
        })
    }

    pub fn record_sync(&mut self, now: i64) -> StoreResult<()> {
        self.store
            .write(|tx| SyncState::new(tx.conn()).set_last_sync_at(now))
    }

    /// Apply a reconciliation result in one transaction
    pub fn apply_commit(&mut self, commit: &CommitPlan) -> StoreResult<ApplyReport> {
        let mut events = Vec::new();
        let report = self.store.write(|tx| {
            let mut report = ApplyReport {
                remapped: commit.remapped.len(),
                ..ApplyReport::default()
            };

            for key in &commit.discard {
                report.discarded += tx.log().discard_for(key)?;
            }

            let mut adopt: Vec<&Entity> = commit.adopt.iter().collect();
            adopt.sort_by_key(|e| (e.collection().dependency_rank(), e.id));
            for entity in adopt {
                let previous = tx.get(entity.collection(), entity.id)?;
                if previous.as_ref() != Some(entity) {
                    tx.put(entity)?;
                    report.written += 1;
                    events.push(match previous {
                        Some(previous) => ChangeEvent::updated(previous, entity.clone()),
                        None => ChangeEvent::added(entity.clone()),
                    });
                }
                SyncState::new(tx.conn()).set_base(entity, tx.now())?;
                report.adopted += 1;
            }

            for key in &commit.remove {
                if let Some(previous) = tx.get(key.0, key.1)? {
                    tx.delete(key.0, key.1)?;
                    events.push(ChangeEvent::deleted(previous));
                    report.removed += 1;
                }
                SyncState::new(tx.conn()).clear_base(key)?;
            }

            for entity in &commit.local_puts {
                let previous = tx.get(entity.collection(), entity.id)?;
                tx.put(entity)?;
                report.written += 1;
                events.push(match previous {
                    Some(previous) => ChangeEvent::updated(previous, entity.clone()),
                    None => ChangeEvent::added(entity.clone()),
                });
            }

            for outgoing in &commit.outgoing {
                tx.log().append(
                    &(outgoing.collection, outgoing.id),
                    outgoing.op,
                    outgoing.payload.as_ref(),
                    tx.now(),
                )?;
                report.queued += 1;
            }

            for entity in &commit.settle {
                SyncState::new(tx.conn()).set_base(entity, tx.now())?;
                report.settled += 1;
            }
            for key in &commit.forget {
                if SyncState::new(tx.conn()).clear_base(key)? {
                    report.forgotten += 1;
                }
            }
            Ok(report)
        })?;

        self.after_commit(events);
        Ok(report)
    }
}

fn generate_identity() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("lorekeep-{}", &id[..8])
}

/// Order cascaded deletes so no entity is deleted before one referencing it
fn dependents_first(mut victims: Vec<Entity>) -> Vec<Entity> {
    victims.reverse();
    victims.sort_by_key(|e| std::cmp::Reverse(e.collection().dependency_rank()));
    victims
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::notify::CONTEXTS_UPDATED;
    use crate::views::{Bundle, Trigger};
    use tempfile::TempDir;

    fn workspace_with(min_members: usize) -> Workspace {
        let mut config = Config::default();
        config.views.min_members = min_members;
        config.views.debounce_ms = 200;
        Workspace::open_in_memory_with_config(config).unwrap()
    }

    fn group(w: &mut Workspace, name: &str) -> Entity {
        w.create(Entity::group(0, name).record).unwrap()
    }

    fn member(w: &mut Workspace, name: &str, group: &Entity) -> Entity {
        w.create(Entity::person(0, name, Some(group.id.0)).record)
            .unwrap()
    }

    fn bundle(w: &Workspace, scope: ArtifactScope) -> Bundle {
        w.artifact(scope).unwrap().unwrap().bundle
    }

    #[test]
    fn test_create_assigns_ids_and_queues() {
        let mut w = workspace_with(10);
        let alder = group(&mut w, "Alder");
        let birch = group(&mut w, "Birch");
        assert_eq!(alder.id, EntityId(1));
        assert_eq!(birch.id, EntityId(2));

        assert!(w.has_pending().unwrap());
        let ops = w.pending_ops().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op, OpKind::Add);
        assert_eq!(ops[0].payload.as_ref(), Some(&alder));
    }

    #[test]
    fn test_missing_reference_writes_nothing() {
        let mut w = workspace_with(10);
        let err = w
            .create(Entity::person(0, "Aldric", Some(42)).record)
            .unwrap_err();
        assert!(err
            .chain()
            .any(|cause| cause.to_string().contains("references missing group 42")));

        assert!(w.list(Collection::Person).unwrap().is_empty());
        assert!(!w.has_pending().unwrap());
    }

    #[test]
    fn test_delete_cascades_and_clears() {
        let mut w = workspace_with(10);
        let alder = group(&mut w, "Alder");
        let aldric = member(&mut w, "Aldric", &alder);
        let bera = member(&mut w, "Bera", &alder);
        w.create(Entity::relationship(0, aldric.id.0, bera.id.0, "sibling").record)
            .unwrap();
        w.create(Entity::title(0, "Warden", Some(aldric.id.0)).record)
            .unwrap();

        let report = w.delete(Collection::Person, aldric.id).unwrap();
        assert_eq!(report.deleted[0], aldric.key());
        assert!(report.deleted.contains(&(Collection::Relationship, EntityId(1))));
        assert_eq!(report.cleared, vec![(Collection::Title, EntityId(1))]);

        let warden = w.get(Collection::Title, EntityId(1)).unwrap().unwrap();
        assert!(warden.references().is_empty());

        let tail: Vec<OpKind> = w.pending_ops().unwrap()[5..].iter().map(|op| op.op).collect();
        assert_eq!(tail, vec![OpKind::Update, OpKind::Delete, OpKind::Delete]);
    }

    #[test]
    fn test_cascade_queues_dependents_before_root() {
        let mut w = workspace_with(10);
        let alder = group(&mut w, "Alder");
        let aldric = member(&mut w, "Aldric", &alder);
        let bera = member(&mut w, "Bera", &alder);
        let sibling = w
            .create(Entity::relationship(0, aldric.id.0, bera.id.0, "sibling").record)
            .unwrap();

        let report = w.delete(Collection::Person, aldric.id).unwrap();
        assert_eq!(report.deleted, vec![aldric.key(), sibling.key()]);

        let deletes: Vec<EntityKey> = w
            .pending_ops()
            .unwrap()
            .iter()
            .filter(|op| op.op == OpKind::Delete)
            .map(|op| op.key())
            .collect();
        assert_eq!(deletes, vec![sibling.key(), aldric.key()]);
    }

    #[test]
    fn test_update_unchanged_queues_nothing() {
        let mut w = workspace_with(10);
        let alder = group(&mut w, "Alder");
        w.update(alder.clone()).unwrap();
        assert_eq!(w.pending_ops().unwrap().len(), 1);
        assert!(w.update(Entity::group(9, "Nowhere")).is_err());
    }

    #[test]
    fn test_listener_failure_does_not_abort_mutation() {
        let mut w = workspace_with(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        w.subscribe_changes(|_| anyhow::bail!("listener broke"));
        w.subscribe_changes(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let alder = group(&mut w, "Alder");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(w.get(Collection::Group, alder.id).unwrap().is_some());
    }

    #[test]
    fn test_group_promoted_once_threshold_reached() {
        let mut w = workspace_with(10);
        let alder = group(&mut w, "Alder");
        let birch = group(&mut w, "Birch");
        for i in 0..8 {
            member(&mut w, &format!("Alder {}", i), &alder);
        }
        member(&mut w, "Bera", &birch);
        w.flush().unwrap();

        assert!(w.artifact(ArtifactScope::Group(alder.id)).unwrap().is_none());
        assert_eq!(bundle(&w, ArtifactScope::Minor).items("members.json").unwrap().len(), 9);

        member(&mut w, "Alder 8", &alder);
        member(&mut w, "Alder 9", &alder);
        let report = w.flush().unwrap().unwrap();
        assert_eq!(report.promoted, vec![alder.id]);

        let dedicated = bundle(&w, ArtifactScope::Group(alder.id));
        assert_eq!(dedicated.index().unwrap()["stats"]["member_count"], 10);

        let minor_members = bundle(&w, ArtifactScope::Minor).items("members.json").unwrap();
        assert_eq!(minor_members.len(), 1);
        assert_eq!(minor_members[0]["name"], "Bera");
    }

    #[test]
    fn test_regenerate_twice_yields_identical_content() {
        let mut w = workspace_with(2);
        let alder = group(&mut w, "Alder");
        member(&mut w, "Aldric", &alder);
        member(&mut w, "Alys", &alder);
        w.flush().unwrap();

        let first = w.regenerate_now(None).unwrap();
        let before: Vec<Bundle> = first.regenerated.iter().map(|s| bundle(&w, *s)).collect();
        let second = w.regenerate_now(None).unwrap();
        let after: Vec<Bundle> = second.regenerated.iter().map(|s| bundle(&w, *s)).collect();

        assert_eq!(first.regenerated.len(), 3);
        assert_eq!(before, after);
    }

    #[test]
    fn test_burst_of_edits_coalesces_into_one_pass() {
        let mut w = workspace_with(1);
        let alder = group(&mut w, "Alder");
        let mut aldric = member(&mut w, "Aldric", &alder);
        w.flush().unwrap();
        let scope = ArtifactScope::Group(alder.id);
        assert_eq!(w.audit_log(Some(scope), 100).unwrap().len(), 1);

        for i in 0..5 {
            if let Record::Person(p) = &mut aldric.record {
                p.name = format!("Aldric {}", i);
            }
            aldric = w.update(aldric).unwrap();
        }
        assert!(w.run_due_regeneration(Instant::now()).unwrap().is_none());

        let quiet = Instant::now() + Duration::from_millis(250);
        let report = w.run_due_regeneration(quiet).unwrap().unwrap();
        assert_eq!(report.trigger, Trigger::Debounced);

        let audit = w.audit_log(Some(scope), 100).unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].trigger, Trigger::Debounced);
        assert_eq!(
            bundle(&w, scope).items("members.json").unwrap()[0]["name"],
            "Aldric 4"
        );
    }

    #[test]
    fn test_contexts_updated_event() {
        let mut w = workspace_with(10);
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updates);
        w.subscribe(move |event| {
            if event.name == CONTEXTS_UPDATED {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        group(&mut w, "Alder");
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        w.flush().unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_export_flushes_and_writes_bundles() {
        let temp = TempDir::new().unwrap();
        let mut w = workspace_with(10);
        let alder = group(&mut w, "Alder");
        member(&mut w, "Aldric", &alder);

        let report = w.export_contexts(Some(temp.path())).unwrap();
        assert_eq!(report.bundles.len(), 2);

        let people = std::fs::read_to_string(temp.path().join("world/people.json")).unwrap();
        assert!(people.contains("Aldric"));
        assert!(temp.path().join("minor-groups/index.json").exists());
    }

    #[test]
    fn test_status() {
        let mut w = workspace_with(10);
        group(&mut w, "Alder");

        let status = w.status().unwrap();
        assert_eq!(status.pending_count, 1);
        assert!(status.last_sync_at.is_none());
        assert!(status.last_regeneration_at.is_none());
        assert!(status.pending_scopes.contains(&ArtifactScope::Global));
        assert!(!status.outdated);

        w.flush().unwrap();
        let status = w.status().unwrap();
        assert!(status.last_regeneration_at.is_some());
        assert!(status.pending_scopes.is_empty());
        assert!(status.unhealthy.is_empty());
    }

    #[test]
    fn test_second_instance_must_reload() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp.path());
        let mut first = Workspace::open(config.clone()).unwrap();
        let mut second = Workspace::open(config).unwrap();

        group(&mut first, "Alder");
        assert!(second.status().unwrap().outdated);

        let err = second.create(Entity::group(0, "Birch").record).unwrap_err();
        assert!(err
            .chain()
            .any(|cause| cause.to_string().contains("another instance")));

        second.reload().unwrap();
        let birch = group(&mut second, "Birch");
        assert_eq!(birch.id, EntityId(2));
    }

    #[test]
    fn test_remote_identity_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp.path());
        let identity = Workspace::open(config.clone())
            .unwrap()
            .config()
            .context
            .remote_identity
            .clone();
        assert!(identity.starts_with("lorekeep-"));

        let reopened = Workspace::open(config.clone()).unwrap();
        assert_eq!(reopened.config().context.remote_identity, identity);

        let mut pinned = config;
        pinned.context.remote_identity = "desk".to_string();
        let pinned = Workspace::open(pinned).unwrap();
        assert_eq!(pinned.config().context.remote_identity, "desk");
    }

    #[test]
    fn test_confirm_keeps_later_ops_queued() {
        let mut w = workspace_with(10);
        let alder = group(&mut w, "Alder");
        let add = w.queued_ops().unwrap().remove(0);

        let mut renamed = alder.clone();
        if let Record::Group(g) = &mut renamed.record {
            g.name = "Alder Vale".to_string();
        }
        w.update(renamed).unwrap();

        w.confirm_pushed(&add).unwrap();
        let pending = w.queued_ops().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, OpKind::Update);
        assert_eq!(w.sync_snapshot().unwrap().base[&alder.key()], alder);
    }
}
