//! Remote sync engine
//!
//! Drives reconciliation between the local [`Workspace`] and a
//! [`RemoteAuthority`]. The workspace is shared behind an async mutex; the
//! engine holds the lock only while reading or writing local state, never
//! across a remote call, so local mutations keep flowing during a push.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::conflict::{self, CommitPlan, Conflict, Outgoing, ResolveError, Strategy, SyncPlan};
use super::remote::{PushRequest, RemoteAuthority, RemoteError};
use crate::config::SyncContext;
use crate::models::{Collection, Entity, EntityId, EntityKey, OpKind};
use crate::now_ms;
use crate::storage::StoreError;
use crate::workspace::{ApplyReport, Workspace};

/// Sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("{count} local change(s) not yet synced; push them first or pull with --preserve-pending")]
    PendingWork { count: usize },

    #[error("Local data changed since conflicts were detected; detect conflicts again")]
    StaleReconciliation,
}

impl SyncError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_transient())
    }
}

/// A detected divergence, kept until the operator picks a strategy
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub plan: SyncPlan,
    /// Local set the plan was computed from
    pub local: Vec<Entity>,
    /// Remote set the plan was computed from
    pub remote: Vec<Entity>,
}

impl Reconciliation {
    pub fn conflicts(&self) -> &[Conflict] {
        &self.plan.conflicts
    }
}

/// Result of a first-run reconcile
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Nothing differed
    InSync,
    /// Remote was empty: every local entity was queued and pushed
    Pushed { queued: usize, push: PushReport },
    /// Local was empty: the remote set was adopted
    Pulled { adopted: usize },
    /// Both populated, only one-sided changes: applied directly
    Merged { applied: ApplyReport },
    /// Both populated with conflicts: nothing written, operator must resolve
    Diverged { reconciliation: Reconciliation },
}

/// An op the remote rejected permanently
#[derive(Debug, Clone, Serialize)]
pub struct DroppedOp {
    pub seq: i64,
    pub collection: Collection,
    pub id: EntityId,
    pub op: OpKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PushReport {
    /// Ops confirmed by the remote
    pub pushed: usize,
    /// Ops dropped after a permanent failure
    pub dropped: Vec<DroppedOp>,
    /// Transient failures; the affected entities stay queued
    pub transient_failures: usize,
    /// Entities whose remaining ops were held back this pass
    pub blocked: Vec<EntityKey>,
    /// Another pass was already running and will pick up new ops
    pub coalesced: bool,
}

impl PushReport {
    pub fn is_clean(&self) -> bool {
        self.transient_failures == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveReport {
    pub strategy: Strategy,
    pub resolved: Vec<Conflict>,
    pub applied: ApplyReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub applied: ApplyReport,
    /// Conflicts found but left untouched
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRound {
    pub push: PushReport,
    pub refresh: RefreshReport,
}

/// How a full pull treats unsynced local work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    /// Fail if anything is still queued
    Refuse,
    /// Overwrite everything except entities with queued ops
    PreservePending,
}

/// Shared handle to a workspace
pub type SharedWorkspace = Mutex<Workspace>;

pub struct SyncEngine<R> {
    remote: R,
    context: SyncContext,
    pushing: AtomicBool,
}

/// Clears the in-progress flag when a push pass ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<R: RemoteAuthority> SyncEngine<R> {
    pub fn new(remote: R, context: SyncContext) -> Self {
        Self {
            remote,
            context,
            pushing: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn is_pushing(&self) -> bool {
        self.pushing.load(Ordering::SeqCst)
    }

    /// Pull every collection
    pub async fn pull_all(&self) -> Result<Vec<Entity>, SyncError> {
        let mut all = Vec::new();
        for collection in Collection::ALL {
            let entities = self.remote.pull(&self.context, collection).await?;
            debug!(%collection, count = entities.len(), "Pulled collection");
            all.extend(entities);
        }
        Ok(all)
    }

    /// First-run reconciliation
    ///
    /// Pushes everything if the remote is empty, adopts the remote if the
    /// local store is empty, otherwise plans against the sync base and applies
    /// the result only when it contains no conflicts.
    pub async fn initial_reconcile(
        &self,
        workspace: &SharedWorkspace,
    ) -> Result<ReconcileOutcome, SyncError> {
        let remote = self.pull_all().await?;

        let mut ws = workspace.lock().await;
        let snapshot = ws.sync_snapshot()?;

        if remote.is_empty() {
            if snapshot.local.is_empty() && snapshot.pending.is_empty() {
                return Ok(ReconcileOutcome::InSync);
            }
            let commit = CommitPlan {
                outgoing: snapshot
                    .local
                    .iter()
                    .filter(|e| !snapshot.pending.contains(&e.key()))
                    .map(|e| Outgoing {
                        collection: e.collection(),
                        id: e.id,
                        op: OpKind::Add,
                        payload: Some(e.clone()),
                    })
                    .collect(),
                forget: snapshot.base.keys().copied().collect(),
                ..CommitPlan::default()
            };
            let applied = ws.apply_commit(&commit)?;
            drop(ws);

            info!(queued = applied.queued, "Remote empty; pushing local store");
            let push = self.push_queued(workspace).await?;
            return Ok(ReconcileOutcome::Pushed {
                queued: applied.queued,
                push,
            });
        }

        if snapshot.local.is_empty() && snapshot.pending.is_empty() {
            let remote_keys: BTreeSet<EntityKey> = remote.iter().map(|e| e.key()).collect();
            let commit = CommitPlan {
                forget: snapshot
                    .base
                    .keys()
                    .filter(|k| !remote_keys.contains(k))
                    .copied()
                    .collect(),
                adopt: remote,
                ..CommitPlan::default()
            };
            let applied = ws.apply_commit(&commit)?;
            info!(adopted = applied.adopted, "Local store empty; adopted remote");
            return Ok(ReconcileOutcome::Pulled {
                adopted: applied.adopted,
            });
        }

        let mut plan = conflict::plan(&snapshot.local, &remote, &snapshot.base, &snapshot.pending);
        plan.hold_dangling(&snapshot.local);
        if plan.has_conflicts() {
            info!(conflicts = plan.conflicts.len(), "Local and remote diverged");
            return Ok(ReconcileOutcome::Diverged {
                reconciliation: Reconciliation {
                    plan,
                    local: snapshot.local,
                    remote,
                },
            });
        }
        if plan.is_noop() {
            return Ok(ReconcileOutcome::InSync);
        }

        let applied = ws.apply_commit(&plan.one_sided())?;
        Ok(ReconcileOutcome::Merged { applied })
    }

    /// Pull and compare without writing anything
    pub async fn detect_conflicts(
        &self,
        workspace: &SharedWorkspace,
    ) -> Result<Reconciliation, SyncError> {
        let remote = self.pull_all().await?;
        let snapshot = workspace.lock().await.sync_snapshot()?;
        let mut plan = conflict::plan(&snapshot.local, &remote, &snapshot.base, &snapshot.pending);
        plan.hold_dangling(&snapshot.local);
        debug!(
            conflicts = plan.conflicts.len(),
            adopt = plan.adopt.len(),
            outgoing = plan.outgoing.len(),
            "Detected sync differences"
        );
        Ok(Reconciliation {
            plan,
            local: snapshot.local,
            remote,
        })
    }

    /// Resolve every conflict of `reconciliation` with one strategy
    ///
    /// The whole batch is validated before anything is written. Local changes
    /// produced by the resolution are queued; call [`Self::push_queued`] to
    /// send them.
    pub async fn resolve(
        &self,
        workspace: &SharedWorkspace,
        reconciliation: &Reconciliation,
        strategy: Strategy,
    ) -> Result<ResolveReport, SyncError> {
        let (commit, resolved) = conflict::resolve(
            &reconciliation.plan,
            &reconciliation.local,
            &reconciliation.remote,
            strategy,
        )?;

        let mut ws = workspace.lock().await;
        if ws.sync_snapshot()?.local != reconciliation.local {
            return Err(SyncError::StaleReconciliation);
        }
        let applied = ws.apply_commit(&commit)?;

        info!(
            %strategy,
            conflicts = resolved.len(),
            remapped = commit.remapped.len(),
            "Resolved conflicts"
        );
        Ok(ResolveReport {
            strategy,
            resolved,
            applied,
        })
    }

    /// Drain the pending-operation log to the remote, oldest first
    ///
    /// A transient failure holds back the rest of that entity's ops for this
    /// pass; other entities continue. A permanent failure drops the op. Ops
    /// enqueued while the pass runs are picked up before it ends, and a call
    /// made while a pass is running returns immediately with `coalesced` set.
    pub async fn push_queued(&self, workspace: &SharedWorkspace) -> Result<PushReport, SyncError> {
        if self
            .pushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Push already running; coalescing");
            return Ok(PushReport {
                coalesced: true,
                ..PushReport::default()
            });
        }
        let _in_flight = InFlight(&self.pushing);

        let mut report = PushReport::default();
        let mut blocked: BTreeSet<EntityKey> = BTreeSet::new();
        let mut last_seq = 0;

        loop {
            let batch: Vec<_> = workspace
                .lock()
                .await
                .queued_ops()?
                .into_iter()
                .filter(|op| op.seq > last_seq)
                .collect();
            if batch.is_empty() {
                break;
            }

            for op in batch {
                last_seq = last_seq.max(op.seq);
                if blocked.contains(&op.key()) {
                    continue;
                }

                let request = PushRequest {
                    collection: op.collection,
                    id: op.entity_id,
                    op: op.op,
                    payload: op.payload.clone(),
                };

                match self.remote.push_one(&self.context, &request).await {
                    Ok(()) => {
                        workspace.lock().await.confirm_pushed(&op)?;
                        report.pushed += 1;
                    }
                    Err(e) if e.is_transient() => {
                        debug!(
                            seq = op.seq,
                            collection = %op.collection,
                            id = %op.entity_id,
                            error = %e,
                            "Push failed; will retry"
                        );
                        blocked.insert(op.key());
                        report.transient_failures += 1;
                        report.blocked.push(op.key());
                    }
                    Err(e) => {
                        warn!(
                            seq = op.seq,
                            collection = %op.collection,
                            id = %op.entity_id,
                            op = %op.op,
                            error = %e,
                            "Dropping operation rejected by remote"
                        );
                        workspace.lock().await.drop_op(&op)?;
                        report.dropped.push(DroppedOp {
                            seq: op.seq,
                            collection: op.collection,
                            id: op.entity_id,
                            op: op.op,
                            reason: e.message,
                        });
                    }
                }
            }
        }

        if report.is_clean() {
            workspace.lock().await.record_sync(now_ms())?;
        }
        if report.pushed > 0 || !report.dropped.is_empty() || report.transient_failures > 0 {
            info!(
                pushed = report.pushed,
                dropped = report.dropped.len(),
                transient_failures = report.transient_failures,
                "Push pass finished"
            );
        }
        Ok(report)
    }

    /// Pull and apply one-sided remote changes, reporting conflicts
    ///
    /// Remote changes that would leave a local reference dangling are
    /// reported as conflicts instead of being applied.
    pub async fn refresh(&self, workspace: &SharedWorkspace) -> Result<RefreshReport, SyncError> {
        let remote = self.pull_all().await?;

        let mut ws = workspace.lock().await;
        let snapshot = ws.sync_snapshot()?;
        let mut plan = conflict::plan(&snapshot.local, &remote, &snapshot.base, &snapshot.pending);
        let held = plan.hold_dangling(&snapshot.local);
        if held > 0 {
            debug!(held, "Held remote changes that would break local references");
        }
        let applied = ws.apply_commit(&plan.one_sided())?;

        if plan.has_conflicts() {
            info!(conflicts = plan.conflicts.len(), "Refresh found conflicts; resolve them explicitly");
        }
        Ok(RefreshReport {
            applied,
            conflicts: plan.conflicts,
        })
    }

    /// One timer tick: push the queue, then refresh from the remote
    pub async fn sync_once(&self, workspace: &SharedWorkspace) -> Result<SyncRound, SyncError> {
        let push = self.push_queued(workspace).await?;
        let refresh = self.refresh(workspace).await?;
        Ok(SyncRound { push, refresh })
    }

    /// Overwrite the local store with the remote set
    ///
    /// With [`PullMode::Refuse`] this fails while anything is queued. With
    /// [`PullMode::PreservePending`] entities with queued ops are left alone,
    /// along with any local entity they reference that the remote lacks. The
    /// result is checked for dangling references before anything is written.
    pub async fn full_pull(
        &self,
        workspace: &SharedWorkspace,
        mode: PullMode,
    ) -> Result<ApplyReport, SyncError> {
        if mode == PullMode::Refuse {
            let count = workspace.lock().await.queued_ops()?.len();
            if count > 0 {
                return Err(SyncError::PendingWork { count });
            }
        }

        let remote = self.pull_all().await?;

        let mut ws = workspace.lock().await;
        let snapshot = ws.sync_snapshot()?;
        if mode == PullMode::Refuse && !snapshot.pending.is_empty() {
            return Err(SyncError::PendingWork {
                count: snapshot.pending.len(),
            });
        }

        let remote_keys: BTreeSet<EntityKey> = remote.iter().map(|e| e.key()).collect();
        let kept = preserved(&snapshot.local, &snapshot.pending, &remote_keys);
        let keep = |key: &EntityKey| kept.contains(key);
        let commit = CommitPlan {
            remove: snapshot
                .local
                .iter()
                .map(|e| e.key())
                .filter(|k| !remote_keys.contains(k) && !keep(k))
                .collect(),
            forget: snapshot
                .base
                .keys()
                .filter(|k| !remote_keys.contains(k) && !keep(k))
                .copied()
                .collect(),
            adopt: remote.into_iter().filter(|e| !keep(&e.key())).collect(),
            ..CommitPlan::default()
        };
        conflict::validate_merged(&snapshot.local, &commit)?;

        let applied = ws.apply_commit(&commit)?;
        info!(
            adopted = applied.adopted,
            removed = applied.removed,
            preserved = kept.len(),
            "Full pull applied"
        );
        Ok(applied)
    }
}

/// Keys a preserving pull leaves alone: pending entities plus the local
/// entities they reference, transitively, that the remote does not hold
fn preserved(
    local: &[Entity],
    pending: &BTreeSet<EntityKey>,
    remote_keys: &BTreeSet<EntityKey>,
) -> BTreeSet<EntityKey> {
    let by_key: BTreeMap<EntityKey, &Entity> = local.iter().map(|e| (e.key(), e)).collect();
    let mut kept = pending.clone();
    let mut frontier: Vec<EntityKey> = kept.iter().copied().collect();

    while let Some(key) = frontier.pop() {
        let Some(entity) = by_key.get(&key) else {
            continue;
        };
        for reference in entity.references() {
            let target = (reference.target, reference.id);
            if !remote_keys.contains(&target) && kept.insert(target) {
                frontier.push(target);
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use crate::sync::remote::MemoryRemote;

    fn engine(remote: MemoryRemote) -> SyncEngine<MemoryRemote> {
        SyncEngine::new(remote, SyncContext::default())
    }

    fn workspace() -> SharedWorkspace {
        Mutex::new(Workspace::open_in_memory().unwrap())
    }

    fn rename(entity: &Entity, name: &str) -> Entity {
        let mut renamed = entity.clone();
        if let Record::Person(p) = &mut renamed.record {
            p.name = name.to_string();
        }
        renamed
    }

    #[tokio::test]
    async fn test_offline_mutations_reach_remote() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        sync.remote().set_offline(true);

        let (alder, aldric) = {
            let mut w = ws.lock().await;
            let alder = w.create(Entity::group(0, "Alder").record).unwrap();
            let aldric = w
                .create(Entity::person(0, "Aldric", Some(alder.id.0)).record)
                .unwrap();
            let aldric = w.update(rename(&aldric, "Aldric Storm")).unwrap();
            assert!(w.has_pending().unwrap());
            (alder, aldric)
        };

        let report = sync.push_queued(&ws).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert!(report.transient_failures > 0);
        assert!(ws.lock().await.has_pending().unwrap());

        sync.remote().set_offline(false);
        let report = sync.push_queued(&ws).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.pushed, 3);
        assert!(!ws.lock().await.has_pending().unwrap());

        // Every touched entity matches the remote
        assert_eq!(sync.remote().get(Collection::Group, alder.id), Some(alder));
        assert_eq!(sync.remote().get(Collection::Person, aldric.id), Some(aldric));
        assert!(ws.lock().await.status().unwrap().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_blocks_only_that_entity() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();

        let (alder, birch) = {
            let mut w = ws.lock().await;
            let alder = w.create(Entity::group(0, "Alder").record).unwrap();
            let birch = w.create(Entity::group(0, "Birch").record).unwrap();
            (alder, birch)
        };
        sync.remote().fail_pushes_for(alder.key(), true);

        let report = sync.push_queued(&ws).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.blocked, vec![alder.key()]);
        assert!(sync.remote().get(Collection::Group, birch.id).is_some());

        let pending = ws.lock().await.queued_ops().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key(), alder.key());
    }

    #[tokio::test]
    async fn test_entity_ops_stay_ordered_after_transient_failure() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();

        let aldric = {
            let mut w = ws.lock().await;
            let aldric = w.create(Entity::person(0, "Aldric", None).record).unwrap();
            w.update(rename(&aldric, "Aldric Storm")).unwrap()
        };
        sync.remote().fail_pushes_for(aldric.key(), true);

        let report = sync.push_queued(&ws).await.unwrap();
        // The update is held back behind the failed add
        assert_eq!(report.transient_failures, 1);
        assert_eq!(ws.lock().await.queued_ops().unwrap().len(), 2);

        sync.remote().fail_pushes_for(aldric.key(), false);
        sync.push_queued(&ws).await.unwrap();
        let pushes = sync.remote().pushes();
        assert_eq!(pushes[0].op, OpKind::Add);
        assert_eq!(pushes[1].op, OpKind::Update);
        assert_eq!(sync.remote().get(Collection::Person, aldric.id), Some(aldric));
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_op() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        let alder = ws
            .lock()
            .await
            .create(Entity::group(0, "Alder").record)
            .unwrap();
        sync.push_queued(&ws).await.unwrap();

        // Remote loses the entity, then the local delete cannot be confirmed
        sync.remote().remove(&alder.key());
        ws.lock().await.delete(Collection::Group, alder.id).unwrap();

        let report = sync.push_queued(&ws).await.unwrap();
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].op, OpKind::Delete);
        assert!(!ws.lock().await.has_pending().unwrap());
    }

    #[tokio::test]
    async fn test_initial_reconcile_pushes_into_empty_remote() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        {
            let mut w = ws.lock().await;
            w.create(Entity::group(0, "Alder").record).unwrap();
            w.create(Entity::person(0, "Aldric", Some(1)).record).unwrap();
        }

        match sync.initial_reconcile(&ws).await.unwrap() {
            ReconcileOutcome::Pushed { push, .. } => assert_eq!(push.pushed, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(sync.remote().len(), 2);
    }

    #[tokio::test]
    async fn test_initial_reconcile_pulls_into_empty_local() {
        let sync = engine(MemoryRemote::with_entities([
            Entity::group(1, "Alder"),
            Entity::person(1, "Aldric", Some(1)),
        ]));
        let ws = workspace();

        match sync.initial_reconcile(&ws).await.unwrap() {
            ReconcileOutcome::Pulled { adopted } => assert_eq!(adopted, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        let w = ws.lock().await;
        assert_eq!(w.list(Collection::Person).unwrap().len(), 1);
        assert!(!w.has_pending().unwrap());
    }

    #[tokio::test]
    async fn test_scenario_overwrite_keeps_local_name() {
        let sync = engine(MemoryRemote::with_entities([Entity::person(3, "Aldric Storm", None)]));
        let ws = workspace();
        {
            let mut w = ws.lock().await;
            w.insert(Entity::person(3, "Aldric", None)).unwrap();
        }

        let reconciliation = match sync.initial_reconcile(&ws).await.unwrap() {
            ReconcileOutcome::Diverged { reconciliation } => reconciliation,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(reconciliation.conflicts().len(), 1);
        assert_eq!(reconciliation.conflicts()[0].id, EntityId(3));

        sync.resolve(&ws, &reconciliation, Strategy::Overwrite)
            .await
            .unwrap();
        sync.push_queued(&ws).await.unwrap();

        assert_eq!(
            sync.remote()
                .get(Collection::Person, EntityId(3))
                .unwrap()
                .label(),
            "Aldric"
        );
    }

    #[tokio::test]
    async fn test_skip_adopts_remote_copy() {
        let sync = engine(MemoryRemote::with_entities([Entity::person(3, "Aldric Storm", None)]));
        let ws = workspace();
        ws.lock()
            .await
            .insert(Entity::person(3, "Aldric", None))
            .unwrap();

        let reconciliation = sync.detect_conflicts(&ws).await.unwrap();
        sync.resolve(&ws, &reconciliation, Strategy::Skip).await.unwrap();

        let w = ws.lock().await;
        assert_eq!(
            w.get(Collection::Person, EntityId(3)).unwrap().unwrap().label(),
            "Aldric Storm"
        );
        assert!(!w.has_pending().unwrap());
    }

    #[tokio::test]
    async fn test_keep_both_pushes_moved_copy() {
        let sync = engine(MemoryRemote::with_entities([
            Entity::person(5, "Aldric Storm", None),
            Entity::person(6, "Bera", None),
        ]));
        let ws = workspace();
        {
            let mut w = ws.lock().await;
            w.insert(Entity::person(5, "Aldric", None)).unwrap();
            w.insert(Entity::person(6, "Bera", None)).unwrap();
            w.insert(Entity::relationship(1, 5, 6, "sibling")).unwrap();
        }

        let reconciliation = sync.detect_conflicts(&ws).await.unwrap();
        let report = sync
            .resolve(&ws, &reconciliation, Strategy::KeepBoth)
            .await
            .unwrap();
        assert_eq!(report.applied.remapped, 1);
        sync.push_queued(&ws).await.unwrap();

        let w = ws.lock().await;
        let moved = w.get(Collection::Person, EntityId(7)).unwrap().unwrap();
        assert_eq!(moved.label(), "Aldric");
        let rel = w
            .get(Collection::Relationship, EntityId(1))
            .unwrap()
            .unwrap();
        assert!(rel.refers_to(Collection::Person, EntityId(7)));
        assert_eq!(
            sync.remote().get(Collection::Person, EntityId(5)).unwrap().label(),
            "Aldric Storm"
        );
        assert_eq!(sync.remote().get(Collection::Relationship, EntityId(1)), Some(rel));
    }

    #[tokio::test]
    async fn test_resolve_rejects_stale_reconciliation() {
        let sync = engine(MemoryRemote::with_entities([Entity::person(3, "Aldric Storm", None)]));
        let ws = workspace();
        ws.lock()
            .await
            .insert(Entity::person(3, "Aldric", None))
            .unwrap();

        let reconciliation = sync.detect_conflicts(&ws).await.unwrap();
        ws.lock()
            .await
            .create(Entity::person(0, "Bera", None).record)
            .unwrap();

        let err = sync
            .resolve(&ws, &reconciliation, Strategy::Skip)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::StaleReconciliation));
    }

    #[tokio::test]
    async fn test_full_pull_guard() {
        let sync = engine(MemoryRemote::with_entities([Entity::group(1, "Alder")]));
        let ws = workspace();
        let local = ws
            .lock()
            .await
            .create(Entity::person(0, "Aldric", None).record)
            .unwrap();

        let err = sync.full_pull(&ws, PullMode::Refuse).await.unwrap_err();
        assert!(matches!(err, SyncError::PendingWork { count: 1 }));

        sync.full_pull(&ws, PullMode::PreservePending).await.unwrap();
        let w = ws.lock().await;
        // Pending local entity survives, remote entity adopted
        assert_eq!(w.get(Collection::Person, local.id).unwrap(), Some(local));
        assert!(w.get(Collection::Group, EntityId(1)).unwrap().is_some());
        assert!(w.has_pending().unwrap());
    }

    #[tokio::test]
    async fn test_refresh_applies_remote_only_changes() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        let aldric = ws
            .lock()
            .await
            .create(Entity::person(0, "Aldric", None).record)
            .unwrap();
        sync.push_queued(&ws).await.unwrap();

        sync.remote().seed([rename(&aldric, "Aldric Storm"), Entity::group(1, "Alder")]);
        let report = sync.refresh(&ws).await.unwrap();

        assert!(report.conflicts.is_empty());
        assert_eq!(report.applied.adopted, 2);
        let w = ws.lock().await;
        assert_eq!(
            w.get(Collection::Person, aldric.id).unwrap().unwrap().label(),
            "Aldric Storm"
        );
        assert!(!w.has_pending().unwrap());
    }

    #[tokio::test]
    async fn test_refresh_holds_delete_of_referenced_entity() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        let alder = ws
            .lock()
            .await
            .create(Entity::group(0, "Alder").record)
            .unwrap();
        sync.push_queued(&ws).await.unwrap();

        // Created before the remote delete is seen, still unpushed
        let aldric = ws
            .lock()
            .await
            .create(Entity::person(0, "Aldric", Some(alder.id.0)).record)
            .unwrap();
        sync.remote().remove(&alder.key());

        let report = sync.refresh(&ws).await.unwrap();
        assert_eq!(report.applied.removed, 0);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].key(), alder.key());
        assert!(report.conflicts[0].remote.is_none());

        let w = ws.lock().await;
        assert_eq!(w.get(Collection::Group, alder.id).unwrap(), Some(alder.clone()));
        let aldric = w.get(Collection::Person, aldric.id).unwrap().unwrap();
        assert!(aldric.refers_to(Collection::Group, alder.id));
    }

    #[tokio::test]
    async fn test_preserving_pull_keeps_referenced_entities() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        let alder = ws
            .lock()
            .await
            .create(Entity::group(0, "Alder").record)
            .unwrap();
        sync.push_queued(&ws).await.unwrap();

        let aldric = ws
            .lock()
            .await
            .create(Entity::person(0, "Aldric", Some(alder.id.0)).record)
            .unwrap();
        sync.remote().remove(&alder.key());
        sync.remote().seed([Entity::group(2, "Birch")]);

        sync.full_pull(&ws, PullMode::PreservePending).await.unwrap();

        let w = ws.lock().await;
        assert_eq!(w.get(Collection::Group, alder.id).unwrap(), Some(alder));
        assert_eq!(w.get(Collection::Person, aldric.id).unwrap(), Some(aldric));
        assert!(w.get(Collection::Group, EntityId(2)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejected_update_is_not_requeued() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        let aldric = ws
            .lock()
            .await
            .create(Entity::person(0, "Aldric", None).record)
            .unwrap();
        sync.push_queued(&ws).await.unwrap();

        sync.remote().reject_pushes_for(aldric.key(), true);
        ws.lock()
            .await
            .update(rename(&aldric, "Aldric Storm"))
            .unwrap();

        let first = sync.sync_once(&ws).await.unwrap();
        assert_eq!(first.push.dropped.len(), 1);
        assert_eq!(first.refresh.applied.queued, 0);

        let second = sync.sync_once(&ws).await.unwrap();
        assert!(second.push.dropped.is_empty());
        assert_eq!(second.push.pushed, 0);
        assert_eq!(second.refresh.applied.queued, 0);
        assert!(second.refresh.conflicts.is_empty());

        let w = ws.lock().await;
        assert!(!w.has_pending().unwrap());
        // The remote copy wins
        assert_eq!(w.get(Collection::Person, aldric.id).unwrap(), Some(aldric));
        assert_eq!(sync.remote().rejections(), 1);
    }

    #[tokio::test]
    async fn test_failed_resolution_changes_nothing() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        let alder = {
            let mut w = ws.lock().await;
            let alder = w.create(Entity::group(0, "Alder").record).unwrap();
            w.create(Entity::person(0, "Aldric", Some(alder.id.0)).record)
                .unwrap();
            alder
        };
        sync.push_queued(&ws).await.unwrap();

        // Edited locally, deleted remotely, still referenced by Aldric
        let mut reach = alder.clone();
        if let Record::Group(g) = &mut reach.record {
            g.name = "Alder Reach".to_string();
        }
        ws.lock().await.update(reach).unwrap();
        sync.remote().remove(&alder.key());

        let (local_before, queued_before) = {
            let w = ws.lock().await;
            (w.list_all().unwrap(), w.queued_ops().unwrap())
        };
        let remote_before = sync.remote().entities();
        let pushes_before = sync.remote().pushes().len();

        let reconciliation = sync.detect_conflicts(&ws).await.unwrap();
        assert_eq!(reconciliation.conflicts().len(), 1);
        let err = sync
            .resolve(&ws, &reconciliation, Strategy::Skip)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Resolve(ResolveError::DanglingReference {
                target: Collection::Group,
                ..
            })
        ));

        let w = ws.lock().await;
        assert_eq!(w.list_all().unwrap(), local_before);
        assert_eq!(w.queued_ops().unwrap(), queued_before);
        assert_eq!(sync.remote().entities(), remote_before);
        assert_eq!(sync.remote().pushes().len(), pushes_before);
    }

    #[tokio::test]
    async fn test_overlapping_push_coalesces() {
        let sync = engine(MemoryRemote::new());
        let ws = workspace();
        sync.pushing.store(true, Ordering::SeqCst);

        let report = sync.push_queued(&ws).await.unwrap();
        assert!(report.coalesced);
        assert!(sync.is_pushing());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Remote(RemoteError::transient("down")).is_transient());
        assert!(!SyncError::PendingWork { count: 1 }.is_transient());
    }
}
