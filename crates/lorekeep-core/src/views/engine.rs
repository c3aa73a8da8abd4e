//! Debounced regeneration engine
//!
//! Consumes committed mutations from the change notifier, maps each to the
//! artifact scopes it affects, and rebuilds exactly those scopes once the
//! debounce timer expires (or immediately on `flush` / `regenerate_now`).
//!
//! The engine is owned by the workspace and every entry point takes
//! `&mut self`, so a pass can never start while another is running on the
//! same instance.

use std::collections::BTreeSet;
use std::sync::mpsc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::debounce::Debouncer;
use super::discovery::{discover_groups, groups_touched, Discovery, Thresholds};
use super::generator::{self, Bundle, ViewError};
use super::registry::{ArtifactRegistry, Trigger};
use super::scope::ArtifactScope;
use crate::config::ViewSettings;
use crate::models::{Collection, Entity, EntityId, Record};
use crate::notify::{ChangeEvent, EventBus, CONTEXTS_UPDATED, GENERATION_COMPLETE};
use crate::now_ms;
use crate::storage::{EntityStore, SqliteStore, StoreResult};

#[derive(Debug, Clone, Serialize)]
pub struct ScopeFailure {
    pub scope: ArtifactScope,
    pub error: String,
}

/// Outcome of one regeneration pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub trigger: Trigger,
    pub regenerated: Vec<ArtifactScope>,
    pub failed: Vec<ScopeFailure>,
    /// Groups that crossed a threshold on this pass
    pub promoted: Vec<EntityId>,
    /// Promoted groups whose group entity no longer exists
    pub retired: Vec<EntityId>,
    pub duration_ms: u64,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ViewEngine {
    settings: ViewSettings,
    changes: mpsc::Receiver<ChangeEvent>,
    debouncer: Debouncer,
    events: EventBus,
    #[cfg(test)]
    fail_scopes: BTreeSet<ArtifactScope>,
}

impl ViewEngine {
    pub fn new(settings: ViewSettings, changes: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            debouncer: Debouncer::new(settings.debounce()),
            settings,
            changes,
            events: EventBus::new(),
            #[cfg(test)]
            fail_scopes: BTreeSet::new(),
        }
    }

    pub fn settings(&self) -> &ViewSettings {
        &self.settings
    }

    pub fn events(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// Scopes waiting for the debounce timer
    pub fn pending_scopes(&self) -> &BTreeSet<ArtifactScope> {
        self.debouncer.pending()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    /// Drain queued change events into the debouncer
    ///
    /// Marks every affected artifact stale and restarts the timer. Returns
    /// the number of events consumed.
    pub fn ingest(&mut self, store: &mut SqliteStore, now: Instant) -> StoreResult<usize> {
        let mut events = Vec::new();
        while let Ok(event) = self.changes.try_recv() {
            events.push(event);
        }
        if events.is_empty() {
            return Ok(0);
        }

        let promoted = ArtifactRegistry::new(store.connection()).promoted_groups()?;
        let mut scopes = BTreeSet::from([ArtifactScope::Global]);
        for event in &events {
            for group_id in affected_groups(store, event) {
                scopes.insert(if promoted.contains(&group_id) {
                    ArtifactScope::Group(group_id)
                } else {
                    ArtifactScope::Minor
                });
            }
        }

        store.write(|tx| {
            let registry = ArtifactRegistry::new(tx.conn());
            for scope in &scopes {
                registry.mark_stale(*scope, tx.now())?;
            }
            Ok(())
        })?;

        debug!(
            events = events.len(),
            scopes = ?scopes,
            "Scheduled debounced regeneration"
        );
        self.debouncer.record(scopes, now);
        Ok(events.len())
    }

    /// Run a pass if the quiet period has elapsed
    pub fn run_due(
        &mut self,
        store: &mut SqliteStore,
        now: Instant,
    ) -> StoreResult<Option<PassReport>> {
        self.ingest(store, now)?;
        if !self.debouncer.is_due(now) {
            return Ok(None);
        }
        let scopes = self.debouncer.take();
        self.run_pass(store, scopes, Trigger::Debounced).map(Some)
    }

    /// Process every pending scope now, bypassing the delay
    pub fn flush(&mut self, store: &mut SqliteStore) -> StoreResult<Option<PassReport>> {
        self.ingest(store, Instant::now())?;
        if !self.debouncer.is_pending() {
            return Ok(None);
        }
        let scopes = self.debouncer.take();
        self.run_pass(store, scopes, Trigger::Flush).map(Some)
    }

    /// Regenerate the given scopes (or every known scope) immediately
    ///
    /// Pending debounced scopes are folded into the same pass.
    pub fn regenerate_now(
        &mut self,
        store: &mut SqliteStore,
        scopes: Option<BTreeSet<ArtifactScope>>,
    ) -> StoreResult<PassReport> {
        self.ingest(store, Instant::now())?;
        let mut all = self.debouncer.take();
        match scopes {
            Some(requested) => all.extend(requested),
            None => {
                all.insert(ArtifactScope::Minor);
                let promoted = ArtifactRegistry::new(store.connection()).promoted_groups()?;
                all.extend(promoted.into_iter().map(ArtifactScope::Group));
            }
        }
        self.run_pass(store, all, Trigger::Manual)
    }

    fn run_pass(
        &mut self,
        store: &mut SqliteStore,
        mut scopes: BTreeSet<ArtifactScope>,
        trigger: Trigger,
    ) -> StoreResult<PassReport> {
        let pass_started = Instant::now();
        let entities = store.list_all()?;
        let discovery = discover_groups(&entities, Thresholds::from(&self.settings));

        let (promoted_now, retired) = store.write(|tx| {
            let registry = ArtifactRegistry::new(tx.conn());
            let mut promoted_now = Vec::new();
            for group_id in discovery.qualifying() {
                if registry.promote(group_id, tx.now())? {
                    promoted_now.push(group_id);
                }
            }
            let mut retired = Vec::new();
            for group_id in registry.promoted_groups()? {
                if !discovery.groups.contains_key(&group_id) {
                    registry.retire(group_id)?;
                    retired.push(group_id);
                }
            }
            Ok((promoted_now, retired))
        })?;
        let promoted = ArtifactRegistry::new(store.connection()).promoted_groups()?;

        for group_id in &promoted_now {
            info!(group = %group_id, "Group promoted to a dedicated artifact");
        }
        for group_id in &retired {
            info!(group = %group_id, "Retired artifact of deleted group");
        }

        scopes.insert(ArtifactScope::Global);
        if !promoted_now.is_empty() || !retired.is_empty() {
            scopes.insert(ArtifactScope::Minor);
        }
        scopes.extend(promoted_now.iter().copied().map(ArtifactScope::Group));
        scopes.retain(|scope| match scope {
            ArtifactScope::Group(id) => promoted.contains(id),
            _ => true,
        });

        let mut report = PassReport {
            trigger,
            regenerated: Vec::new(),
            failed: Vec::new(),
            promoted: promoted_now,
            retired,
            duration_ms: 0,
        };

        for scope in scopes {
            let started_at = now_ms();
            let scope_started = Instant::now();
            let result = self
                .build_scope(scope, &entities, &discovery, &promoted)
                .and_then(|bundle| {
                    let duration_ms = elapsed_ms(scope_started);
                    store
                        .write(|tx| {
                            let registry = ArtifactRegistry::new(tx.conn());
                            registry.replace(scope, &bundle, tx.now())?;
                            registry.append_audit(
                                scope,
                                trigger,
                                started_at,
                                duration_ms,
                                bundle.item_count(),
                                None,
                            )
                        })
                        .map_err(ViewError::from)
                });

            match result {
                Ok(_) => report.regenerated.push(scope),
                Err(e) => {
                    let error = e.to_string();
                    warn!(scope = %scope, error = %error, "Regeneration failed");
                    let duration_ms = elapsed_ms(scope_started);
                    let recorded = store.write(|tx| {
                        let registry = ArtifactRegistry::new(tx.conn());
                        registry.record_failure(scope, &error, tx.now())?;
                        registry.append_audit(scope, trigger, started_at, duration_ms, 0, Some(&error))
                    });
                    if let Err(e) = recorded {
                        warn!(scope = %scope, error = %e, "Failed to record regeneration failure");
                    }
                    report.failed.push(ScopeFailure { scope, error });
                }
            }
        }

        report.duration_ms = elapsed_ms(pass_started);
        info!(
            trigger = %trigger,
            regenerated = report.regenerated.len(),
            failed = report.failed.len(),
            duration_ms = report.duration_ms,
            "Regeneration pass complete"
        );
        self.announce(&report);
        Ok(report)
    }

    fn build_scope(
        &self,
        scope: ArtifactScope,
        entities: &[Entity],
        discovery: &Discovery,
        promoted: &BTreeSet<EntityId>,
    ) -> Result<Bundle, ViewError> {
        #[cfg(test)]
        if self.fail_scopes.contains(&scope) {
            return Err(ViewError::MissingGroup(EntityId(-1)));
        }
        generator::build(scope, entities, discovery, promoted)
    }

    fn announce(&self, report: &PassReport) {
        let keys = |scopes: &[ArtifactScope]| scopes.iter().map(|s| s.key()).collect::<Vec<_>>();
        self.events.emit(
            GENERATION_COMPLETE,
            json!({
                "trigger": report.trigger,
                "regenerated": keys(&report.regenerated),
                "failed": report.failed,
                "duration_ms": report.duration_ms,
            }),
        );
        if !report.regenerated.is_empty() || !report.retired.is_empty() {
            self.events.emit(
                CONTEXTS_UPDATED,
                json!({
                    "scopes": keys(&report.regenerated),
                    "promoted": report.promoted,
                    "retired": report.retired,
                }),
            );
        }
    }
}

/// Groups touched by an event, before and after the mutation
fn affected_groups(store: &SqliteStore, event: &ChangeEvent) -> BTreeSet<EntityId> {
    let person_group = |id: EntityId| match store.get(Collection::Person, id) {
        Ok(Some(Entity {
            record: Record::Person(p),
            ..
        })) => p.group_id,
        _ => None,
    };
    let mut groups = groups_touched(&event.entity, person_group);
    if let Some(previous) = &event.previous {
        groups.extend(groups_touched(previous, person_group));
    }
    groups
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis().min(u64::MAX as u128) as u64
}
