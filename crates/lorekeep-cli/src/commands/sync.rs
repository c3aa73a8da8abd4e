//! Sync command handlers

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use lorekeep_core::sync::{
    Conflict, HttpRemote, PullMode, PushReport, ReconcileOutcome, RefreshReport, SharedWorkspace,
    Strategy, SyncEngine,
};
use lorekeep_core::views::PassReport;
use lorekeep_core::{Background, BackgroundSettings, Config, RuntimeEvent};

use crate::output::Output;

/// Build the engine for the configured remote
pub fn remote_engine(config: &Config) -> Result<SyncEngine<HttpRemote>> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             lorekeep config set sync_enabled true\n  \
             lorekeep config set remote_url https://your-server"
        );
    }

    let Some(ref url) = config.remote_url else {
        bail!(
            "Remote URL not configured. Set it with:\n  \
             lorekeep config set remote_url https://your-server"
        );
    };

    let remote = HttpRemote::new(
        url.clone(),
        Duration::from_secs(config.sync.request_timeout_secs),
    )?;
    Ok(SyncEngine::new(remote, config.context.clone()))
}

/// Push the queue, then pull remote-only changes
pub async fn sync(workspace: &SharedWorkspace, config: &Config, output: &Output) -> Result<()> {
    let engine = remote_engine(config)?;
    output.message("Syncing with remote...");

    let round = engine.sync_once(workspace).await?;
    if output.is_json() {
        return output.print_json(&round);
    }

    report_push(&round.push, output);
    report_refresh(&round.refresh, output);
    Ok(())
}

/// First-run reconcile between the local store and the remote
pub async fn reconcile(
    workspace: &SharedWorkspace,
    config: &Config,
    strategy: Option<Strategy>,
    output: &Output,
) -> Result<()> {
    let engine = remote_engine(config)?;
    let outcome = engine.initial_reconcile(workspace).await?;

    let reconciliation = match outcome {
        ReconcileOutcome::Diverged { reconciliation } => reconciliation,
        other => {
            if output.is_json() {
                return output.print_json(&other);
            }
            match other {
                ReconcileOutcome::InSync => output.success("Already in sync"),
                ReconcileOutcome::Pushed { queued, push } => {
                    output.success(&format!("Remote was empty; queued {} entities", queued));
                    report_push(&push, output);
                }
                ReconcileOutcome::Pulled { adopted } => {
                    output.success(&format!("Local store was empty; adopted {} entities", adopted));
                }
                ReconcileOutcome::Merged { applied } => {
                    output.success(&format!(
                        "Merged one-sided changes: {} written, {} removed, {} queued",
                        applied.written, applied.removed, applied.queued
                    ));
                }
                ReconcileOutcome::Diverged { .. } => {}
            }
            return Ok(());
        }
    };

    let Some(strategy) = strategy else {
        print_conflicts(reconciliation.conflicts(), output)?;
        bail!(
            "{} conflict(s) need a decision. Re-run with --strategy skip|overwrite|keep-both",
            reconciliation.conflicts().len()
        );
    };

    let resolved = engine.resolve(workspace, &reconciliation, strategy).await?;
    let push = engine.push_queued(workspace).await?;
    if output.is_json() {
        return output.print_json(&serde_json::json!({
            "resolved": resolved,
            "push": push,
        }));
    }

    output.success(&format!(
        "Resolved {} conflict(s) with '{}'",
        resolved.resolved.len(),
        strategy
    ));
    report_push(&push, output);
    Ok(())
}

/// Show current conflicts without changing anything
pub async fn conflicts(workspace: &SharedWorkspace, config: &Config, output: &Output) -> Result<()> {
    let engine = remote_engine(config)?;
    let reconciliation = engine.detect_conflicts(workspace).await?;
    print_conflicts(reconciliation.conflicts(), output)
}

/// Detect conflicts and settle all of them with one strategy
pub async fn resolve(
    workspace: &SharedWorkspace,
    config: &Config,
    strategy: Strategy,
    output: &Output,
) -> Result<()> {
    let engine = remote_engine(config)?;
    let reconciliation = engine.detect_conflicts(workspace).await?;
    if reconciliation.conflicts().is_empty() {
        output.success("No conflicts");
        return Ok(());
    }

    let report = engine.resolve(workspace, &reconciliation, strategy).await?;
    let push = engine.push_queued(workspace).await?;
    if output.is_json() {
        return output.print_json(&serde_json::json!({
            "resolved": report,
            "push": push,
        }));
    }

    output.success(&format!(
        "Resolved {} conflict(s) with '{}'",
        report.resolved.len(),
        strategy
    ));
    report_push(&push, output);
    Ok(())
}

/// Replace local data with the remote set
pub async fn pull(
    workspace: &SharedWorkspace,
    config: &Config,
    preserve_pending: bool,
    output: &Output,
) -> Result<()> {
    let engine = remote_engine(config)?;
    let mode = if preserve_pending {
        PullMode::PreservePending
    } else {
        PullMode::Refuse
    };

    let applied = engine.full_pull(workspace, mode).await?;
    if output.is_json() {
        return output.print_json(&applied);
    }
    output.success(&format!(
        "Pulled remote data: {} adopted, {} removed",
        applied.adopted, applied.removed
    ));
    Ok(())
}

/// Run regeneration, sync and sweeping in the foreground until Ctrl-C
pub async fn watch(workspace: Arc<SharedWorkspace>, config: &Config, output: &Output) -> Result<()> {
    let mut background = Background::start(
        Arc::clone(&workspace),
        BackgroundSettings::from_config(config),
    );

    match remote_engine(config) {
        Ok(engine) => {
            background.spawn_sync(Arc::new(engine));
            background.sync_now();
        }
        Err(e) => output.warn(&format!("Remote sync off: {}", e)),
    }

    output.message("Watching. Press Ctrl-C to stop.");
    loop {
        tokio::select! {
            event = background.events.recv() => match event {
                Some(event) => print_event(&event, output)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    output.message("Stopping...");
    background.stop().await;
    Ok(())
}

fn print_event(event: &RuntimeEvent, output: &Output) -> Result<()> {
    if output.is_json() {
        return output.print_json(event);
    }
    match event {
        RuntimeEvent::Regenerated { report } => report_pass(report, output),
        RuntimeEvent::Synced { round } => {
            if round.push.pushed > 0 || !round.push.dropped.is_empty() {
                report_push(&round.push, output);
            }
            if round.refresh.applied.written > 0 || !round.refresh.conflicts.is_empty() {
                report_refresh(&round.refresh, output);
            }
        }
        RuntimeEvent::SyncFailed {
            error,
            retry_in_secs,
        } => output.warn(&format!("Sync failed: {} (retry in {}s)", error, retry_in_secs)),
        RuntimeEvent::Swept { report } => output.message(&format!(
            "Swept {} confirmed op(s), gave up on {} stale op(s)",
            report.purged,
            report.reclaimed.len()
        )),
    }
    Ok(())
}

pub fn report_pass(report: &PassReport, output: &Output) {
    if !report.regenerated.is_empty() {
        let names: Vec<String> = report.regenerated.iter().map(|s| s.to_string()).collect();
        output.message(&format!(
            "Regenerated {} in {}ms",
            names.join(", "),
            report.duration_ms
        ));
    }
    for group in &report.promoted {
        output.message(&format!("  group {} now has its own bundle", group));
    }
    for failure in &report.failed {
        output.warn(&format!("Failed to regenerate {}: {}", failure.scope, failure.error));
    }
}

fn report_push(push: &PushReport, output: &Output) {
    if push.coalesced {
        output.message("A push was already running; its pass picks up new ops");
        return;
    }
    output.success(&format!("Pushed {} op(s)", push.pushed));
    for dropped in &push.dropped {
        output.warn(&format!(
            "Remote rejected {} {} {} (#{}), dropped: {}",
            dropped.op, dropped.collection, dropped.id, dropped.seq, dropped.reason
        ));
    }
    if push.transient_failures > 0 {
        output.warn(&format!(
            "{} op(s) failed temporarily and stay queued",
            push.transient_failures
        ));
    }
}

fn report_refresh(refresh: &RefreshReport, output: &Output) {
    let applied = &refresh.applied;
    if applied.written > 0 || applied.removed > 0 {
        output.message(&format!(
            "Pulled remote changes: {} written, {} removed",
            applied.written, applied.removed
        ));
    }
    if !refresh.conflicts.is_empty() {
        output.warn(&format!(
            "{} conflict(s) left untouched. Run `lorekeep sync conflicts` to review.",
            refresh.conflicts.len()
        ));
    }
}

fn print_conflicts(conflicts: &[Conflict], output: &Output) -> Result<()> {
    if output.is_json() {
        return output.print_json(conflicts);
    }
    if conflicts.is_empty() {
        output.success("No conflicts");
        return Ok(());
    }

    let side = |entity: &Option<lorekeep_core::Entity>| match entity {
        Some(e) => format!("\"{}\"", e.label()),
        None => "(deleted)".to_string(),
    };
    for conflict in conflicts {
        output.message(&format!(
            "{} {}: local {} / remote {}",
            conflict.collection,
            conflict.id,
            side(&conflict.local),
            side(&conflict.remote)
        ));
    }
    output.message(&format!("\n{} conflict(s)", conflicts.len()));
    Ok(())
}
