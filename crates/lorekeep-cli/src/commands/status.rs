//! Status and maintenance command handlers

use std::collections::BTreeMap;

use anyhow::Result;

use lorekeep_core::{Sweeper, Workspace};

use crate::output::{Output, OutputFormat};

/// Show pending work, sync and regeneration health
pub fn show(workspace: &Workspace, output: &Output) -> Result<()> {
    let status = workspace.status()?;
    let config = workspace.config();

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for entity in workspace.list_all()? {
        *counts.entry(entity.collection().plural()).or_default() += 1;
    }

    match output.format {
        OutputFormat::Json => {
            output.print_json(&serde_json::json!({
                "status": status,
                "counts": counts,
                "sync_enabled": config.sync_enabled,
                "remote_url": config.remote_url,
                "data_dir": config.data_dir,
            }))?;
        }
        OutputFormat::Quiet => {
            println!("{}", status.pending_count);
        }
        OutputFormat::Human => {
            let never = || "never".to_string();
            println!("lorekeep status");
            println!("===============");
            println!();
            println!("Sync:");
            println!(
                "  Status:    {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.remote_url {
                println!("  Remote:    {}", url);
            }
            println!("  Pending:   {} op(s)", status.pending_count);
            println!(
                "  Last sync: {}",
                status
                    .last_sync_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(never)
            );
            println!();
            println!("Contexts:");
            println!(
                "  Last regeneration: {}",
                status
                    .last_regeneration_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(never)
            );
            if !status.pending_scopes.is_empty() {
                let scopes: Vec<String> =
                    status.pending_scopes.iter().map(|s| s.to_string()).collect();
                println!("  Waiting:           {}", scopes.join(", "));
            }
            for unhealthy in &status.unhealthy {
                println!("  ⚠ {}: {}", unhealthy.scope, unhealthy.reason);
            }
            println!();
            println!("Contents:");
            if counts.is_empty() {
                println!("  (empty)");
            }
            for (collection, count) in &counts {
                println!("  {:<14} {}", format!("{}:", collection), count);
            }
            if status.outdated {
                println!();
                println!("⚠ Another lorekeep process changed the data since this one opened it.");
            }
        }
    }

    Ok(())
}

/// Purge confirmed ops and give up on stale ones
pub fn sweep(workspace: &mut Workspace, output: &Output) -> Result<()> {
    let sweeper = Sweeper::from_config(workspace.config());
    let report = workspace.sweep(&sweeper)?;

    if output.is_json() {
        return output.print_json(&report);
    }
    output.success(&format!(
        "Purged {} confirmed op(s), trimmed {} audit entr{}",
        report.purged,
        report.audit_trimmed,
        if report.audit_trimmed == 1 { "y" } else { "ies" }
    ));
    for op in &report.reclaimed {
        output.warn(&format!(
            "Gave up on stale {} of {} {} (#{})",
            op.op, op.collection, op.entity_id, op.seq
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorekeep_core::Entity;

    #[test]
    fn test_status_and_sweep_on_fresh_workspace() {
        let mut ws = Workspace::open_in_memory().unwrap();
        ws.create(Entity::group(0, "Alder").record).unwrap();

        let out = Output::new(OutputFormat::Quiet);
        show(&ws, &out).unwrap();
        sweep(&mut ws, &out).unwrap();
        // Unconfirmed ops survive a sweep until they go stale
        assert_eq!(ws.pending_ops().unwrap().len(), 1);
    }
}
