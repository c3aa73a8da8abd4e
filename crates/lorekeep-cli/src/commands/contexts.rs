//! Context bundle command handlers

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use lorekeep_core::{ArtifactScope, Workspace};

use super::sync::report_pass;
use crate::output::{Output, OutputFormat};

pub fn list(workspace: &Workspace, output: &Output) -> Result<()> {
    output.print_artifacts(&workspace.artifacts()?)
}

/// Show one artifact, or the content of one of its files
pub fn show(
    workspace: &Workspace,
    scope: ArtifactScope,
    file: Option<String>,
    output: &Output,
) -> Result<()> {
    let artifact = workspace
        .artifact(scope)?
        .ok_or_else(|| anyhow!("No context bundle for '{}'. Try `lorekeep contexts regenerate`.", scope))?;

    if let Some(name) = file {
        let file = artifact
            .bundle
            .file(&name)
            .ok_or_else(|| anyhow!("Bundle '{}' has no file '{}'", artifact.bundle.name, name))?;
        // File content is already JSON
        println!("{}", file.content);
        return Ok(());
    }

    match output.format {
        OutputFormat::Json => output.print_json(&artifact)?,
        OutputFormat::Quiet => println!("{}", artifact.artifact_id),
        OutputFormat::Human => {
            println!("Bundle:    {}", artifact.bundle.name);
            println!("Scope:     {}", artifact.scope);
            println!("Artifact:  {}", artifact.artifact_id);
            println!("Generated: {}", artifact.generated_at.format("%Y-%m-%d %H:%M:%S"));
            if let Some(since) = artifact.stale_since {
                println!("Stale:     since {}", since.format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(ref error) = artifact.last_error {
                println!("Error:     {}", error);
            }
            println!();
            for file in &artifact.bundle.files {
                println!("  {:<20} {:<14} {:>5} items", file.name, file.kind, file.item_count);
            }
        }
    }
    Ok(())
}

/// Regenerate the given scopes now, or every scope when none are given
pub fn regenerate(
    workspace: &mut Workspace,
    scopes: Vec<ArtifactScope>,
    output: &Output,
) -> Result<()> {
    let requested = if scopes.is_empty() {
        None
    } else {
        Some(scopes.into_iter().collect::<BTreeSet<_>>())
    };

    let report = workspace.regenerate_now(requested)?;
    if output.is_json() {
        return output.print_json(&report);
    }
    report_pass(&report, output);
    if report.is_clean() {
        output.success("Context bundles up to date");
    }
    Ok(())
}

/// Run pending debounced regeneration immediately
pub fn flush(workspace: &mut Workspace, output: &Output) -> Result<()> {
    match workspace.flush()? {
        Some(report) if output.is_json() => output.print_json(&report)?,
        Some(report) => report_pass(&report, output),
        None => output.message("Nothing pending."),
    }
    Ok(())
}

pub fn export(workspace: &mut Workspace, dir: Option<PathBuf>, output: &Output) -> Result<()> {
    let report = workspace.export_contexts(dir.as_deref())?;
    match output.format {
        OutputFormat::Json => output.print_json(&report)?,
        OutputFormat::Quiet => {
            for bundle in &report.bundles {
                println!("{}", bundle.display());
            }
        }
        OutputFormat::Human => {
            output.success(&format!(
                "Exported {} bundle(s) to {}",
                report.bundles.len(),
                report.root.display()
            ));
        }
    }
    Ok(())
}

pub fn audit(
    workspace: &Workspace,
    scope: Option<ArtifactScope>,
    limit: usize,
    output: &Output,
) -> Result<()> {
    output.print_audit(&workspace.audit_log(scope, limit)?)
}
