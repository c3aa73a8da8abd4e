//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use anyhow::{Context, Result};
use serde::Serialize;

use lorekeep_core::views::{ArtifactSummary, AuditEntry};
use lorekeep_core::{Entity, PendingOp};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
        println!("{}", text);
        Ok(())
    }

    /// Print a single entity with all of its fields
    pub fn print_entity(&self, entity: &Entity) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                println!("{} {}", entity.collection(), entity.id);
                for (field, value) in entity.to_fields() {
                    if field == "id" {
                        continue;
                    }
                    let shown = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    println!("  {:<12} {}", format!("{}:", field), shown);
                }
            }
            OutputFormat::Json => self.print_json(&entity.to_fields())?,
            OutputFormat::Quiet => println!("{}", entity.id),
        }
        Ok(())
    }

    /// Print a list of entities
    pub fn print_entities(&self, entities: &[Entity]) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if entities.is_empty() {
                    println!("No entities found.");
                    return Ok(());
                }
                for entity in entities {
                    println!(
                        "{:>6} | {:<12} | {}",
                        entity.id.get(),
                        entity.collection().as_str(),
                        truncate(entity.label(), 50)
                    );
                }
                println!("\n{} entit{}", entities.len(), plural_y(entities.len()));
            }
            OutputFormat::Json => {
                let rows: Vec<_> = entities
                    .iter()
                    .map(|e| {
                        let mut fields = e.to_fields();
                        fields.insert(
                            "collection".to_string(),
                            serde_json::Value::from(e.collection().as_str()),
                        );
                        fields
                    })
                    .collect();
                self.print_json(&rows)?;
            }
            OutputFormat::Quiet => {
                for entity in entities {
                    println!("{}", entity.id);
                }
            }
        }
        Ok(())
    }

    /// Print queued operations
    pub fn print_ops(&self, ops: &[PendingOp]) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if ops.is_empty() {
                    println!("Nothing queued.");
                    return Ok(());
                }
                for op in ops {
                    println!(
                        "#{:<5} {:<6} {} {} ({})",
                        op.seq,
                        op.op.as_str(),
                        op.collection,
                        op.entity_id,
                        op.enqueued_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!("\n{} queued op(s)", ops.len());
            }
            OutputFormat::Json => self.print_json(ops)?,
            OutputFormat::Quiet => {
                for op in ops {
                    println!("{}", op.seq);
                }
            }
        }
        Ok(())
    }

    /// Print stored artifacts
    pub fn print_artifacts(&self, artifacts: &[ArtifactSummary]) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if artifacts.is_empty() {
                    println!("No context bundles generated yet.");
                    return Ok(());
                }
                for artifact in artifacts {
                    let items: usize = artifact.source_counts.values().sum();
                    let state = if artifact.last_error.is_some() {
                        "failed"
                    } else if artifact.stale {
                        "stale"
                    } else {
                        "fresh"
                    };
                    println!(
                        "{:<16} | {:<6} | {:>5} items | {}",
                        artifact.scope.to_string(),
                        state,
                        items,
                        artifact.generated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                    if let Some(ref error) = artifact.last_error {
                        println!("{:<16}   last error: {}", "", truncate(error, 60));
                    }
                }
            }
            OutputFormat::Json => self.print_json(artifacts)?,
            OutputFormat::Quiet => {
                for artifact in artifacts {
                    println!("{}", artifact.scope);
                }
            }
        }
        Ok(())
    }

    /// Print regeneration audit entries
    pub fn print_audit(&self, entries: &[AuditEntry]) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No regenerations recorded.");
                    return Ok(());
                }
                for entry in entries {
                    let outcome = match entry.error {
                        Some(ref error) => format!("failed: {}", truncate(error, 40)),
                        None => format!("{} items", entry.item_count),
                    };
                    println!(
                        "{} | {:<16} | {:<9} | {:>5}ms | {}",
                        entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.scope.to_string(),
                        entry.trigger.as_str(),
                        entry.duration_ms,
                        outcome
                    );
                }
            }
            OutputFormat::Json => self.print_json(entries)?,
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.id);
                }
            }
        }
        Ok(())
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn plural_y(count: usize) -> &'static str {
    if count == 1 {
        "y"
    } else {
        "ies"
    }
}

/// Truncate a string to max characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("Þórr of the Æsir", 8), "Þórr ...");
    }

    #[test]
    fn test_plural() {
        assert_eq!(plural_y(1), "y");
        assert_eq!(plural_y(3), "ies");
    }
}
