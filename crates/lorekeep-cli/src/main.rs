//! lorekeep CLI
//!
//! Command-line interface for lorekeep - local-first worldbuilding records.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use lorekeep_core::sync::Strategy;
use lorekeep_core::{ArtifactScope, Collection, Config, EntityId, Workspace};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "lorekeep")]
#[command(about = "lorekeep - Local-first worldbuilding records with context bundles")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging (LOREKEEP_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an entity: `lorekeep add person name=Aldric group_id=1`
    Add {
        /// person, group, relationship, entry or title
        collection: Collection,
        /// Fields as field=value, or field:=<json> for raw JSON
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Change fields of an entity
    #[command(alias = "edit")]
    Update {
        collection: Collection,
        id: EntityId,
        /// Fields as field=value, or field:=<json> for raw JSON
        fields: Vec<String>,
        /// Remove an optional field
        #[arg(long)]
        unset: Vec<String>,
    },
    /// Delete an entity (dependents cascade or lose the reference)
    #[command(alias = "rm")]
    Delete { collection: Collection, id: EntityId },
    /// Show one entity
    Show { collection: Collection, id: EntityId },
    /// List entities
    #[command(alias = "ls")]
    List {
        /// Only this collection
        collection: Option<Collection>,
    },
    /// Show local changes waiting to be pushed
    Pending,
    /// Sync with the remote (push queued changes, pull remote ones)
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Manage context bundles
    #[command(alias = "ctx")]
    Contexts {
        #[command(subcommand)]
        command: ContextCommands,
    },
    /// Show status (pending work, last sync, bundle health)
    Status,
    /// Purge confirmed ops and trim the regeneration log
    Sweep,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// First-run reconcile between local and remote
    Reconcile {
        /// How to settle conflicts: skip, overwrite or keep-both
        #[arg(long)]
        strategy: Option<Strategy>,
    },
    /// List conflicts without changing anything
    Conflicts,
    /// Settle every current conflict with one strategy
    Resolve {
        #[arg(long)]
        strategy: Strategy,
    },
    /// Replace local data with the remote set
    Pull {
        /// Keep entities that still have unpushed changes
        #[arg(long)]
        preserve_pending: bool,
    },
    /// Keep syncing and regenerating in the foreground
    Watch,
}

#[derive(Subcommand)]
enum ContextCommands {
    /// List generated bundles
    #[command(alias = "ls")]
    List,
    /// Show a bundle, or one file of it
    Show {
        /// world, minor-groups or group-<id>
        scope: ArtifactScope,
        /// Print the content of this file
        #[arg(long)]
        file: Option<String>,
    },
    /// Regenerate bundles now (all when no scope is given)
    Regenerate { scopes: Vec<ArtifactScope> },
    /// Run pending debounced regeneration now
    Flush,
    /// Write every bundle to disk
    Export {
        /// Target directory (default: <data_dir>/contexts)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show the regeneration log
    Audit {
        #[arg(long)]
        scope: Option<ArtifactScope>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let config = Config::load_with_cli_override(cli.config.as_ref())
        .context("Failed to load configuration")?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Config { command } => {
            handle_config_command(command, cli.config.as_ref(), &output)
        }
        Commands::Sync { command } => {
            let workspace = Workspace::open(config)?;
            // Carries the remote identity stored with the data
            let config = workspace.config().clone();
            let shared = Arc::new(tokio::sync::Mutex::new(workspace));
            handle_sync_command(command, shared, &config, &output).await
        }
        command => {
            let mut workspace = Workspace::open(config)?;
            let is_write = matches!(
                command,
                Commands::Add { .. } | Commands::Update { .. } | Commands::Delete { .. }
            );

            let result = run_local(command, &mut workspace, &output);

            if is_write && result.is_ok() {
                after_write(workspace, &output).await;
            }
            result
        }
    }
}

fn run_local(command: Commands, workspace: &mut Workspace, output: &Output) -> Result<()> {
    match command {
        Commands::Add { collection, fields } => {
            commands::entity::add(workspace, collection, fields, output)
        }
        Commands::Update {
            collection,
            id,
            fields,
            unset,
        } => commands::entity::update(workspace, collection, id, fields, unset, output),
        Commands::Delete { collection, id } => {
            commands::entity::remove(workspace, collection, id, output)
        }
        Commands::Show { collection, id } => {
            commands::entity::show(workspace, collection, id, output)
        }
        Commands::List { collection } => commands::entity::list(workspace, collection, output),
        Commands::Pending => commands::entity::pending(workspace, output),
        Commands::Contexts { command } => handle_context_command(command, workspace, output),
        Commands::Status => commands::status::show(workspace, output),
        Commands::Sweep => commands::status::sweep(workspace, output),
        Commands::Sync { .. } | Commands::Config { .. } => unreachable!(), // Handled in main
    }
}

fn handle_context_command(
    command: ContextCommands,
    workspace: &mut Workspace,
    output: &Output,
) -> Result<()> {
    match command {
        ContextCommands::List => commands::contexts::list(workspace, output),
        ContextCommands::Show { scope, file } => {
            commands::contexts::show(workspace, scope, file, output)
        }
        ContextCommands::Regenerate { scopes } => {
            commands::contexts::regenerate(workspace, scopes, output)
        }
        ContextCommands::Flush => commands::contexts::flush(workspace, output),
        ContextCommands::Export { dir } => commands::contexts::export(workspace, dir, output),
        ContextCommands::Audit { scope, limit } => {
            commands::contexts::audit(workspace, scope, limit, output)
        }
    }
}

async fn handle_sync_command(
    command: Option<SyncCommands>,
    workspace: Arc<lorekeep_core::SharedWorkspace>,
    config: &Config,
    output: &Output,
) -> Result<()> {
    match command {
        None => commands::sync::sync(&workspace, config, output).await,
        Some(SyncCommands::Reconcile { strategy }) => {
            commands::sync::reconcile(&workspace, config, strategy, output).await
        }
        Some(SyncCommands::Conflicts) => commands::sync::conflicts(&workspace, config, output).await,
        Some(SyncCommands::Resolve { strategy }) => {
            commands::sync::resolve(&workspace, config, strategy, output).await
        }
        Some(SyncCommands::Pull { preserve_pending }) => {
            commands::sync::pull(&workspace, config, preserve_pending, output).await
        }
        Some(SyncCommands::Watch) => commands::sync::watch(workspace, config, output).await,
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Bring context bundles up to date and push if sync is on
///
/// The write itself is already durable; failures here only warn.
async fn after_write(mut workspace: Workspace, output: &Output) {
    if let Err(e) = workspace.flush() {
        output.warn(&format!("Context regeneration failed: {:#}", e));
    }

    let config = workspace.config();
    if !config.sync_enabled || config.remote_url.is_none() {
        return;
    }
    let engine = match commands::sync::remote_engine(config) {
        Ok(engine) => engine,
        Err(e) => {
            debug!(error = %e, "Auto-push skipped");
            return;
        }
    };

    let shared = tokio::sync::Mutex::new(workspace);
    match engine.push_queued(&shared).await {
        Ok(push) if push.transient_failures > 0 => {
            output.warn("Some changes could not be pushed yet; they stay queued");
        }
        Ok(_) => {}
        Err(e) => output.warn(&format!("Auto-push failed: {}", e)),
    }
}

/// Log to stderr, or to `log_file` when configured
fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_env("LOREKEEP_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!("lorekeep_core={},lorekeep={}", level, level))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let Some(ref log_path) = config.log_file else {
        let _ = builder.with_writer(std::io::stderr).try_init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => {
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_with_fields() {
        let cli = Cli::try_parse_from(["lorekeep", "add", "person", "name=Aldric", "group_id=1"])
            .unwrap();
        match cli.command {
            Commands::Add { collection, fields } => {
                assert_eq!(collection, Collection::Person);
                assert_eq!(fields, vec!["name=Aldric", "group_id=1"]);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_parse_reconcile_strategy() {
        let cli = Cli::try_parse_from([
            "lorekeep",
            "sync",
            "reconcile",
            "--strategy",
            "keep-both",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sync {
                command: Some(SyncCommands::Reconcile {
                    strategy: Some(Strategy::KeepBoth)
                })
            }
        ));
    }

    #[test]
    fn test_parse_context_scope() {
        let cli = Cli::try_parse_from(["lorekeep", "--json", "contexts", "show", "group-3"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Contexts {
                command: ContextCommands::Show {
                    scope: ArtifactScope::Group(EntityId(3)),
                    ..
                }
            }
        ));
    }

    #[test]
    fn test_unknown_collection_is_rejected() {
        assert!(Cli::try_parse_from(["lorekeep", "add", "dragon", "name=Smaug"]).is_err());
    }
}
