//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use lorekeep_core::Config;

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, remote_url, sync_enabled, log_file, workspace_id, dataset_id, \
                    remote_identity, debounce_ms, min_members, min_cross_references, \
                    sync_interval_secs";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.print_json(&config)?,
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  remote_url:           {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled:         {}", config.sync_enabled);
            println!(
                "  log_file:             {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  workspace_id:         {}", config.context.workspace_id);
            println!("  dataset_id:           {}", config.context.dataset_id);
            println!(
                "  remote_identity:      {}",
                if config.context.remote_identity.is_empty() {
                    "(stored with the data)"
                } else {
                    config.context.remote_identity.as_str()
                }
            );
            println!("  debounce_ms:          {}", config.views.debounce_ms);
            println!("  min_members:          {}", config.views.min_members);
            println!("  min_cross_references: {}", config.views.min_cross_references);
            println!("  sync_interval_secs:   {}", config.sync.interval_secs);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let optional = |value: &str| {
        if value.is_empty() || value == "none" {
            None
        } else {
            Some(value.to_string())
        }
    };

    match key {
        "data_dir" => config.data_dir = value.into(),
        "remote_url" => config.remote_url = optional(value),
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        "workspace_id" => config.context.workspace_id = value.to_string(),
        "dataset_id" => config.context.dataset_id = value.to_string(),
        "remote_identity" => config.context.remote_identity = value.to_string(),
        "debounce_ms" => {
            config.views.debounce_ms = value
                .parse()
                .context("debounce_ms must be a number of milliseconds")?;
        }
        "min_members" => {
            config.views.min_members = value.parse().context("min_members must be a number")?;
        }
        "min_cross_references" => {
            config.views.min_cross_references = value
                .parse()
                .context("min_cross_references must be a number")?;
        }
        "sync_interval_secs" => {
            config.sync.interval_secs = value
                .parse()
                .context("sync_interval_secs must be a number of seconds")?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}
