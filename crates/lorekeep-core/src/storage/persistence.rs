//! Context bundle export
//!
//! Writes materialized context bundles to the filesystem as one directory per
//! artifact, one file per sub-file. Uses atomic writes (write to temp file,
//! then rename) so a reader never sees a half-written bundle member.
//!
//! Layout under the export root (default `{data_dir}/contexts/`):
//! - `world/index.json`, `world/people.json`, ...
//! - `group-<id>/index.json`, ...
//! - `minor-groups/index.json`, ...

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::Config;
use crate::views::Bundle;

/// Filesystem export of context bundles
pub struct ContextExport {
    root: PathBuf,
}

impl ContextExport {
    /// Export into the given root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Export into the configured default location
    pub fn for_config(config: &Config) -> Self {
        Self::new(config.exports_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one bundle
    pub fn bundle_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write every sub-file of `bundle`, removing files it no longer declares
    pub fn write_bundle(&self, bundle: &Bundle) -> Result<PathBuf> {
        let dir = self.bundle_dir(&bundle.name);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory {:?}", dir))?;

        let mut written = BTreeSet::new();
        for file in &bundle.files {
            let path = dir.join(&file.name);
            atomic_write(&path, file.content.as_bytes())
                .with_context(|| format!("Failed to export {} to {:?}", file.name, path))?;
            written.insert(file.name.clone());
        }

        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {:?}", dir))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_file() && !written.contains(&name) {
                fs::remove_file(entry.path())
                    .with_context(|| format!("Failed to remove {:?}", entry.path()))?;
            }
        }

        debug!(bundle = %bundle.name, files = bundle.files.len(), "Exported bundle");
        Ok(dir)
    }

    /// Remove an exported bundle directory
    ///
    /// Returns false if nothing was exported under that name.
    pub fn remove_bundle(&self, name: &str) -> Result<bool> {
        let dir = self.bundle_dir(name);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).with_context(|| format!("Failed to delete {:?}", dir))?;
        Ok(true)
    }

    /// Read one exported sub-file
    pub fn read_file(&self, bundle: &str, file: &str) -> Result<Option<String>> {
        let path = self.bundle_dir(bundle).join(file);
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(content))
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

    file.write_all(data)
        .with_context(|| format!("Failed to write to temp file {:?}", temp_path))?;

    file.sync_all()
        .with_context(|| format!("Failed to sync temp file {:?}", temp_path))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::BundleFile;
    use tempfile::TempDir;

    fn bundle(name: &str, files: &[(&str, &str)]) -> Bundle {
        Bundle {
            name: name.to_string(),
            files: files
                .iter()
                .map(|(file, content)| BundleFile {
                    name: file.to_string(),
                    kind: "test".to_string(),
                    item_count: 1,
                    content: content.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("index.json");

        atomic_write(&path, b"{}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_write_bundle_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let export = ContextExport::new(temp_dir.path());

        let dir = export
            .write_bundle(&bundle("world", &[("index.json", "{\"a\":1}"), ("people.json", "[]")]))
            .unwrap();

        assert!(dir.ends_with("world"));
        assert_eq!(
            export.read_file("world", "people.json").unwrap().as_deref(),
            Some("[]")
        );
        assert!(export.read_file("world", "titles.json").unwrap().is_none());
    }

    #[test]
    fn test_rewrite_removes_undeclared_files() {
        let temp_dir = TempDir::new().unwrap();
        let export = ContextExport::new(temp_dir.path());

        export
            .write_bundle(&bundle("world", &[("index.json", "{}"), ("old.json", "[]")]))
            .unwrap();
        export
            .write_bundle(&bundle("world", &[("index.json", "{}")]))
            .unwrap();

        assert!(export.read_file("world", "old.json").unwrap().is_none());
        assert!(export.read_file("world", "index.json").unwrap().is_some());
    }

    #[test]
    fn test_remove_bundle() {
        let temp_dir = TempDir::new().unwrap();
        let export = ContextExport::new(temp_dir.path());

        assert!(!export.remove_bundle("group-4").unwrap());
        export.write_bundle(&bundle("group-4", &[("index.json", "{}")])).unwrap();
        assert!(export.remove_bundle("group-4").unwrap());
        assert!(!export.bundle_dir("group-4").exists());
    }
}
