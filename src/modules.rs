use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::RemoteItem;
use crate::error::SyncError;
use crate::fs_util;
use crate::layout::sanitize_segment;

/// A registry `modules` row, e.g. `{ name: keep_patients, data: [LIDC-0001] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleEntry {
    pub name: String,
    #[serde(default)]
    pub data: Vec<String>,
}

/// Dataset-specific step run on the item list and on the finished tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetModule {
    /// Only these subjects are fetched and kept.
    KeepPatients(BTreeSet<String>),
}

impl TryFrom<&ModuleEntry> for DatasetModule {
    type Error = SyncError;

    fn try_from(entry: &ModuleEntry) -> Result<Self, SyncError> {
        match entry.name.as_str() {
            "keep_patients" => Ok(Self::KeepPatients(entry.data.iter().cloned().collect())),
            other => Err(SyncError::UnsupportedModule(other.to_string())),
        }
    }
}

impl DatasetModule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeepPatients(_) => "keep_patients",
        }
    }

    /// Narrows the listed items before anything is fetched.
    pub fn select(&self, items: Vec<RemoteItem>) -> Vec<RemoteItem> {
        match self {
            Self::KeepPatients(keep) => {
                let listed = items.len();
                let kept: Vec<RemoteItem> = items
                    .into_iter()
                    .filter(|item| keep.contains(&item.metadata.subject_id))
                    .collect();
                info!(
                    module = self.name(),
                    kept = kept.len(),
                    dropped = listed - kept.len(),
                    "selected series"
                );
                kept
            }
        }
    }

    /// Prunes the finished tree under `root`. Returns the removed directories.
    pub fn apply(&self, root: &Path, items: &[RemoteItem]) -> Result<Vec<PathBuf>, SyncError> {
        match self {
            Self::KeepPatients(keep) => keep_patients(root, keep, items),
        }
    }
}

/// Removes every top-level directory that belongs to no kept subject. Series left in their
/// flat directory count for the subject they belong to.
fn keep_patients(
    root: &Path,
    keep: &BTreeSet<String>,
    items: &[RemoteItem],
) -> Result<Vec<PathBuf>, SyncError> {
    info!(root = %root.display(), "removing unwanted patients");
    let kept_dirs: BTreeSet<String> = keep.iter().map(|subject| sanitize_segment(subject)).collect();
    let flat_owner: HashMap<&str, &str> = items
        .iter()
        .map(|item| (item.id.as_str(), item.metadata.subject_id.as_str()))
        .collect();

    let mut removed = Vec::new();
    let entries = fs::read_dir(root)
        .map_err(|err| SyncError::Filesystem(format!("read {}: {err}", root.display())))?;
    for entry in entries {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let is_dir = entry
            .file_type()
            .map_err(|err| SyncError::Filesystem(err.to_string()))?
            .is_dir();
        if !is_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let wanted = match flat_owner.get(name.as_str()) {
            Some(subject) => keep.contains(*subject),
            None => kept_dirs.contains(&name),
        };
        if wanted {
            continue;
        }
        let path = entry.path();
        fs_util::remove_path(&path)
            .map_err(|err| SyncError::Filesystem(format!("remove {}: {err}", path.display())))?;
        debug!(path = %path.display(), "removed folder");
        removed.push(path);
    }
    Ok(removed)
}
