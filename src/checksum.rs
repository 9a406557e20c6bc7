use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs4::fs_std::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::fs_util;

/// Registry file kept at the top of an output root.
pub const CHECKSUM_FILE: &str = ".dataset_checksums.yaml";

/// Whole-dataset digests of finished downloads, keyed by output name.
///
/// Every read-modify-write runs under both an in-process mutex and an exclusive lock on a
/// sibling `.lock` file, so concurrent runs against the same output root serialize.
#[derive(Debug)]
pub struct DatasetChecksumStore {
    path: PathBuf,
    guard: Mutex<()>,
}

type Entries = BTreeMap<String, String>;

impl DatasetChecksumStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn for_output_root(root: &Path) -> Self {
        Self::new(root.join(CHECKSUM_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hashes `tree` and stores the digest under `dataset`, replacing any previous one.
    pub fn record(&self, dataset: &str, tree: &Path) -> Result<String, SyncError> {
        let digest = tree_hash(tree)?;
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        entries.insert(dataset.to_string(), digest.clone());
        self.save(&entries)?;
        info!(dataset, "recorded dataset checksum");
        Ok(digest)
    }

    /// `true` only when an entry exists and `tree` still hashes to it.
    ///
    /// Destructive: a missing tree drops the entry, and a tree with a differing digest is
    /// deleted together with its entry. Only call this on data that may be discarded.
    pub fn verify(&self, dataset: &str, tree: &Path) -> Result<bool, SyncError> {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        let Some(expected) = entries.get(dataset).cloned() else {
            debug!(dataset, "no recorded checksum");
            return Ok(false);
        };
        if !tree.exists() {
            warn!(dataset, path = %tree.display(), "dataset recorded but missing on disk");
            entries.remove(dataset);
            self.save(&entries)?;
            return Ok(false);
        }
        if tree_hash(tree)? == expected {
            info!(dataset, "dataset checksum matches");
            return Ok(true);
        }
        warn!(dataset, path = %tree.display(), "dataset checksum differs; removing dataset");
        fs_util::remove_path(tree).map_err(|err| {
            SyncError::Filesystem(format!("remove {}: {err}", tree.display()))
        })?;
        entries.remove(dataset);
        self.save(&entries)?;
        Ok(false)
    }

    pub fn remove(&self, dataset: &str) -> Result<bool, SyncError> {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        let removed = entries.remove(dataset).is_some();
        if removed {
            self.save(&entries)?;
        }
        Ok(removed)
    }

    pub fn get(&self, dataset: &str) -> Result<Option<String>, SyncError> {
        let _lock = self.lock()?;
        Ok(self.load()?.remove(dataset))
    }

    pub fn entries(&self) -> Result<Entries, SyncError> {
        let _lock = self.lock()?;
        self.load()
    }

    fn lock(&self) -> Result<StoreLock<'_>, SyncError> {
        let guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| {
                SyncError::Filesystem(format!("open lock {}: {err}", lock_path.display()))
            })?;
        file.lock_exclusive().map_err(|err| {
            SyncError::Filesystem(format!("lock {}: {err}", lock_path.display()))
        })?;
        Ok(StoreLock {
            _file: file,
            _guard: guard,
        })
    }

    fn load(&self) -> Result<Entries, SyncError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Entries::new()),
            Err(err) => return Err(SyncError::Filesystem(err.to_string())),
        };
        if content.trim().is_empty() {
            return Ok(Entries::new());
        }
        serde_yaml::from_str(&content).map_err(|err| {
            SyncError::Filesystem(format!("parse {}: {err}", self.path.display()))
        })
    }

    fn save(&self, entries: &Entries) -> Result<(), SyncError> {
        let content =
            serde_yaml::to_string(entries).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let tmp_path = self.path.with_extension("yaml.tmp");
        fs::write(&tmp_path, content).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs::rename(&tmp_path, &self.path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

// Field order matters: the file lock is released before the mutex.
struct StoreLock<'a> {
    _file: File,
    _guard: MutexGuard<'a, ()>,
}

/// SHA-256 of the bytes when `root` is a file. For a directory, SHA-256 over every regular
/// file below it in sorted relative-path order; each file contributes its `/`-separated
/// relative path, a NUL byte and its own digest.
pub fn tree_hash(root: &Path) -> Result<String, SyncError> {
    if root.is_file() {
        return file_digest(root);
    }
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let relative = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(file_digest(entry.path())?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

fn file_digest(path: &Path) -> Result<String, SyncError> {
    let mut file = File::open(path)
        .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(hex::encode(hasher.finalize()))
}
