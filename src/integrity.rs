use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::domain::{DigestSet, RemoteItem};
use crate::error::SyncError;
use crate::fs_util::{self, MANIFEST_FILE, PARTIAL_PREFIX};
use crate::layout::PathResolver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptedItem {
    pub item_id: String,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub verified: Vec<String>,
    pub corrupted: Vec<CorruptedItem>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty()
    }
}

/// Recomputes content digests of downloaded items and compares them with the archive's.
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Checks every flat item directory under `staging_dir` that belongs to `items`.
    ///
    /// Expected digests come from the bundled manifest when the item carries one and from
    /// the catalog otherwise. An unreadable bundled manifest marks the item corrupted; a
    /// catalog that cannot answer fails the whole verification and deletes nothing.
    pub fn verify<C: Catalog + ?Sized>(
        staging_dir: &Path,
        items: &[RemoteItem],
        catalog: &C,
    ) -> Result<VerificationReport, SyncError> {
        let mut report = VerificationReport::default();
        if is_empty_dir(staging_dir)? {
            debug!(staging = %staging_dir.display(), "nothing to verify");
            return Ok(report);
        }

        info!("checking for corrupted files");
        for item in items {
            let dir = staging_dir.join(&item.id);
            if !dir.is_dir() {
                continue;
            }
            let observed = Self::observed_digests(&dir)?;
            let manifests = find_manifests(&dir)?;
            let expected = if manifests.is_empty() {
                debug!(item = %item.id, "no bundled manifest; querying archive checksums");
                catalog.authoritative_hashes(&item.id)?
            } else {
                match manifest_digests(&manifests) {
                    Ok(expected) => expected,
                    Err(err) => {
                        warn!(item = %item.id, error = %err, "unreadable checksum manifest");
                        report.corrupted.push(CorruptedItem {
                            item_id: item.id.clone(),
                            path: dir,
                            reason: err.to_string(),
                        });
                        continue;
                    }
                }
            };
            if observed == expected {
                report.verified.push(item.id.clone());
            } else {
                warn!(path = %dir.display(), "corrupted series found");
                report.corrupted.push(CorruptedItem {
                    item_id: item.id.clone(),
                    path: dir,
                    reason: format!(
                        "expected {} checksum(s), found {} file(s) with differing content",
                        expected.len(),
                        observed.len()
                    ),
                });
            }
        }
        Ok(report)
    }

    /// MD5 digests of every content file below `dir`.
    pub fn observed_digests(dir: &Path) -> Result<DigestSet, SyncError> {
        let mut digests = DigestSet::new();
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            if entry.file_type().is_file() && fs_util::is_content_file(entry.path()) {
                digests.insert(md5_file(entry.path())?);
            }
        }
        Ok(digests)
    }
}

fn manifest_digests(manifests: &[PathBuf]) -> Result<DigestSet, SyncError> {
    let mut digests = DigestSet::new();
    for manifest in manifests {
        for digest in read_manifest(manifest)? {
            digests.insert(digest);
        }
    }
    Ok(digests)
}

/// Deletes item directories that failed verification or belong to nothing requested.
pub struct QuarantineManager;

impl QuarantineManager {
    pub fn quarantine(report: &VerificationReport) -> Result<usize, SyncError> {
        let mut removed = 0usize;
        for item in &report.corrupted {
            fs_util::remove_path(&item.path).map_err(|err| {
                SyncError::Filesystem(format!("remove {}: {err}", item.path.display()))
            })?;
            debug!(item = %item.item_id, reason = %item.reason, "quarantined series");
            removed += 1;
        }
        if removed == 0 {
            info!("no corrupted series found");
        } else {
            info!(removed, "removed corrupted series");
        }
        Ok(removed)
    }

    /// Removes leftover scratch directories and any directory holding content files that
    /// sits neither inside a requested item's flat directory nor inside its resolved path.
    pub fn sweep_orphans(
        staging_dir: &Path,
        items: &[RemoteItem],
    ) -> Result<Vec<PathBuf>, SyncError> {
        let mut removed = Vec::new();
        if !staging_dir.is_dir() {
            return Ok(removed);
        }

        for entry in fs::read_dir(staging_dir).map_err(|err| SyncError::Filesystem(err.to_string()))? {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(PARTIAL_PREFIX) {
                fs_util::remove_path(&entry.path())
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                warn!(path = %entry.path().display(), "removed interrupted download");
                removed.push(entry.path());
            }
        }

        let resolver = PathResolver::new(staging_dir, items);
        let mut known: HashSet<PathBuf> = HashSet::new();
        for item in items {
            known.insert(resolver.flat_path(&item.id));
            if let Some(path) = resolver.resolve(&item.id) {
                known.insert(path);
            }
        }

        let mut holders = BTreeSet::new();
        for entry in WalkDir::new(staging_dir) {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            if entry.file_type().is_file() && fs_util::is_content_file(entry.path()) {
                if let Some(parent) = entry.path().parent() {
                    holders.insert(parent.to_path_buf());
                }
            }
        }

        for dir in holders {
            if dir == staging_dir {
                warn!(path = %dir.display(), "content files directly in staging directory; leaving them");
                continue;
            }
            let owned = dir
                .ancestors()
                .take_while(|ancestor| *ancestor != staging_dir)
                .any(|ancestor| known.contains(ancestor));
            if owned || !dir.exists() {
                continue;
            }
            fs_util::remove_path(&dir).map_err(|err| SyncError::Filesystem(err.to_string()))?;
            warn!(path = %dir.display(), "removed unknown series");
            removed.push(dir);
        }
        Ok(removed)
    }
}

pub fn md5_file(path: &Path) -> Result<String, SyncError> {
    let mut file = File::open(path)
        .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(hex::encode(hasher.finalize()))
}

fn find_manifests(dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut manifests = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        if entry.file_type().is_file() && entry.file_name() == MANIFEST_FILE {
            manifests.push(entry.into_path());
        }
    }
    Ok(manifests)
}

/// Reads the `MD5Hash` column of a bundled manifest.
pub fn read_manifest(path: &Path) -> Result<Vec<String>, SyncError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", path.display())))?;
    let headers = reader
        .headers()
        .map_err(|err| SyncError::InvalidResponse(err.to_string()))?;
    let column = headers
        .iter()
        .position(|header| header.trim() == "MD5Hash")
        .ok_or_else(|| {
            SyncError::InvalidResponse(format!("{} has no MD5Hash column", path.display()))
        })?;
    let mut digests = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| SyncError::InvalidResponse(err.to_string()))?;
        if let Some(value) = record.get(column) {
            digests.push(value.to_string());
        }
    }
    Ok(digests)
}

fn is_empty_dir(dir: &Path) -> Result<bool, SyncError> {
    if !dir.is_dir() {
        return Ok(true);
    }
    let mut entries = fs::read_dir(dir).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_of_known_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("1-1.dcm");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(md5_file(&path).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn manifest_column_is_read() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(MANIFEST_FILE);
        fs::write(&path, "FileName,MD5Hash\n1-1.dcm,900150983CD24FB0D6963F7D28E17F72\n").unwrap();
        assert_eq!(
            read_manifest(&path).unwrap(),
            vec!["900150983CD24FB0D6963F7D28E17F72".to_string()]
        );
    }
}
