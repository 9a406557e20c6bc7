use std::fs;
use std::io;
use std::path::Path;

use zip::ZipArchive;

use crate::error::SyncError;

/// Extension of the files that make up an item's content.
pub const CONTENT_EXTENSION: &str = "dcm";

/// Checksum manifest the archive bundles with each downloaded series.
pub const MANIFEST_FILE: &str = "md5hashes.csv";

/// Prefix of scratch directories used while an item is being unpacked.
pub const PARTIAL_PREFIX: &str = ".partial-";

/// Unpacks `zip_path` below `target_dir`. Errors name the archive and, where one is
/// involved, the offending entry; entries escaping `target_dir` are refused.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), SyncError> {
    let archive_err = |what: &str, err: &dyn std::fmt::Display| {
        SyncError::Filesystem(format!("{what} {}: {err}", zip_path.display()))
    };
    let file = fs::File::open(zip_path).map_err(|err| archive_err("open", &err))?;
    let mut archive = ZipArchive::new(file).map_err(|err| archive_err("read", &err))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| archive_err(&format!("entry #{index} of"), &err))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(SyncError::Filesystem(format!(
                "entry {:?} of {} points outside the extraction directory",
                entry.name(),
                zip_path.display()
            )));
        };
        let destination = target_dir.join(relative);
        let entry_err = |err: io::Error| {
            SyncError::Filesystem(format!("unpack {}: {err}", destination.display()))
        };

        if entry.is_dir() {
            fs::create_dir_all(&destination).map_err(entry_err)?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(entry_err)?;
        }
        let mut out = fs::File::create(&destination).map_err(entry_err)?;
        io::copy(&mut entry, &mut out).map_err(entry_err)?;
    }
    Ok(())
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
}

/// Removes a file or a whole directory tree. A missing path is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn is_content_file(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case(CONTENT_EXTENSION))
        .unwrap_or(false)
}
