use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::domain::DatasetOutput;
use crate::error::SyncError;
use crate::fs_util::atomic_rename_dir;

/// Subdirectory of the cache root holding cached metadata responses.
pub const HTTP_CACHE_DIR: &str = "http_cache";

/// Where finished datasets, in-progress downloads and cached responses live.
#[derive(Debug, Clone)]
pub struct Store {
    output_root: Utf8PathBuf,
    staging_root: Option<Utf8PathBuf>,
    cache_root: Utf8PathBuf,
}

impl Store {
    /// Uses `~/.cache/archive-sync` for cached responses.
    pub fn new(output_root: Utf8PathBuf) -> Result<Self, SyncError> {
        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("archive-sync"))
                    .ok()
            })
            .ok_or_else(|| {
                SyncError::Filesystem("unable to resolve cache directory".to_string())
            })?;

        Ok(Self {
            output_root,
            staging_root: None,
            cache_root,
        })
    }

    pub fn new_with_paths(
        output_root: Utf8PathBuf,
        staging_root: Option<Utf8PathBuf>,
        cache_root: Utf8PathBuf,
    ) -> Self {
        Self {
            output_root,
            staging_root,
            cache_root,
        }
    }

    pub fn with_staging_root(mut self, staging_root: Option<Utf8PathBuf>) -> Self {
        self.staging_root = staging_root;
        self
    }

    pub fn with_cache_root(mut self, cache_root: Utf8PathBuf) -> Self {
        self.cache_root = cache_root;
        self
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    /// Downloads happen in the output root unless a separate staging root is set.
    pub fn staging_root(&self) -> &Utf8Path {
        self.staging_root.as_deref().unwrap_or(&self.output_root)
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn http_cache_dir(&self) -> Utf8PathBuf {
        self.cache_root.join(HTTP_CACHE_DIR)
    }

    pub fn staging_dir(&self, dataset: &str) -> Utf8PathBuf {
        self.staging_root().join(dataset)
    }

    pub fn output_path(&self, output: &DatasetOutput) -> Utf8PathBuf {
        self.output_root.join(output.name())
    }

    pub fn ensure_roots(&self) -> Result<(), SyncError> {
        for root in [self.output_root.as_path(), self.staging_root(), self.cache_root.as_path()] {
            fs::create_dir_all(root.as_std_path())
                .map_err(|err| SyncError::Filesystem(format!("create {root}: {err}")))?;
        }
        Ok(())
    }

    /// Moves a finished staging directory to its output path, replacing whatever is there.
    pub fn place(staging: &Utf8Path, output: &Utf8Path) -> Result<(), SyncError> {
        if staging == output {
            return Ok(());
        }
        atomic_rename_dir(staging.as_std_path(), output.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("move {staging} to {output}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_defaults_to_output_root() {
        let store = Store::new_with_paths(
            Utf8PathBuf::from("/data/out"),
            None,
            Utf8PathBuf::from("/data/cache"),
        );
        assert_eq!(store.staging_dir("LIDC-IDRI"), Utf8PathBuf::from("/data/out/LIDC-IDRI"));
        assert_eq!(store.cache_root(), Utf8PathBuf::from("/data/cache"));
        assert_eq!(store.http_cache_dir(), Utf8PathBuf::from("/data/cache/http_cache"));

        let store = store.with_staging_root(Some(Utf8PathBuf::from("/scratch")));
        assert_eq!(store.staging_dir("LIDC-IDRI"), Utf8PathBuf::from("/scratch/LIDC-IDRI"));
        let output = DatasetOutput::new("LIDC-IDRI").compressed(true);
        assert_eq!(
            store.output_path(&output),
            Utf8PathBuf::from("/data/out/LIDC-IDRI.tar.gz")
        );
    }
}
