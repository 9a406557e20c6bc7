use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::checksum::DatasetChecksumStore;
use crate::domain::RemoteItem;
use crate::error::SyncError;
use crate::http::CancelToken;
use crate::integrity::QuarantineManager;
use crate::layout::PathResolver;
use crate::modules::DatasetModule;
use crate::orchestrator::{PassSchedule, RetryOrchestrator};

/// Item metadata table written next to the downloaded series.
pub const METADATA_FILE: &str = "metadata.csv";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncOutcome {
    pub dataset: String,
    pub root: PathBuf,
    pub items: usize,
    pub fetched: usize,
    pub passes: u32,
    pub quarantined: usize,
    pub orphans_removed: usize,
    pub collisions: Vec<String>,
    /// Directories removed by registry modules after reorganizing.
    pub pruned: usize,
    /// Set when the recorded dataset checksum matched and nothing was touched.
    pub skipped: bool,
}

/// One catalog plus the shared checksum registry; synchronizes datasets into staging dirs.
pub struct Synchronizer<C: Catalog> {
    catalog: C,
    checksums: Arc<DatasetChecksumStore>,
    cancel: CancelToken,
    schedule: PassSchedule,
    force: bool,
    modules: Vec<DatasetModule>,
}

impl<C: Catalog> Synchronizer<C> {
    pub fn new(catalog: C, checksums: Arc<DatasetChecksumStore>, cancel: CancelToken) -> Self {
        Self {
            catalog,
            checksums,
            cancel,
            schedule: PassSchedule::standard(),
            force: false,
            modules: Vec::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: PassSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Ignore the recorded checksum and run every phase. Items already on disk are kept.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_modules(mut self, modules: Vec<DatasetModule>) -> Self {
        self.modules = modules;
        self
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn checksums(&self) -> &DatasetChecksumStore {
        &self.checksums
    }

    /// Brings `staging_dir` to a verified, reorganized copy of `dataset`.
    ///
    /// The item list is fetched before anything on disk is touched, so an unknown dataset
    /// fails without side effects. On success the tree hash is recorded under `dataset`.
    pub fn synchronize(&self, dataset: &str, staging_dir: &Path) -> Result<SyncOutcome, SyncError> {
        self.cancel.check()?;
        info!(dataset, "listing series");
        let mut items = self.catalog.list_items(dataset)?;
        info!(dataset, count = items.len(), "found series");
        for module in &self.modules {
            items = module.select(items);
        }

        if self.force {
            info!(dataset, "forced run; recorded checksum ignored");
        } else if self.checksums.verify(dataset, staging_dir)? {
            info!(dataset, path = %staging_dir.display(), "dataset already complete");
            return Ok(SyncOutcome {
                dataset: dataset.to_string(),
                root: staging_dir.to_path_buf(),
                items: items.len(),
                fetched: 0,
                passes: 0,
                quarantined: 0,
                orphans_removed: 0,
                collisions: Vec::new(),
                pruned: 0,
                skipped: true,
            });
        }

        fs::create_dir_all(staging_dir).map_err(|err| {
            SyncError::Filesystem(format!("create {}: {err}", staging_dir.display()))
        })?;
        write_metadata_table(&staging_dir.join(METADATA_FILE), &items)?;

        let orphans = QuarantineManager::sweep_orphans(staging_dir, &items)?;
        let report = RetryOrchestrator::new(&self.catalog, &self.cancel, self.schedule)
            .run(dataset, &items, staging_dir)?;

        self.cancel.check()?;
        let reorganized = PathResolver::new(staging_dir, &items).reorganize()?;
        if !reorganized.collisions.is_empty() {
            warn!(
                dataset,
                count = reorganized.collisions.len(),
                "some series kept their flat directory because the resolved path was taken"
            );
        }

        let mut pruned = 0usize;
        for module in &self.modules {
            info!(dataset, module = module.name(), "running module");
            pruned += module.apply(staging_dir, &items)?.len();
        }

        self.checksums.record(dataset, staging_dir)?;
        Ok(SyncOutcome {
            dataset: dataset.to_string(),
            root: staging_dir.to_path_buf(),
            items: items.len(),
            fetched: report.fetched,
            passes: report.passes,
            quarantined: report.quarantined,
            orphans_removed: orphans.len(),
            collisions: reorganized.collisions,
            pruned,
            skipped: false,
        })
    }

    /// Whether `output_path` still matches the checksum recorded under `output_name`.
    /// Shares the destructive semantics of [`DatasetChecksumStore::verify`].
    pub fn already_complete(&self, output_name: &str, output_path: &Path) -> bool {
        match self.checksums.verify(output_name, output_path) {
            Ok(complete) => complete,
            Err(err) => {
                warn!(output = output_name, error = %err, "could not check dataset checksum");
                false
            }
        }
    }
}

#[derive(Serialize)]
struct MetadataRow<'a> {
    item_id: &'a str,
    subject_id: &'a str,
    acquisition_date: String,
    group_id: &'a str,
    group_label: &'a str,
    sequence_number: &'a str,
    item_label: &'a str,
}

fn write_metadata_table(path: &Path, items: &[RemoteItem]) -> Result<(), SyncError> {
    let tmp_path = path.with_extension("csv.tmp");
    let mut writer = csv::Writer::from_path(&tmp_path)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    for item in items {
        let metadata = &item.metadata;
        writer
            .serialize(MetadataRow {
                item_id: &item.id,
                subject_id: &metadata.subject_id,
                acquisition_date: metadata
                    .acquisition_date
                    .map(|date| date.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
                group_id: &metadata.group_id,
                group_label: &metadata.group_label,
                sequence_number: &metadata.sequence_number,
                item_label: &metadata.item_label,
            })
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    drop(writer);
    fs::rename(&tmp_path, path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::domain::ItemMetadata;

    #[test]
    fn metadata_table_has_one_row_per_item() {
        let temp = tempfile::tempdir().unwrap();
        let items = vec![
            RemoteItem::new(
                "1.2.3",
                ItemMetadata {
                    subject_id: "P-1".to_string(),
                    acquisition_date: NaiveDate::from_ymd_opt(2001, 3, 4),
                    ..ItemMetadata::default()
                },
            ),
            RemoteItem::new("1.2.4", ItemMetadata::default()),
        ];
        let path = temp.path().join(METADATA_FILE);
        write_metadata_table(&path, &items).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("item_id,subject_id,acquisition_date"));
        assert!(lines[1].starts_with("1.2.3,P-1,2001-03-04"));
    }
}
