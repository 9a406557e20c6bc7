use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::ResponseCache;
use crate::catalog::{BackendKind, Catalog, CatalogBackend, ManualCatalog};
use crate::checksum::DatasetChecksumStore;
use crate::config::{Credentials, CredentialsFile, DatasetRegistry};
use crate::domain::DatasetOutput;
use crate::error::SyncError;
use crate::http::CancelToken;
use crate::nbia::NbiaHttpClient;
use crate::orchestrator::PassSchedule;
use crate::store::Store;
use crate::sync::{SyncOutcome, Synchronizer};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Download even when the recorded checksum says the dataset is complete.
    pub force: bool,
    /// Skip the on-disk response cache for metadata calls.
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetAction {
    Downloaded,
    AlreadyComplete,
    AlternatePresent,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetResult {
    pub dataset: String,
    pub output: String,
    pub action: DatasetAction,
    pub path: String,
    pub outcome: Option<SyncOutcome>,
}

#[derive(Debug)]
pub struct BatchEntry {
    pub dataset: String,
    pub result: Result<DatasetResult, SyncError>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|entry| entry.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.succeeded()
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &SyncError)> {
        self.entries.iter().filter_map(|entry| {
            entry
                .result
                .as_ref()
                .err()
                .map(|err| (entry.dataset.as_str(), err))
        })
    }
}

/// What the output root already holds for a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Existing {
    Complete,
    Alternate(String),
    Absent,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Builds the catalog a dataset's registry entry asks for.
pub trait CatalogFactory {
    type Catalog: Catalog;

    fn connect(
        &self,
        backend: BackendKind,
        credentials: &Credentials,
        options: &SyncOptions,
    ) -> Result<Self::Catalog, SyncError>;
}

/// Connects to the real archive, caching metadata responses under the store's cache root.
pub struct HttpCatalogFactory {
    cache: Option<ResponseCache>,
    cancel: CancelToken,
}

impl HttpCatalogFactory {
    pub fn new(store: &Store, cancel: CancelToken) -> Self {
        Self {
            cache: Some(ResponseCache::new(store.http_cache_dir().into_std_path_buf())),
            cancel,
        }
    }
}

impl CatalogFactory for HttpCatalogFactory {
    type Catalog = CatalogBackend;

    fn connect(
        &self,
        backend: BackendKind,
        credentials: &Credentials,
        options: &SyncOptions,
    ) -> Result<CatalogBackend, SyncError> {
        match backend {
            BackendKind::Nbia => {
                let cache = if options.no_cache { None } else { self.cache.clone() };
                Ok(CatalogBackend::Nbia(NbiaHttpClient::new(
                    credentials,
                    cache,
                    self.cancel.clone(),
                )?))
            }
            BackendKind::Manual => Ok(CatalogBackend::Manual(ManualCatalog)),
        }
    }
}

/// Synchronizes a batch of datasets into one output root. A failing dataset is reported
/// and the batch moves on.
pub struct App<F: CatalogFactory> {
    store: Store,
    registry: DatasetRegistry,
    credentials: CredentialsFile,
    factory: F,
    cancel: CancelToken,
    schedule: PassSchedule,
}

impl<F: CatalogFactory> App<F> {
    pub fn new(
        store: Store,
        registry: DatasetRegistry,
        credentials: CredentialsFile,
        factory: F,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            registry,
            credentials,
            factory,
            cancel,
            schedule: PassSchedule::standard(),
        }
    }

    pub fn with_schedule(mut self, schedule: PassSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn run(
        &self,
        datasets: &[String],
        options: &SyncOptions,
        sink: &dyn ProgressSink,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let checksums = Arc::new(DatasetChecksumStore::for_output_root(
            self.store.output_root().as_std_path(),
        ));

        for dataset in datasets {
            if self.cancel.is_cancelled() {
                report.entries.push(BatchEntry {
                    dataset: dataset.clone(),
                    result: Err(SyncError::Cancelled),
                });
                continue;
            }
            let start = Instant::now();
            sink.event(ProgressEvent {
                message: format!("phase=Resolve; {dataset}"),
                elapsed: None,
            });
            let result = self.sync_one(dataset, options, &checksums, sink);
            match &result {
                Ok(done) => sink.event(ProgressEvent {
                    message: format!("phase=Done; {dataset} {}", action_label(done.action)),
                    elapsed: Some(start.elapsed()),
                }),
                Err(err) => {
                    error!(dataset = %dataset, error = %err, "dataset failed");
                    sink.event(ProgressEvent {
                        message: format!("phase=Failed; {dataset}"),
                        elapsed: Some(start.elapsed()),
                    });
                }
            }
            report.entries.push(BatchEntry {
                dataset: dataset.clone(),
                result,
            });
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "batch finished"
        );
        report
    }

    fn sync_one(
        &self,
        dataset: &str,
        options: &SyncOptions,
        checksums: &Arc<DatasetChecksumStore>,
        sink: &dyn ProgressSink,
    ) -> Result<DatasetResult, SyncError> {
        let resolved = self.registry.resolve(dataset)?;
        let credentials = self.credentials.for_backend(resolved.backend);
        let catalog = self.factory.connect(resolved.backend, &credentials, options)?;
        let synchronizer = Synchronizer::new(catalog, Arc::clone(checksums), self.cancel.clone())
            .with_schedule(self.schedule)
            .with_force(options.force)
            .with_modules(resolved.modules);

        let output = DatasetOutput::new(dataset);
        let output_path = self.store.output_path(&output);
        let output_name = output.name();

        if !options.force {
            match self.existing(&synchronizer, &output) {
                Existing::Complete => {
                    info!(dataset, path = %output_path, "output already complete; skipping");
                    return Ok(DatasetResult {
                        dataset: dataset.to_string(),
                        output: output_name,
                        action: DatasetAction::AlreadyComplete,
                        path: output_path.to_string(),
                        outcome: None,
                    });
                }
                Existing::Alternate(alternate) => {
                    warn!(dataset, alternate = %alternate, "dataset present in other packaging; skipping");
                    return Ok(DatasetResult {
                        dataset: dataset.to_string(),
                        output: output_name,
                        action: DatasetAction::AlternatePresent,
                        path: self.store.output_root().join(&alternate).to_string(),
                        outcome: None,
                    });
                }
                Existing::Absent => {}
            }
        }

        self.store.ensure_roots()?;
        let staging = if output_path.is_dir() {
            info!(dataset, path = %output_path, "output directory exists; synchronizing in place");
            output_path.clone()
        } else {
            self.store.staging_dir(dataset)
        };
        sink.event(ProgressEvent {
            message: format!("phase=Download; {dataset} into {staging}"),
            elapsed: None,
        });
        let outcome = synchronizer.synchronize(dataset, staging.as_std_path())?;

        if staging != output_path {
            info!(dataset, from = %staging, to = %output_path, "moving data to output directory");
            Store::place(&staging, &output_path)?;
            checksums.record(&output_name, output_path.as_std_path())?;
        } else if output_name != dataset {
            checksums.record(&output_name, output_path.as_std_path())?;
        }

        let action = if outcome.skipped {
            DatasetAction::AlreadyComplete
        } else {
            DatasetAction::Downloaded
        };
        Ok(DatasetResult {
            dataset: dataset.to_string(),
            output: output_name,
            action,
            path: output_path.to_string(),
            outcome: Some(outcome),
        })
    }

    fn existing<C: Catalog>(&self, synchronizer: &Synchronizer<C>, output: &DatasetOutput) -> Existing {
        let path = self.store.output_path(output);
        if synchronizer.already_complete(&output.name(), path.as_std_path()) {
            return Existing::Complete;
        }
        let alternate = output.alternate();
        if self.store.output_path(&alternate).as_std_path().exists() {
            return Existing::Alternate(alternate.name());
        }
        Existing::Absent
    }
}

fn action_label(action: DatasetAction) -> &'static str {
    match action {
        DatasetAction::Downloaded => "downloaded",
        DatasetAction::AlreadyComplete => "already complete",
        DatasetAction::AlternatePresent => "present in other packaging",
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::{DigestSet, RemoteItem};
    use crate::output::JsonOutput;

    #[derive(Default)]
    struct EmptyCatalog {
        listed: Mutex<usize>,
    }

    impl Catalog for EmptyCatalog {
        fn list_items(&self, _dataset: &str) -> Result<Vec<RemoteItem>, SyncError> {
            *self.listed.lock().unwrap() += 1;
            Ok(Vec::new())
        }

        fn authoritative_hashes(&self, _item_id: &str) -> Result<DigestSet, SyncError> {
            Ok(DigestSet::new())
        }

        fn fetch(&self, _item_id: &str, _destination_dir: &Path) -> Result<(), SyncError> {
            Ok(())
        }
    }

    struct EmptyFactory;

    impl CatalogFactory for EmptyFactory {
        type Catalog = EmptyCatalog;

        fn connect(
            &self,
            _backend: BackendKind,
            _credentials: &Credentials,
            _options: &SyncOptions,
        ) -> Result<EmptyCatalog, SyncError> {
            Ok(EmptyCatalog::default())
        }
    }

    #[test]
    fn compressed_alternate_skips_download() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new_with_paths(root.join("out"), None, root.join("cache"));
        store.ensure_roots().unwrap();
        std::fs::write(root.join("out").join("LIDC.tar.gz"), b"packed").unwrap();

        let app = App::new(
            store,
            DatasetRegistry::default(),
            CredentialsFile::default(),
            EmptyFactory,
            CancelToken::new(),
        );
        let report = app.run(&["LIDC".to_string()], &SyncOptions::default(), &JsonOutput);

        assert_eq!(report.succeeded(), 1);
        let result = report.entries[0].result.as_ref().unwrap();
        assert_eq!(result.action, DatasetAction::AlternatePresent);
    }
}
