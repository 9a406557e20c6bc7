use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::info;

use crate::domain::{DigestSet, RemoteItem};
use crate::error::SyncError;
use crate::nbia::NbiaHttpClient;

/// Capabilities every archive backend provides to a synchronization run.
pub trait Catalog: Send + Sync {
    /// Enumerates the items of `dataset`. Unknown names fail with `NotFound`.
    fn list_items(&self, dataset: &str) -> Result<Vec<RemoteItem>, SyncError>;

    /// Expected content digests for one item, as published by the archive.
    fn authoritative_hashes(&self, item_id: &str) -> Result<DigestSet, SyncError>;

    /// Downloads one item and unpacks it into `destination_dir/item_id`.
    fn fetch(&self, item_id: &str, destination_dir: &Path) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Nbia,
    Manual,
}

impl FromStr for BackendKind {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "TciaDownloader" | "nbia" => Ok(BackendKind::Nbia),
            "Manual" => Ok(BackendKind::Manual),
            other => Err(SyncError::UnsupportedDownloader(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Nbia => write!(f, "TciaDownloader"),
            BackendKind::Manual => write!(f, "Manual"),
        }
    }
}

/// The closed set of backends, chosen once per dataset.
pub enum CatalogBackend {
    Nbia(NbiaHttpClient),
    Manual(ManualCatalog),
}

impl Catalog for CatalogBackend {
    fn list_items(&self, dataset: &str) -> Result<Vec<RemoteItem>, SyncError> {
        match self {
            CatalogBackend::Nbia(client) => client.list_items(dataset),
            CatalogBackend::Manual(manual) => manual.list_items(dataset),
        }
    }

    fn authoritative_hashes(&self, item_id: &str) -> Result<DigestSet, SyncError> {
        match self {
            CatalogBackend::Nbia(client) => client.authoritative_hashes(item_id),
            CatalogBackend::Manual(manual) => manual.authoritative_hashes(item_id),
        }
    }

    fn fetch(&self, item_id: &str, destination_dir: &Path) -> Result<(), SyncError> {
        match self {
            CatalogBackend::Nbia(client) => client.fetch(item_id, destination_dir),
            CatalogBackend::Manual(manual) => manual.fetch(item_id, destination_dir),
        }
    }
}

/// Backend for datasets that are placed by hand; it never lists anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualCatalog;

impl Catalog for ManualCatalog {
    fn list_items(&self, dataset: &str) -> Result<Vec<RemoteItem>, SyncError> {
        info!(dataset, "nothing to download for manually provided collection");
        Ok(Vec::new())
    }

    fn authoritative_hashes(&self, _item_id: &str) -> Result<DigestSet, SyncError> {
        Ok(DigestSet::new())
    }

    fn fetch(&self, _item_id: &str, _destination_dir: &Path) -> Result<(), SyncError> {
        Ok(())
    }
}
