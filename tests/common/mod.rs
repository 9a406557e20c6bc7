#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::NaiveDate;
use md5::{Digest, Md5};

use archive_sync::catalog::Catalog;
use archive_sync::domain::{DigestSet, ItemMetadata, RemoteItem};
use archive_sync::error::SyncError;

/// In-memory archive. Every item holds a fixed set of content files; fetches can be made to
/// produce corrupted content, unreadable archives or exhausted requests a given number of times.
#[derive(Default)]
pub struct MockCatalog {
    datasets: BTreeMap<String, Vec<RemoteItem>>,
    content: HashMap<String, Vec<Vec<u8>>>,
    corrupt_remaining: Mutex<HashMap<String, usize>>,
    fail_remaining: Mutex<HashMap<String, usize>>,
    garble_remaining: Mutex<HashMap<String, usize>>,
    with_manifest: bool,
    hashes_unreachable: bool,
    pub fetches: Mutex<Vec<String>>,
    pub hash_queries: Mutex<usize>,
    pub listings: Mutex<usize>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, name: &str, items: Vec<RemoteItem>) -> Self {
        for item in &items {
            self.content.entry(item.id.clone()).or_insert_with(|| {
                vec![
                    format!("{}-slice-1", item.id).into_bytes(),
                    format!("{}-slice-2", item.id).into_bytes(),
                ]
            });
        }
        self.datasets.insert(name.to_string(), items);
        self
    }

    /// The first `times` fetches of `item_id` write content that does not match its hashes.
    pub fn corrupt_first(self, item_id: &str, times: usize) -> Self {
        self.corrupt_remaining
            .lock()
            .unwrap()
            .insert(item_id.to_string(), times);
        self
    }

    /// The first `times` fetches of `item_id` fail with `RequestExhausted`.
    pub fn fail_first(self, item_id: &str, times: usize) -> Self {
        self.fail_remaining
            .lock()
            .unwrap()
            .insert(item_id.to_string(), times);
        self
    }

    /// The first `times` fetches of `item_id` deliver an archive that cannot be unpacked.
    pub fn garble_first(self, item_id: &str, times: usize) -> Self {
        self.garble_remaining
            .lock()
            .unwrap()
            .insert(item_id.to_string(), times);
        self
    }

    /// Every hash query fails as if the integrity endpoint were down.
    pub fn hashes_unreachable(mut self) -> Self {
        self.hashes_unreachable = true;
        self
    }

    /// Fetched items carry an `md5hashes.csv`, so verification never asks the catalog.
    pub fn bundling_manifest(mut self) -> Self {
        self.with_manifest = true;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn fetches_of(&self, item_id: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == item_id)
            .count()
    }

    pub fn listing_count(&self) -> usize {
        *self.listings.lock().unwrap()
    }

    fn take(counter: &Mutex<HashMap<String, usize>>, item_id: &str) -> bool {
        let mut guard = counter.lock().unwrap();
        match guard.get_mut(item_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Catalog for MockCatalog {
    fn list_items(&self, dataset: &str) -> Result<Vec<RemoteItem>, SyncError> {
        *self.listings.lock().unwrap() += 1;
        self.datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| SyncError::NotFound {
                dataset: dataset.to_string(),
                available: self.datasets.keys().cloned().collect(),
            })
    }

    fn authoritative_hashes(&self, item_id: &str) -> Result<DigestSet, SyncError> {
        *self.hash_queries.lock().unwrap() += 1;
        if self.hashes_unreachable {
            return Err(SyncError::RequestExhausted {
                url: format!("mock://getSOPInstanceUIDs?SeriesInstanceUID={item_id}"),
                attempts: 10,
            });
        }
        Ok(self
            .content
            .get(item_id)
            .map(|files| files.iter().map(|bytes| md5_hex(bytes)).collect())
            .unwrap_or_default())
    }

    fn fetch(&self, item_id: &str, destination_dir: &Path) -> Result<(), SyncError> {
        self.fetches.lock().unwrap().push(item_id.to_string());
        if Self::take(&self.fail_remaining, item_id) {
            return Err(SyncError::RequestExhausted {
                url: format!("mock://getImage?SeriesInstanceUID={item_id}"),
                attempts: 10,
            });
        }
        if Self::take(&self.garble_remaining, item_id) {
            return Err(SyncError::InvalidResponse(format!(
                "archive for series {item_id} unreadable"
            )));
        }
        let corrupt = Self::take(&self.corrupt_remaining, item_id);
        let files = self.content.get(item_id).cloned().unwrap_or_default();

        let dir = destination_dir.join(item_id);
        fs::create_dir_all(&dir).unwrap();
        let mut manifest = String::from("FileName,MD5Hash\n");
        for (index, bytes) in files.iter().enumerate() {
            let name = format!("1-{:02}.dcm", index + 1);
            manifest.push_str(&format!("{name},{}\n", md5_hex(bytes)));
            if corrupt && index == 0 {
                fs::write(dir.join(&name), b"truncated").unwrap();
            } else {
                fs::write(dir.join(&name), bytes).unwrap();
            }
        }
        if self.with_manifest {
            fs::write(dir.join("md5hashes.csv"), manifest).unwrap();
        }
        Ok(())
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

pub fn series(id: &str, subject: &str, date: Option<(i32, u32, u32)>) -> RemoteItem {
    RemoteItem::new(
        id,
        ItemMetadata {
            subject_id: subject.to_string(),
            acquisition_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            group_id: format!("1.3.6.1.4.1.9328.50.{subject}.00042"),
            group_label: "CHEST".to_string(),
            sequence_number: "1".to_string(),
            item_label: "AXIAL".to_string(),
        },
    )
}
