use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::SyncError;

pub const DEFAULT_MAX_AGE_DAYS: i64 = 2;

/// On-disk cache for small metadata responses. Content downloads never go through here.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
    max_age: TimeDelta,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    url: String,
    fetched_at: DateTime<Utc>,
    body: String,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_age: TimeDelta::days(DEFAULT_MAX_AGE_DAYS),
        }
    }

    pub fn with_max_age(mut self, max_age: TimeDelta) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key(method: &str, url: &str, params: &[(&str, &str)]) -> String {
        let mut sorted = params.to_vec();
        sorted.sort();
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(url.as_bytes());
        for (name, value) in sorted {
            hasher.update(b"\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Utc::now())
    }

    pub fn put(&self, key: &str, url: &str, body: &str) -> Result<(), SyncError> {
        self.put_at(key, url, body, Utc::now())
    }

    fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let path = self.entry_path(key);
        let content = fs::read_to_string(&path).ok()?;
        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "dropping unreadable cache entry");
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        if now - entry.fetched_at > self.max_age {
            debug!(url = %entry.url, "cache entry expired");
            return None;
        }
        Some(entry.body)
    }

    fn put_at(
        &self,
        key: &str,
        url: &str,
        body: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        fs::create_dir_all(&self.root).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let entry = CacheEntry {
            url: url.to_string(),
            fetched_at,
            body: body.to_string(),
        };
        let content =
            serde_json::to_vec(&entry).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let path = self.entry_path(key);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &content).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}
