use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One remotely addressable series together with the metadata needed to place it on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub metadata: ItemMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub subject_id: String,
    pub acquisition_date: Option<NaiveDate>,
    pub group_id: String,
    pub group_label: String,
    pub sequence_number: String,
    pub item_label: String,
}

impl RemoteItem {
    pub fn new(id: impl Into<String>, metadata: ItemMetadata) -> Self {
        Self {
            id: id.into(),
            metadata,
        }
    }
}

/// Parses the archive's `SeriesDate` value. Unparsable values are treated like missing ones.
pub fn parse_acquisition_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(value.date());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok()
}

/// Multiset of lower-case hex digests. Two items verify when their sets are equal,
/// including how often each digest occurs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestSet(BTreeMap<String, usize>);

impl DigestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, digest: impl AsRef<str>) {
        let normalized = digest.as_ref().trim().to_ascii_lowercase();
        *self.0.entry(normalized).or_insert(0) += 1;
    }

    pub fn len(&self) -> usize {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.0.contains_key(&digest.trim().to_ascii_lowercase())
    }
}

impl<S: AsRef<str>> FromIterator<S> for DigestSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut set = DigestSet::new();
        for digest in iter {
            set.insert(digest);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Identifies one produced artifact of a dataset in the checksum registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetOutput {
    pub dataset: String,
    pub compressed: bool,
    pub bids: bool,
}

impl DatasetOutput {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            compressed: false,
            bids: false,
        }
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn bids(mut self, bids: bool) -> Self {
        self.bids = bids;
        self
    }

    pub fn name(&self) -> String {
        let mut name = self.dataset.clone();
        if self.bids {
            name.push_str("_BIDS");
        }
        if self.compressed {
            name.push_str(".tar.gz");
        }
        name
    }

    /// Same dataset and conversion, opposite packaging.
    pub fn alternate(&self) -> Self {
        Self {
            dataset: self.dataset.clone(),
            compressed: !self.compressed,
            bids: self.bids,
        }
    }
}

impl fmt::Display for DatasetOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
