use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::domain::{ItemMetadata, RemoteItem};
use crate::error::SyncError;

pub const UNKNOWN_DATE: &str = "unknown_date";

/// How many trailing characters of a remote UID end up in a directory name.
pub const UID_SUFFIX_LEN: usize = 5;

static UNSAFE_SEGMENT_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[/\\\x00]").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorganizeReport {
    pub moved: usize,
    pub collisions: Vec<String>,
}

/// Maps flat item identifiers under `root` to `subject/date-study-uid/number-series-uid`.
pub struct PathResolver<'a> {
    root: PathBuf,
    items: HashMap<&'a str, &'a ItemMetadata>,
    order: Vec<&'a str>,
}

impl<'a> PathResolver<'a> {
    pub fn new(root: impl Into<PathBuf>, items: &'a [RemoteItem]) -> Self {
        let mut index = HashMap::with_capacity(items.len());
        let mut order = Vec::with_capacity(items.len());
        for item in items {
            if index.insert(item.id.as_str(), &item.metadata).is_none() {
                order.push(item.id.as_str());
            }
        }
        Self {
            root: root.into(),
            items: index,
            order,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `None` when `item_id` has no metadata row; such items stay in the flat layout.
    pub fn resolve(&self, item_id: &str) -> Option<PathBuf> {
        let metadata = self.items.get(item_id)?;
        let date = date_segment(item_id, metadata.acquisition_date);
        let study = format!(
            "{date}-{}-{}",
            metadata.group_label,
            uid_suffix(&metadata.group_id)
        );
        let series = format!(
            "{}-{}-{}",
            metadata.sequence_number,
            metadata.item_label,
            uid_suffix(item_id)
        );
        Some(
            self.root
                .join(sanitize_segment(&metadata.subject_id))
                .join(sanitize_segment(&study))
                .join(sanitize_segment(&series)),
        )
    }

    pub fn flat_path(&self, item_id: &str) -> PathBuf {
        self.root.join(item_id)
    }

    /// Moves every flat item directory to its resolved path. A target that already
    /// exists is never overwritten; the flat directory is left in place instead.
    pub fn reorganize(&self) -> Result<ReorganizeReport, SyncError> {
        info!(root = %self.root.display(), "renaming folders");
        self.warn_on_shared_targets();

        let mut report = ReorganizeReport::default();
        for item_id in &self.order {
            let flat = self.flat_path(item_id);
            if !flat.is_dir() {
                continue;
            }
            let Some(target) = self.resolve(item_id) else {
                continue;
            };
            if target.exists() {
                warn!(
                    item = item_id,
                    target = %target.display(),
                    "resolved path already taken; leaving series in flat layout"
                );
                report.collisions.push(item_id.to_string());
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
            }
            fs::rename(&flat, &target).map_err(|err| {
                SyncError::Filesystem(format!(
                    "move {} to {}: {err}",
                    flat.display(),
                    target.display()
                ))
            })?;
            debug!(item = item_id, target = %target.display(), "moved series");
            report.moved += 1;
        }
        Ok(report)
    }

    fn warn_on_shared_targets(&self) {
        let mut targets: HashMap<PathBuf, Vec<&str>> = HashMap::new();
        for item_id in &self.order {
            if let Some(target) = self.resolve(item_id) {
                targets.entry(target).or_default().push(*item_id);
            }
        }
        for (target, ids) in targets {
            if ids.len() > 1 {
                warn!(
                    target = %target.display(),
                    items = ?ids,
                    "several series resolve to the same path"
                );
            }
        }
    }
}

fn date_segment(item_id: &str, date: Option<NaiveDate>) -> String {
    match date {
        Some(date) => date.format("%d-%m-%Y").to_string(),
        None => {
            debug!(item = item_id, fallback = UNKNOWN_DATE, "series date missing");
            UNKNOWN_DATE.to_string()
        }
    }
}

/// Last `UID_SUFFIX_LEN` characters of `uid`, or all of it when shorter.
pub fn uid_suffix(uid: &str) -> &str {
    let count = uid.chars().count();
    if count <= UID_SUFFIX_LEN {
        return uid;
    }
    let start = uid
        .char_indices()
        .nth(count - UID_SUFFIX_LEN)
        .map(|(index, _)| index)
        .unwrap_or(0);
    &uid[start..]
}

pub(crate) fn sanitize_segment(value: &str) -> String {
    let cleaned = UNSAFE_SEGMENT_CHARS.replace_all(value, "_");
    match cleaned.as_ref() {
        "" | "." | ".." => "_".to_string(),
        other => other.to_string(),
    }
}
