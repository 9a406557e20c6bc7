use std::path::Path;

use tracing::{debug, info};

use crate::domain::RemoteItem;
use crate::layout::PathResolver;

/// Decides which catalog items still have to be downloaded. Never touches the disk
/// beyond existence checks.
pub struct TransferPlanner;

impl TransferPlanner {
    /// Items with neither a flat directory under `staging_dir` nor an existing resolved path.
    /// Catalog order is preserved.
    pub fn missing(items: &[RemoteItem], staging_dir: &Path) -> Vec<RemoteItem> {
        let resolver = PathResolver::new(staging_dir, items);
        let mut missing = Vec::new();
        let mut present = 0usize;
        for item in items {
            if Self::is_present(&resolver, &item.id) {
                debug!(item = %item.id, "skipping series: downloaded");
                present += 1;
            } else {
                missing.push(item.clone());
            }
        }
        info!(
            present,
            missing = missing.len(),
            staging = %staging_dir.display(),
            "checked for downloaded series"
        );
        missing
    }

    fn is_present(resolver: &PathResolver<'_>, item_id: &str) -> bool {
        if resolver.flat_path(item_id).is_dir() {
            return true;
        }
        resolver
            .resolve(item_id)
            .map(|path| path.exists())
            .unwrap_or(false)
    }
}
