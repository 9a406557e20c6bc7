mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use archive_sync::checksum::{DatasetChecksumStore, tree_hash};
use archive_sync::error::SyncError;
use archive_sync::http::CancelToken;
use archive_sync::layout::PathResolver;
use archive_sync::modules::DatasetModule;
use archive_sync::orchestrator::{MAX_PASSES, PassSchedule};
use archive_sync::sync::{METADATA_FILE, Synchronizer};

use common::{MockCatalog, series};

const A: &str = "1.3.6.1.4.1.9328.50.3.11111";
const B: &str = "1.3.6.1.4.1.9328.50.3.22222";

fn synchronizer(catalog: MockCatalog, root: &std::path::Path) -> Synchronizer<MockCatalog> {
    Synchronizer::new(
        catalog,
        Arc::new(DatasetChecksumStore::for_output_root(root)),
        CancelToken::new(),
    )
    .with_schedule(PassSchedule::standard().with_unit(Duration::ZERO))
}

fn two_series() -> Vec<archive_sync::domain::RemoteItem> {
    vec![
        series(A, "LIDC-0001", Some((2000, 1, 2))),
        series(B, "LIDC-0001", Some((2000, 1, 2))),
    ]
}

#[test]
fn corrupted_series_is_quarantined_and_refetched() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let catalog = MockCatalog::new()
        .with_dataset("D", two_series())
        .corrupt_first(B, 1);
    let sync = synchronizer(catalog, temp.path());

    let outcome = sync.synchronize("D", &staging).unwrap();

    assert_eq!(outcome.passes, 2);
    assert_eq!(outcome.fetched, 3);
    assert_eq!(outcome.quarantined, 1);
    assert!(!outcome.skipped);
    assert_eq!(sync.catalog().fetches_of(A), 1);
    assert_eq!(sync.catalog().fetches_of(B), 2);

    let items = two_series();
    let resolver = PathResolver::new(&staging, &items);
    for id in [A, B] {
        assert!(!staging.join(id).exists());
        assert!(resolver.resolve(id).unwrap().join("1-01.dcm").is_file());
    }
    assert!(staging.join(METADATA_FILE).is_file());
    assert_eq!(
        sync.checksums().get("D").unwrap(),
        Some(tree_hash(&staging).unwrap())
    );
}

#[test]
fn second_run_issues_no_fetches() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let sync = synchronizer(MockCatalog::new().with_dataset("D", two_series()), temp.path());

    sync.synchronize("D", &staging).unwrap();
    let fetched = sync.catalog().fetch_count();
    let again = sync.synchronize("D", &staging).unwrap();

    assert!(again.skipped);
    assert_eq!(again.fetched, 0);
    assert_eq!(sync.catalog().fetch_count(), fetched);
}

#[test]
fn rerun_without_checksum_record_is_still_a_no_op() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let sync = synchronizer(MockCatalog::new().with_dataset("D", two_series()), temp.path());

    sync.synchronize("D", &staging).unwrap();
    sync.checksums().remove("D").unwrap();
    let again = sync.synchronize("D", &staging).unwrap();

    assert!(!again.skipped);
    assert_eq!(again.fetched, 0);
    assert_eq!(again.passes, 0);
    assert_eq!(sync.catalog().fetch_count(), 2);
}

#[test]
fn unknown_dataset_never_fetches() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("NoSuchCollection");
    let sync = synchronizer(MockCatalog::new().with_dataset("D", two_series()), temp.path());

    let result = sync.synchronize("NoSuchCollection", &staging);

    assert_matches!(
        result,
        Err(SyncError::NotFound { dataset, available })
            if dataset == "NoSuchCollection" && available == vec!["D".to_string()]
    );
    assert_eq!(sync.catalog().fetch_count(), 0);
    assert!(!staging.exists());
}

#[test]
fn persistent_corruption_ends_in_transfer_incomplete() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let catalog = MockCatalog::new()
        .with_dataset("D", two_series())
        .corrupt_first(B, usize::MAX);
    let sync = synchronizer(catalog, temp.path());

    let result = sync.synchronize("D", &staging);

    assert_matches!(
        result,
        Err(SyncError::TransferIncomplete { dataset, remaining: 1 }) if dataset == "D"
    );
    assert_eq!(sync.catalog().fetches_of(B), (MAX_PASSES - 1) as usize);
    assert_eq!(sync.catalog().fetches_of(A), 1);
    assert_eq!(sync.checksums().get("D").unwrap(), None);
    // nothing is reorganized when the run does not converge
    assert!(staging.join(A).is_dir());
}

#[test]
fn unreadable_archives_are_retried_next_pass() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let catalog = MockCatalog::new()
        .with_dataset("D", two_series())
        .garble_first(A, 2);
    let sync = synchronizer(catalog, temp.path());

    let outcome = sync.synchronize("D", &staging).unwrap();

    assert_eq!(outcome.passes, 3);
    assert_eq!(sync.catalog().fetches_of(A), 3);
    assert_eq!(sync.catalog().fetches_of(B), 1);
}

#[test]
fn exhausted_download_aborts_the_run() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let catalog = MockCatalog::new()
        .with_dataset("D", two_series())
        .fail_first(A, usize::MAX);
    let sync = synchronizer(catalog, temp.path());

    let result = sync.synchronize("D", &staging);

    assert_matches!(result, Err(SyncError::RequestExhausted { attempts: 10, .. }));
    assert_eq!(sync.catalog().fetches_of(A), 1);
    assert_eq!(sync.catalog().fetches_of(B), 0);
    assert_eq!(sync.checksums().get("D").unwrap(), None);
}

#[test]
fn hash_endpoint_outage_keeps_downloads_and_aborts() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let catalog = MockCatalog::new()
        .with_dataset("D", two_series())
        .hashes_unreachable();
    let sync = synchronizer(catalog, temp.path());

    let result = sync.synchronize("D", &staging);

    assert_matches!(result, Err(SyncError::RequestExhausted { .. }));
    assert_eq!(sync.catalog().fetch_count(), 2);
    assert!(staging.join(A).join("1-01.dcm").is_file());
    assert!(staging.join(B).join("1-01.dcm").is_file());
}

#[test]
fn already_resolved_series_are_not_fetched_again() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let items = two_series();
    let resolved = PathResolver::new(&staging, &items).resolve(A).unwrap();
    fs::create_dir_all(&resolved).unwrap();
    fs::write(resolved.join("1-01.dcm"), b"kept").unwrap();

    let sync = synchronizer(MockCatalog::new().with_dataset("D", two_series()), temp.path());
    let outcome = sync.synchronize("D", &staging).unwrap();

    assert_eq!(outcome.fetched, 1);
    assert_eq!(sync.catalog().fetches_of(A), 0);
    assert_eq!(fs::read(resolved.join("1-01.dcm")).unwrap(), b"kept");
}

#[test]
fn bundled_manifest_avoids_hash_queries() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let catalog = MockCatalog::new()
        .with_dataset("D", two_series())
        .bundling_manifest();
    let sync = synchronizer(catalog, temp.path());

    sync.synchronize("D", &staging).unwrap();

    assert_eq!(*sync.catalog().hash_queries.lock().unwrap(), 0);
}

#[test]
fn leftovers_from_interrupted_runs_are_swept() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let stale = staging.join("9.9.9.99999");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("1-01.dcm"), b"old").unwrap();
    let partial = staging.join(".partial-x1y2");
    fs::create_dir_all(partial.join("extract")).unwrap();

    let sync = synchronizer(MockCatalog::new().with_dataset("D", two_series()), temp.path());
    let outcome = sync.synchronize("D", &staging).unwrap();

    assert_eq!(outcome.orphans_removed, 2);
    assert!(!stale.exists());
    assert!(!partial.exists());
}

#[test]
fn keep_patients_limits_fetches_and_prunes_the_tree() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("D");
    let mut items = two_series();
    items.push(series("1.3.6.1.4.1.9328.50.3.33333", "LIDC-0002", None));
    let stale_subject = staging.join("LIDC-0003");
    fs::create_dir_all(&stale_subject).unwrap();
    fs::write(stale_subject.join("notes.txt"), b"left over").unwrap();

    let keep = DatasetModule::KeepPatients(["LIDC-0001".to_string()].into_iter().collect());
    let sync = synchronizer(MockCatalog::new().with_dataset("D", items), temp.path())
        .with_modules(vec![keep]);
    let outcome = sync.synchronize("D", &staging).unwrap();

    assert_eq!(outcome.items, 2);
    assert_eq!(outcome.fetched, 2);
    assert_eq!(outcome.pruned, 1);
    assert_eq!(sync.catalog().fetches_of("1.3.6.1.4.1.9328.50.3.33333"), 0);
    assert!(staging.join("LIDC-0001").is_dir());
    assert!(!stale_subject.exists());
    assert_eq!(
        sync.checksums().get("D").unwrap(),
        Some(tree_hash(&staging).unwrap())
    );
}

#[test]
fn cancelled_run_stops_before_listing() {
    let temp = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let sync = Synchronizer::new(
        MockCatalog::new().with_dataset("D", two_series()),
        Arc::new(DatasetChecksumStore::for_output_root(temp.path())),
        cancel,
    );

    assert_matches!(
        sync.synchronize("D", &temp.path().join("D")),
        Err(SyncError::Cancelled)
    );
    assert_eq!(sync.catalog().listing_count(), 0);
}
