use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::{GistConfig, RelPersistence, WalConfig};
use crate::error::GistError;
use crate::index::gist::am::GistIndex;
use crate::index::gist::build::HeapRow;
use crate::index::gist::opclass::{GistOpclass, IndexDescriptor};
use crate::index::gist::options::GistOptions;
use crate::index::gist::page::{GistPage, GIST_BUILD_LSN, GIST_ROOT_BLKNO};
use crate::index::gist::scan::ScanKey;
use crate::index::gist::vacuum::IndexVacuumInfo;
use crate::storage::fsm::FreeSpaceMap;
use crate::storage::page::ItemPointer;
use crate::tests::harness::walk_tree;
use crate::tests::opclasses::{range_datum, IntRangeOps, STRATEGY_OVERLAP};
use crate::transaction::{TransactionHorizon, TransactionManager};

fn descriptor() -> IndexDescriptor {
    IndexDescriptor::new(vec![Arc::new(IntRangeOps) as Arc<dyn GistOpclass>])
}

fn horizon() -> Arc<dyn TransactionHorizon> {
    Arc::new(TransactionManager::new())
}

fn config(persistence: RelPersistence) -> GistConfig {
    GistConfig::default()
        .with_persistence(persistence)
        .with_choose_seed(Some(7u64))
        .with_wal(WalConfig::default().with_sync_on_flush(false))
}

fn create(dir: &Path, persistence: RelPersistence) -> GistIndex {
    GistIndex::create(
        dir,
        "ranges",
        descriptor(),
        horizon(),
        config(persistence),
        GistOptions::default(),
    )
    .unwrap()
}

fn reopen(dir: &Path, persistence: RelPersistence) -> GistIndex {
    GistIndex::open(
        dir,
        "ranges",
        descriptor(),
        horizon(),
        config(persistence),
        GistOptions::default(),
    )
    .unwrap()
}

fn insert_rows(index: &GistIndex, rows: std::ops::Range<u32>) {
    for i in rows {
        let lo = i as i64 * 10;
        index
            .insert(&[Some(range_datum(lo, lo + 4))], ItemPointer::new(i, 1))
            .unwrap();
    }
}

fn count_rows(index: &GistIndex) -> usize {
    let mut scan = index.begin_scan();
    scan.rescan(
        vec![ScanKey::operator(
            0,
            STRATEGY_OVERLAP,
            Some(range_datum(i64::MIN, i64::MAX)),
        )],
        vec![],
    )
    .unwrap();
    let mut n = 0;
    while scan.get_tuple().unwrap().is_some() {
        n += 1;
    }
    n
}

/// Drops the index without writing back dirty pages.
fn crash(index: GistIndex) {
    drop(index);
}

#[test]
fn logged_inserts_are_replayed_after_a_crash() {
    let dir = TempDir::new().unwrap();
    let index = create(dir.path(), RelPersistence::Permanent);
    insert_rows(&index, 0..3000);
    index.flush_wal().unwrap();
    crash(index);

    let index = reopen(dir.path(), RelPersistence::Permanent);
    assert!(index.num_blocks() > 1);
    assert_eq!(count_rows(&index), 3000);
    let summary = walk_tree(index.relation());
    assert_eq!(summary.leaf_tuples, 3000);
    assert_eq!(summary.follow_right_pages, 0);
    assert!(summary.depth >= 2);

    // the index keeps working after recovery
    insert_rows(&index, 3000..3500);
    assert_eq!(count_rows(&index), 3500);
    index.close().unwrap();
}

#[test]
fn changes_never_flushed_to_the_log_are_lost() {
    let dir = TempDir::new().unwrap();
    let index = create(dir.path(), RelPersistence::Permanent);
    insert_rows(&index, 0..100);
    index.flush_wal().unwrap();
    insert_rows(&index, 100..150);
    crash(index);

    let index = reopen(dir.path(), RelPersistence::Permanent);
    assert_eq!(count_rows(&index), 100);
}

#[test]
fn replay_skips_pages_that_already_reached_disk() {
    let dir = TempDir::new().unwrap();
    let index = create(dir.path(), RelPersistence::Permanent);
    insert_rows(&index, 0..2000);
    // pages on disk, but no checkpoint: redo starts before all of them
    index.flush().unwrap();
    crash(index);

    let index = reopen(dir.path(), RelPersistence::Permanent);
    assert_eq!(count_rows(&index), 2000);
    assert_eq!(walk_tree(index.relation()).leaf_tuples, 2000);
    crash(index);

    // recovery checkpointed, so there is nothing left to replay
    let index = reopen(dir.path(), RelPersistence::Permanent);
    assert_eq!(count_rows(&index), 2000);
}

#[test]
fn vacuum_deletions_survive_recovery() {
    let dir = TempDir::new().unwrap();
    let index = create(dir.path(), RelPersistence::Permanent);
    insert_rows(&index, 0..3000);
    index.checkpoint().unwrap();

    let stats = index
        .bulk_delete(&IndexVacuumInfo::default(), None, &|tid: ItemPointer| {
            tid.block >= 1000
        })
        .unwrap();
    assert_eq!(stats.tuples_removed, 2000.0);
    index.flush_wal().unwrap();
    crash(index);

    let index = reopen(dir.path(), RelPersistence::Permanent);
    assert_eq!(count_rows(&index), 1000);
    let summary = walk_tree(index.relation());
    assert_eq!(summary.leaf_tuples, 1000);
}

#[test]
fn bulk_built_index_reopens_without_replay() {
    let dir = TempDir::new().unwrap();
    let rows: Vec<HeapRow> = (0..5000u32)
        .map(|i| (ItemPointer::new(i, 1), vec![Some(range_datum(i as i64, i as i64 + 2))]))
        .collect();
    let (index, result) = GistIndex::build(
        dir.path(),
        "ranges",
        descriptor(),
        horizon(),
        config(RelPersistence::Permanent),
        GistOptions::default(),
        rows,
    )
    .unwrap();
    assert_eq!(result.heap_tuples, 5000.0);
    assert_eq!(result.index_tuples, 5000.0);
    let blocks = index.num_blocks();
    crash(index);

    let index = reopen(dir.path(), RelPersistence::Permanent);
    assert_eq!(index.num_blocks(), blocks);
    assert_eq!(count_rows(&index), 5000);
}

#[test]
fn index_without_wal_stamps_real_log_positions() {
    let dir = TempDir::new().unwrap();
    let config = config(RelPersistence::Permanent).with_wal_enabled(false);
    let index = GistIndex::create(
        dir.path(),
        "ranges",
        descriptor(),
        horizon(),
        config.clone(),
        GistOptions::default(),
    )
    .unwrap();
    assert!(!index.relation().needs_wal());
    insert_rows(&index, 0..1500);
    {
        let root = index.relation().read_shared(GIST_ROOT_BLKNO).unwrap();
        assert!(GistPage::new(root.data()).lsn() > GIST_BUILD_LSN);
    }
    index.close().unwrap();

    let index = GistIndex::open(
        dir.path(),
        "ranges",
        descriptor(),
        horizon(),
        config,
        GistOptions::default(),
    )
    .unwrap();
    assert_eq!(count_rows(&index), 1500);
}

#[test]
fn unlogged_counter_survives_a_clean_restart() {
    let dir = TempDir::new().unwrap();
    let index = create(dir.path(), RelPersistence::Unlogged);
    assert!(!index.relation().needs_wal());
    insert_rows(&index, 0..800);
    let before = index.relation().unlogged_lsn().unwrap();
    index.close().unwrap();

    let index = reopen(dir.path(), RelPersistence::Unlogged);
    assert!(index.relation().unlogged_lsn().unwrap() >= before);
    assert_eq!(count_rows(&index), 800);
    insert_rows(&index, 800..900);
    assert_eq!(count_rows(&index), 900);
}

#[test]
fn temporary_indexes_stay_private() {
    let dir = TempDir::new().unwrap();
    let index = create(dir.path(), RelPersistence::Temp);
    insert_rows(&index, 0..300);
    assert_eq!(count_rows(&index), 300);
    assert!(index.relation().unlogged_lsn().is_none());
    index.close().unwrap();
    assert!(!dir.path().join("wal").exists());

    let err = GistIndex::open(
        dir.path(),
        "ranges",
        descriptor(),
        horizon(),
        config(RelPersistence::Temp),
        GistOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, GistError::NotSupported(_)));
}

#[test]
fn second_build_over_existing_relation_is_refused() {
    let dir = TempDir::new().unwrap();
    create(dir.path(), RelPersistence::Permanent).close().unwrap();
    let err = GistIndex::create(
        dir.path(),
        "ranges",
        descriptor(),
        horizon(),
        config(RelPersistence::Permanent),
        GistOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, GistError::Storage(_)));
}

#[test]
fn cleanup_without_recyclable_pages_leaves_the_free_space_map_file_alone() {
    let dir = TempDir::new().unwrap();
    let xids = Arc::new(TransactionManager::new());
    let index = GistIndex::create(
        dir.path(),
        "ranges",
        descriptor(),
        xids.clone(),
        config(RelPersistence::Permanent),
        GistOptions::default(),
    )
    .unwrap();
    insert_rows(&index, 0..5_000);
    let info = IndexVacuumInfo::default();
    let deleted = index.bulk_delete(&info, None, &|_| true).unwrap();
    assert!(deleted.pages_newly_deleted > 0);
    xids.assign_xid();
    let freed = index.vacuum_cleanup(&info, None).unwrap().unwrap();
    assert!(freed.pages_free > 0);
    let on_disk = FreeSpaceMap::open(index.path()).unwrap();
    assert_eq!(on_disk.num_free_pages(), freed.pages_free as usize);

    // splits take every recorded page back out of the map
    insert_rows(&index, 0..10_000);
    assert_eq!(index.relation().fsm().num_free_pages(), 0);
    let stats = index.vacuum_cleanup(&info, None).unwrap().unwrap();
    assert_eq!(stats.pages_free, 0);
    let on_disk = FreeSpaceMap::open(index.path()).unwrap();
    assert_eq!(on_disk.num_free_pages(), freed.pages_free as usize);

    index.flush().unwrap();
    let on_disk = FreeSpaceMap::open(index.path()).unwrap();
    assert_eq!(on_disk.num_free_pages(), 0);
    index.close().unwrap();
}
