//! Drives the index through its public surface only, with an operator class
//! defined outside the crate.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tempfile::TempDir;

use quill_gist::config::{GistConfig, RelPersistence, WalConfig};
use quill_gist::error::{GistError, GistResult};
use quill_gist::index::gist::{
    BufferingMode, Consistent, Datum, Distance, GistEntry, GistIndex, GistOpclass, GistOptions,
    HeapRow, IndexDescriptor, IndexVacuumInfo, OrderByKey, ScanKey, SplitVec, StrategyNumber,
    SubtypeId, TidBitmap,
};
use quill_gist::storage::page::ItemPointer;
use quill_gist::transaction::{TransactionHorizon, TransactionManager};

const OVERLAPS: StrategyNumber = 3;
const NEAREST: StrategyNumber = 15;

/// Closed `i32` intervals; the query of `NEAREST` is a single point.
struct SpanOps;

fn span(lo: i32, hi: i32) -> Datum {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i32_le(lo.min(hi));
    buf.put_i32_le(lo.max(hi));
    buf.freeze()
}

fn bounds(datum: &Datum) -> (i32, i32) {
    let mut buf = datum.clone();
    (buf.get_i32_le(), buf.get_i32_le())
}

impl GistOpclass for SpanOps {
    fn name(&self) -> &str {
        "span_ops"
    }

    fn consistent(
        &self,
        entry: &GistEntry,
        query: &Datum,
        strategy: StrategyNumber,
        _subtype: Option<SubtypeId>,
    ) -> GistResult<Consistent> {
        let (lo, hi) = bounds(&entry.key);
        let (qlo, qhi) = bounds(query);
        match strategy {
            OVERLAPS => Ok(Consistent::exact(lo <= qhi && qlo <= hi)),
            other => Err(GistError::OpclassContractViolation(format!(
                "span_ops has no strategy {}",
                other
            ))),
        }
    }

    fn union(&self, entries: &[GistEntry]) -> GistResult<Datum> {
        let (lo, hi) = entries
            .iter()
            .map(|e| bounds(&e.key))
            .fold((i32::MAX, i32::MIN), |(lo, hi), (l, h)| (lo.min(l), hi.max(h)));
        Ok(span(lo, hi))
    }

    fn penalty(&self, orig: &GistEntry, new: &GistEntry) -> GistResult<f32> {
        let (lo, hi) = bounds(&orig.key);
        let (nlo, nhi) = bounds(&new.key);
        let grown = (hi.max(nhi) as i64 - lo.min(nlo) as i64) - (hi as i64 - lo as i64);
        Ok(grown as f32)
    }

    fn picksplit(&self, entries: &[GistEntry], split: &mut SplitVec) -> GistResult<()> {
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by_key(|&i| {
            let (lo, hi) = bounds(&entries[i].key);
            lo as i64 + hi as i64
        });
        let half = order.len() / 2;
        split.left = order[..half].to_vec();
        split.right = order[half..].to_vec();
        let side = |idx: &[usize]| {
            let keys: Vec<GistEntry> = idx.iter().map(|&i| entries[i].clone()).collect();
            self.union(&keys)
        };
        split.ldatum = side(&split.left)?;
        split.rdatum = side(&split.right)?;
        split.ldatum_exists = false;
        split.rdatum_exists = false;
        Ok(())
    }

    fn same(&self, a: &Datum, b: &Datum) -> GistResult<bool> {
        Ok(bounds(a) == bounds(b))
    }

    fn has_distance(&self) -> bool {
        true
    }

    fn distance(
        &self,
        entry: &GistEntry,
        query: &Datum,
        _strategy: StrategyNumber,
        _subtype: Option<SubtypeId>,
    ) -> GistResult<Distance> {
        let (lo, hi) = bounds(&entry.key);
        let (point, _) = bounds(query);
        let gap = if point < lo {
            lo as f64 - point as f64
        } else if point > hi {
            point as f64 - hi as f64
        } else {
            0.0
        };
        Ok(Distance::exact(gap))
    }
}

fn descriptor() -> IndexDescriptor {
    IndexDescriptor::new(vec![Arc::new(SpanOps) as Arc<dyn GistOpclass>])
}

fn horizon() -> Arc<dyn TransactionHorizon> {
    Arc::new(TransactionManager::new())
}

fn config() -> GistConfig {
    GistConfig::default()
        .with_persistence(RelPersistence::Permanent)
        .with_wal(WalConfig::default().with_sync_on_flush(false))
}

fn rows(n: i32) -> Vec<HeapRow> {
    (0..n)
        .map(|i| {
            (
                ItemPointer::new(i as u32, 1),
                vec![Some(span(i * 3, i * 3 + 1))],
            )
        })
        .collect()
}

#[test]
fn build_search_and_reopen() {
    let dir = TempDir::new().unwrap();
    let options = GistIndex::parse_options(["fillfactor=70", "buffering=on"]).unwrap();
    assert_eq!(options.buffering, BufferingMode::On);

    let (index, result) = GistIndex::build(
        dir.path(),
        "spans",
        descriptor(),
        horizon(),
        config(),
        options,
        rows(20_000),
    )
    .unwrap();
    assert_eq!(result.index_tuples, 20_000.0);
    assert!(index.num_blocks() > 1);

    let mut bitmap = TidBitmap::new();
    {
        let mut scan = index.begin_scan();
        scan.rescan(
            vec![ScanKey::operator(0, OVERLAPS, Some(span(300, 329)))],
            vec![],
        )
        .unwrap();
        assert_eq!(scan.get_bitmap(&mut bitmap).unwrap(), 10);
        scan.end();
    }
    assert_eq!(bitmap.len(), 10);
    for (tid, recheck) in bitmap.iter() {
        assert!((100..110).contains(&tid.block));
        assert!(!recheck);
    }
    index.close().unwrap();

    let index = GistIndex::open(
        dir.path(),
        "spans",
        descriptor(),
        horizon(),
        config(),
        GistOptions::default(),
    )
    .unwrap();
    let mut scan = index.begin_scan();
    scan.rescan(
        vec![],
        vec![OrderByKey::new(0, NEAREST, Some(span(30_001, 30_001)))],
    )
    .unwrap();
    let nearest: Vec<u32> = scan
        .by_ref()
        .take(3)
        .map(|res| res.unwrap().tid.block)
        .collect();
    assert_eq!(nearest, vec![10_000, 10_001, 9_999]);
}

#[test]
fn inserts_and_vacuum_through_the_facade() {
    let dir = TempDir::new().unwrap();
    let index = GistIndex::create(
        dir.path(),
        "spans",
        descriptor(),
        horizon(),
        config(),
        GistOptions::default(),
    )
    .unwrap();
    for (tid, values) in rows(5_000) {
        index.insert(&values, tid).unwrap();
    }
    let deleted = index
        .bulk_delete(&IndexVacuumInfo::default(), None, &|tid: ItemPointer| {
            tid.block % 2 == 1
        })
        .unwrap();
    assert_eq!(deleted.tuples_removed, 2_500.0);
    let stats = index
        .vacuum_cleanup(&IndexVacuumInfo::default(), Some(deleted))
        .unwrap()
        .unwrap();
    assert_eq!(stats.num_index_tuples, 2_500.0);

    let survivors = {
        let mut scan = index.begin_scan();
        scan.rescan(
            vec![ScanKey::operator(0, OVERLAPS, Some(span(i32::MIN, i32::MAX)))],
            vec![],
        )
        .unwrap();
        scan.map(|res| res.unwrap().tid.block).collect::<Vec<_>>()
    };
    assert_eq!(survivors.len(), 2_500);
    assert!(survivors.iter().all(|block| block % 2 == 0));
    index.close().unwrap();
}

#[test]
fn bad_options_are_reported() {
    let err = GistIndex::parse_options(["fillfactor=5"]).unwrap_err();
    assert!(matches!(err, GistError::InvalidOption { .. }));
    let err = GistIndex::parse_options(["buffering=sometimes"]).unwrap_err();
    assert!(matches!(err, GistError::InvalidOption { .. }));
}
