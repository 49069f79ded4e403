//! Index scans: bitmap, plain (a leaf page at a time) and ordered k-NN.
//!
//! Every scan shape drives the same queue. Plain and bitmap scans only ever
//! queue pages; ordered scans also queue matching heap tuples so that the
//! smallest distance vector always comes out first.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::debug;

use crate::error::{GistError, GistResult};
use crate::index::gist::opclass::{Datum, StrategyNumber, SubtypeId};
use crate::index::gist::page::{GistPage, GIST_ROOT_BLKNO};
use crate::index::gist::relation::{CancelToken, GistRelation};
use crate::index::gist::tuple::IndexTuple;
use crate::recovery::Lsn;
use crate::storage::page::{
    BlockNumber, ItemPointer, OffsetNumber, FIRST_OFFSET_NUMBER, INVALID_BLOCK_NUMBER,
};
use crate::utils::pairing_heap::PairingHeap;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanKeyKind {
    /// `column <op> argument`. A null argument can never be satisfied.
    Operator {
        strategy: StrategyNumber,
        subtype: Option<SubtypeId>,
        argument: Option<Datum>,
    },
    IsNull,
    IsNotNull,
}

/// One qualifier; all keys of a scan are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanKey {
    pub attno: usize,
    pub kind: ScanKeyKind,
}

impl ScanKey {
    pub fn operator(attno: usize, strategy: StrategyNumber, argument: Option<Datum>) -> Self {
        Self {
            attno,
            kind: ScanKeyKind::Operator {
                strategy,
                subtype: None,
                argument,
            },
        }
    }

    /// Tags an operator key with the type of its argument.
    pub fn with_subtype(mut self, subtype: SubtypeId) -> Self {
        if let ScanKeyKind::Operator { subtype: s, .. } = &mut self.kind {
            *s = Some(subtype);
        }
        self
    }

    pub fn is_null(attno: usize) -> Self {
        Self {
            attno,
            kind: ScanKeyKind::IsNull,
        }
    }

    pub fn is_not_null(attno: usize) -> Self {
        Self {
            attno,
            kind: ScanKeyKind::IsNotNull,
        }
    }
}

/// `ORDER BY column <op> argument`, evaluated with the opclass distance.
#[derive(derive_new::new, Debug, Clone, PartialEq)]
pub struct OrderByKey {
    pub attno: usize,
    pub strategy: StrategyNumber,
    pub argument: Option<Datum>,
    #[new(default)]
    pub subtype: Option<SubtypeId>,
}

impl OrderByKey {
    pub fn with_subtype(mut self, subtype: SubtypeId) -> Self {
        self.subtype = Some(subtype);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ScanDistance {
    value: f64,
    is_null: bool,
}

impl ScanDistance {
    const NULL: ScanDistance = ScanDistance {
        value: 0.0,
        is_null: true,
    };

    fn value(value: f64) -> Self {
        Self {
            value,
            is_null: false,
        }
    }
}

/// Nulls sort first and NaN after every number.
fn cmp_distance(a: &ScanDistance, b: &ScanDistance) -> Ordering {
    match (a.is_null, b.is_null) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => match (a.value.is_nan(), b.value.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a.value.partial_cmp(&b.value).unwrap_or(Ordering::Equal),
        },
    }
}

/// A row returned by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub tid: ItemPointer,
    /// The quals must be rechecked against the heap row.
    pub recheck: bool,
    /// `distances` are lower bounds; the caller must re-sort on exact ones.
    pub recheck_distances: bool,
    /// One per order-by key; `None` for a null distance.
    pub distances: Vec<Option<f64>>,
    /// Reconstructed column values for index-only scans.
    pub values: Option<Vec<Option<Datum>>>,
}

/// Heap TIDs collected by a bitmap scan, each with its recheck flag.
#[derive(Debug, Default, Clone)]
pub struct TidBitmap {
    entries: BTreeMap<ItemPointer, bool>,
}

impl TidBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tid: ItemPointer, recheck: bool) {
        *self.entries.entry(tid).or_insert(false) |= recheck;
    }

    pub fn contains(&self, tid: &ItemPointer) -> bool {
        self.entries.contains_key(tid)
    }

    pub fn recheck(&self, tid: &ItemPointer) -> Option<bool> {
        self.entries.get(tid).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemPointer, bool)> + '_ {
        self.entries.iter().map(|(tid, recheck)| (*tid, *recheck))
    }
}

#[derive(Debug)]
enum SearchItemKind {
    Page { block: BlockNumber, parent_lsn: Lsn },
    Heap(ScanResult),
}

#[derive(Debug)]
struct SearchItem {
    distances: Vec<ScanDistance>,
    kind: SearchItemKind,
    /// Distance of a page from the root; deeper pages come out first on ties.
    depth: u32,
    /// Insertion order, the last tie-break.
    seq: u64,
}

impl Ord for SearchItem {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.distances.iter().zip(&other.distances) {
            match cmp_distance(a, b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        match (&self.kind, &other.kind) {
            (SearchItemKind::Heap(_), SearchItemKind::Page { .. }) => return Ordering::Less,
            (SearchItemKind::Page { .. }, SearchItemKind::Heap(_)) => return Ordering::Greater,
            (SearchItemKind::Page { .. }, SearchItemKind::Page { .. }) => {
                match other.depth.cmp(&self.depth) {
                    Ordering::Equal => {}
                    ord => return ord,
                }
            }
            _ => {}
        }
        self.seq.cmp(&other.seq)
    }
}

impl PartialOrd for SearchItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SearchItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SearchItem {}

/// A leaf match waiting to be returned by a plain scan.
#[derive(Debug)]
struct PageMatch {
    tid: ItemPointer,
    recheck: bool,
    offset: OffsetNumber,
    values: Option<Vec<Option<Datum>>>,
}

struct KeyTest {
    recheck: bool,
    recheck_distances: bool,
    distances: Vec<ScanDistance>,
}

pub struct GistScan<'a> {
    rel: &'a GistRelation,
    keys: Vec<ScanKey>,
    order_by: Vec<OrderByKey>,
    /// False when some key can never match.
    qual_ok: bool,
    want_itup: bool,
    ignore_killed_tuples: bool,
    first_call: bool,
    queue: PairingHeap<SearchItem>,
    next_seq: u64,

    page_data: Vec<PageMatch>,
    cur_page_data: usize,
    cur_block: BlockNumber,
    /// LSN of `cur_block` when it was read, guarding LP_DEAD hints.
    cur_page_lsn: Lsn,
    killed: Vec<OffsetNumber>,
    kill_prior: bool,
    cancel: CancelToken,
}

impl std::fmt::Debug for GistScan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GistScan")
            .field("index", &self.rel.name())
            .field("keys", &self.keys)
            .field("order_by", &self.order_by)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl<'a> GistScan<'a> {
    pub fn new(rel: &'a GistRelation) -> Self {
        Self {
            rel,
            keys: Vec::new(),
            order_by: Vec::new(),
            qual_ok: true,
            want_itup: false,
            ignore_killed_tuples: true,
            first_call: true,
            queue: PairingHeap::new(),
            next_seq: 0,
            page_data: Vec::new(),
            cur_page_data: 0,
            cur_block: INVALID_BLOCK_NUMBER,
            cur_page_lsn: 0,
            killed: Vec::new(),
            kill_prior: false,
            cancel: rel.cancel_token().clone(),
        }
    }

    /// Reconstruct column values for every returned row.
    pub fn set_want_itup(&mut self, want: bool) {
        self.want_itup = want;
    }

    /// Whether LP_DEAD tuples are skipped. On by default.
    pub fn set_ignore_killed_tuples(&mut self, ignore: bool) {
        self.ignore_killed_tuples = ignore;
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Restarts the scan with new keys.
    pub fn rescan(&mut self, keys: Vec<ScanKey>, order_by: Vec<OrderByKey>) -> GistResult<()> {
        let state = self.rel.state();
        for key in &keys {
            if key.attno >= state.nkeys() {
                return Err(GistError::NotSupported(format!(
                    "scan key on column {} of index \"{}\", which has {} key columns",
                    key.attno,
                    self.rel.name(),
                    state.nkeys()
                )));
            }
        }
        for key in &order_by {
            if key.attno >= state.nkeys() {
                return Err(GistError::NotSupported(format!(
                    "order by column {} of index \"{}\", which has {} key columns",
                    key.attno,
                    self.rel.name(),
                    state.nkeys()
                )));
            }
            let opclass = state.opclass(key.attno);
            if !opclass.has_distance() {
                return Err(GistError::NotSupported(format!(
                    "missing support function distance for attribute {} of index \"{}\"",
                    key.attno + 1,
                    self.rel.name()
                )));
            }
        }

        self.qual_ok = !keys.iter().any(|k| {
            matches!(
                k.kind,
                ScanKeyKind::Operator { argument: None, .. }
            )
        });
        self.keys = keys;
        self.order_by = order_by;
        self.first_call = true;
        self.queue.clear();
        self.next_seq = 0;
        self.page_data.clear();
        self.cur_page_data = 0;
        self.cur_block = INVALID_BLOCK_NUMBER;
        self.killed.clear();
        self.kill_prior = false;
        Ok(())
    }

    /// Marks the row returned last as dead for every snapshot. The hint is
    /// written when the scan leaves the leaf page.
    pub fn kill_prior_tuple(&mut self) {
        self.kill_prior = true;
    }

    /// Collects every matching heap TID into `bitmap`; returns how many
    /// were added.
    pub fn get_bitmap(&mut self, bitmap: &mut TidBitmap) -> GistResult<u64> {
        if !self.qual_ok {
            return Ok(0);
        }
        self.queue.clear();
        self.page_data.clear();
        self.cur_page_data = 0;

        let mut ntids = 0;
        let root = self.root_distances();
        ntids += self.scan_page(GIST_ROOT_BLKNO, 0, &root, 0, Some(&mut *bitmap))?;
        while let Some(item) = self.queue.pop() {
            self.cancel.check()?;
            if let SearchItemKind::Page { block, parent_lsn } = item.kind {
                ntids +=
                    self.scan_page(block, parent_lsn, &item.distances, item.depth, Some(&mut *bitmap))?;
            }
        }
        Ok(ntids)
    }

    /// Next matching row, or `None` when the scan is exhausted.
    pub fn get_tuple(&mut self) -> GistResult<Option<ScanResult>> {
        if !self.qual_ok {
            return Ok(None);
        }
        if self.first_call {
            self.first_call = false;
            self.queue.clear();
            self.page_data.clear();
            self.cur_page_data = 0;
            self.cur_block = GIST_ROOT_BLKNO;
            let root = self.root_distances();
            self.scan_page(GIST_ROOT_BLKNO, 0, &root, 0, None)?;
        }

        if !self.order_by.is_empty() {
            self.kill_prior = false;
            return self.next_nearest();
        }

        loop {
            if self.cur_page_data < self.page_data.len() {
                if self.kill_prior && self.cur_page_data > 0 {
                    self.killed.push(self.page_data[self.cur_page_data - 1].offset);
                }
                self.kill_prior = false;
                let m = &mut self.page_data[self.cur_page_data];
                self.cur_page_data += 1;
                return Ok(Some(ScanResult {
                    tid: m.tid,
                    recheck: m.recheck,
                    recheck_distances: false,
                    distances: Vec::new(),
                    values: m.values.take(),
                }));
            }

            if self.kill_prior && self.cur_page_data > 0 && self.cur_page_data == self.page_data.len() {
                self.killed.push(self.page_data[self.cur_page_data - 1].offset);
            }
            self.kill_prior = false;

            loop {
                if self.cur_block != INVALID_BLOCK_NUMBER && !self.killed.is_empty() {
                    self.kill_items()?;
                }
                let Some(item) = self.queue.pop() else {
                    return Ok(None);
                };
                self.cancel.check()?;
                if let SearchItemKind::Page { block, parent_lsn } = item.kind {
                    self.cur_block = block;
                    self.scan_page(block, parent_lsn, &item.distances, item.depth, None)?;
                }
                if !self.page_data.is_empty() {
                    break;
                }
            }
        }
    }

    /// Ends the scan, releasing the queue.
    pub fn end(mut self) {
        self.queue.clear();
        self.page_data.clear();
    }

    fn root_distances(&self) -> Vec<ScanDistance> {
        vec![ScanDistance::value(0.0); self.order_by.len()]
    }

    fn next_nearest(&mut self) -> GistResult<Option<ScanResult>> {
        while let Some(item) = self.queue.pop() {
            match item.kind {
                SearchItemKind::Heap(result) => return Ok(Some(result)),
                SearchItemKind::Page { block, parent_lsn } => {
                    self.cancel.check()?;
                    self.scan_page(block, parent_lsn, &item.distances, item.depth, None)?;
                }
            }
        }
        Ok(None)
    }

    fn push(&mut self, distances: Vec<ScanDistance>, kind: SearchItemKind, depth: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(SearchItem {
            distances,
            kind,
            depth,
            seq,
        });
    }

    /// Visits one page: follows a concurrent split to the right, then tests
    /// every tuple and routes matches to `bitmap`, the page buffer or the
    /// queue depending on the scan shape.
    fn scan_page(
        &mut self,
        block: BlockNumber,
        parent_lsn: Lsn,
        distances: &[ScanDistance],
        depth: u32,
        mut bitmap: Option<&mut TidBitmap>,
    ) -> GistResult<u64> {
        let guard = self.rel.read_shared(block)?;
        let page = GistPage::new(guard.data());
        page.check(block)?;

        if parent_lsn != 0
            && (page.follow_right() || parent_lsn < page.nsn())
            && page.rightlink() != INVALID_BLOCK_NUMBER
        {
            // split after we read the parent: the right half has no
            // downlink we could have seen
            self.push(
                distances.to_vec(),
                SearchItemKind::Page {
                    block: page.rightlink(),
                    parent_lsn,
                },
                depth,
            );
        }

        if page.is_deleted() {
            return Ok(0);
        }

        if bitmap.is_none() && self.order_by.is_empty() {
            self.page_data.clear();
            self.cur_page_data = 0;
        }
        let page_lsn = guard.lsn();
        self.cur_page_lsn = page_lsn;
        let is_leaf = page.is_leaf();

        let mut ntids = 0;
        for off in FIRST_OFFSET_NUMBER..=page.max_offset() {
            if self.ignore_killed_tuples && page.item_id(off).is_dead() {
                continue;
            }
            let tuple = page.tuple(off);
            let Some(test) = self.key_test(&tuple, block, off, is_leaf)? else {
                continue;
            };

            if is_leaf {
                if let Some(bitmap) = bitmap.as_deref_mut() {
                    bitmap.add(tuple.tid(), test.recheck);
                    ntids += 1;
                    continue;
                }
                let values = if self.want_itup {
                    Some(self.rel.state().fetch_tuple(&tuple)?)
                } else {
                    None
                };
                if self.order_by.is_empty() {
                    self.page_data.push(PageMatch {
                        tid: tuple.tid(),
                        recheck: test.recheck,
                        offset: off,
                        values,
                    });
                } else {
                    let result = ScanResult {
                        tid: tuple.tid(),
                        recheck: test.recheck,
                        recheck_distances: test.recheck_distances,
                        distances: test
                            .distances
                            .iter()
                            .map(|d| (!d.is_null).then_some(d.value))
                            .collect(),
                        values,
                    };
                    self.push(test.distances, SearchItemKind::Heap(result), depth + 1);
                }
            } else {
                self.push(
                    test.distances,
                    SearchItemKind::Page {
                        block: IndexTuple::block_of(tuple.as_bytes()),
                        parent_lsn: page_lsn,
                    },
                    depth + 1,
                );
            }
        }
        Ok(ntids)
    }

    /// Applies every scan key to `tuple` and, when it passes, computes its
    /// order-by distances.
    fn key_test(
        &self,
        tuple: &IndexTuple,
        block: BlockNumber,
        off: OffsetNumber,
        is_leaf: bool,
    ) -> GistResult<Option<KeyTest>> {
        if tuple.is_invalid() {
            if is_leaf {
                return Err(GistError::corrupted(
                    block,
                    "invalid GiST tuple found on leaf page",
                ));
            }
            // always descend below a downlink left by an unfinished split
            return Ok(Some(KeyTest {
                recheck: false,
                recheck_distances: false,
                distances: vec![ScanDistance::value(f64::NEG_INFINITY); self.order_by.len()],
            }));
        }

        let state = self.rel.state();
        let datums = tuple.attrs(state.nkeys())?;
        let mut recheck = false;
        for key in &self.keys {
            let datum = &datums[key.attno];
            match &key.kind {
                // a null key on an internal page means the whole subtree is null
                ScanKeyKind::IsNull => {
                    if is_leaf && datum.is_some() {
                        return Ok(None);
                    }
                }
                ScanKeyKind::IsNotNull => {
                    if datum.is_none() {
                        return Ok(None);
                    }
                }
                ScanKeyKind::Operator {
                    strategy,
                    subtype,
                    argument,
                } => {
                    let (Some(query), Some(_)) = (argument, datum) else {
                        return Ok(None);
                    };
                    let Some(entry) =
                        state.dentry_init(key.attno, datum.clone(), block, off, is_leaf)?
                    else {
                        return Ok(None);
                    };
                    let c = state
                        .opclass(key.attno)
                        .consistent(&entry, query, *strategy, *subtype)?;
                    if !c.matched {
                        return Ok(None);
                    }
                    recheck |= c.recheck;
                }
            }
        }

        let mut recheck_distances = false;
        let mut distances = Vec::with_capacity(self.order_by.len());
        for key in &self.order_by {
            let datum = &datums[key.attno];
            let (Some(query), Some(_)) = (&key.argument, datum) else {
                distances.push(ScanDistance::NULL);
                continue;
            };
            let Some(entry) = state.dentry_init(key.attno, datum.clone(), block, off, is_leaf)?
            else {
                distances.push(ScanDistance::NULL);
                continue;
            };
            let d = state
                .opclass(key.attno)
                .distance(&entry, query, key.strategy, key.subtype)?;
            recheck_distances |= d.recheck;
            distances.push(ScanDistance::value(d.value));
        }

        Ok(Some(KeyTest {
            recheck,
            recheck_distances,
            distances,
        }))
    }

    /// Sets LP_DEAD on the killed offsets of the current leaf, but only if
    /// the page has not changed since it was read.
    fn kill_items(&mut self) -> GistResult<()> {
        let block = self.cur_block;
        let mut guard = self.rel.read_exclusive(block)?;
        GistPage::new(guard.data()).check(block)?;
        if guard.lsn() != self.cur_page_lsn {
            debug!(
                "index \"{}\" block {} changed since it was read, dropping {} dead hints",
                self.rel.name(),
                block,
                self.killed.len()
            );
            self.killed.clear();
            return Ok(());
        }

        let mut killed_something = false;
        {
            let mut page = GistPage::new(guard.data_mut());
            if page.is_leaf() {
                for &off in &self.killed {
                    if off >= FIRST_OFFSET_NUMBER && off <= page.max_offset() {
                        page.mark_dead(off);
                        killed_something = true;
                    }
                }
                if killed_something {
                    page.set_has_garbage(true);
                }
            }
        }
        if killed_something {
            guard.mark_dirty_hint();
        }
        self.killed.clear();
        Ok(())
    }
}

impl Iterator for GistScan<'_> {
    type Item = GistResult<ScanResult>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_tuple().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_item(distances: &[Option<f64>], depth: u32, seq: u64) -> SearchItem {
        SearchItem {
            distances: distances
                .iter()
                .map(|d| match d {
                    Some(v) => ScanDistance::value(*v),
                    None => ScanDistance::NULL,
                })
                .collect(),
            kind: SearchItemKind::Page {
                block: seq as BlockNumber,
                parent_lsn: 0,
            },
            depth,
            seq,
        }
    }

    fn heap_item(distance: f64, seq: u64) -> SearchItem {
        SearchItem {
            distances: vec![ScanDistance::value(distance)],
            kind: SearchItemKind::Heap(ScanResult {
                tid: ItemPointer::new(seq as u32, 1),
                recheck: false,
                recheck_distances: false,
                distances: vec![Some(distance)],
                values: None,
            }),
            depth: 0,
            seq,
        }
    }

    fn order(items: Vec<SearchItem>) -> Vec<u64> {
        let mut heap = PairingHeap::new();
        for item in items {
            heap.push(item);
        }
        std::iter::from_fn(|| heap.pop()).map(|i| i.seq).collect()
    }

    #[test]
    fn nulls_first_nan_last() {
        let got = order(vec![
            page_item(&[Some(f64::NAN)], 1, 0),
            page_item(&[Some(3.0)], 1, 1),
            page_item(&[None], 1, 2),
            page_item(&[Some(f64::NEG_INFINITY)], 1, 3),
        ]);
        assert_eq!(got, vec![2, 3, 1, 0]);
    }

    #[test]
    fn heap_tuples_then_deeper_pages_then_fifo() {
        let got = order(vec![
            page_item(&[Some(1.0)], 1, 0),
            page_item(&[Some(1.0)], 3, 1),
            heap_item(1.0, 2),
            page_item(&[Some(1.0)], 3, 3),
            page_item(&[Some(0.5)], 1, 4),
        ]);
        assert_eq!(got, vec![4, 2, 1, 3, 0]);
    }

    #[test]
    fn later_order_by_columns_break_ties() {
        let got = order(vec![
            page_item(&[Some(1.0), Some(9.0)], 1, 0),
            page_item(&[Some(1.0), Some(2.0)], 1, 1),
            page_item(&[Some(0.0), Some(100.0)], 1, 2),
        ]);
        assert_eq!(got, vec![2, 1, 0]);
    }

    #[test]
    fn bitmap_ors_recheck_flags() {
        let mut bitmap = TidBitmap::new();
        let tid = ItemPointer::new(4, 2);
        bitmap.add(tid, false);
        bitmap.add(tid, true);
        bitmap.add(ItemPointer::new(1, 1), false);
        assert_eq!(bitmap.len(), 2);
        assert_eq!(bitmap.recheck(&tid), Some(true));
        assert_eq!(bitmap.iter().next(), Some((ItemPointer::new(1, 1), false)));
    }
}
