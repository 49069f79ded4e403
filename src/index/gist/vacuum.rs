//! Vacuum: removes dead heap references, then unlinks leaves left empty.
//!
//! The first pass reads every block in physical order and remembers which
//! pages are internal and which leaves became empty. The second pass visits
//! the internal pages again and deletes the empty leaves they point to.

use log::{debug, warn};

use crate::buffer::WritePageGuard;
use crate::error::GistResult;
use crate::index::gist::page::{GistPage, GIST_ROOT_BLKNO};
use crate::index::gist::relation::GistRelation;
use crate::index::gist::xlog::{GistWalRecord, PageDeleteRecord, PageUpdateRecord};
use crate::recovery::Lsn;
use crate::storage::page::{
    BlockNumber, ItemPointer, OffsetNumber, FIRST_OFFSET_NUMBER, INVALID_BLOCK_NUMBER,
};
use crate::utils::integer_set::IntegerSet;

/// Statistics accumulated across bulk delete and cleanup.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct IndexBulkDeleteResult {
    pub num_pages: BlockNumber,
    /// `num_index_tuples` is an estimate rather than an exact count.
    pub estimated_count: bool,
    pub num_index_tuples: f64,
    pub tuples_removed: f64,
    pub pages_newly_deleted: BlockNumber,
    pub pages_deleted: BlockNumber,
    pub pages_free: BlockNumber,
}

/// What the caller knows about the heap being vacuumed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexVacuumInfo {
    pub analyze_only: bool,
    /// `num_heap_tuples` is an estimate.
    pub estimated_count: bool,
    pub num_heap_tuples: f64,
}

impl Default for IndexVacuumInfo {
    fn default() -> Self {
        Self {
            analyze_only: false,
            estimated_count: true,
            num_heap_tuples: 0.0,
        }
    }
}

/// Returns true for heap TIDs whose index entries must go.
pub type BulkDeleteCallback<'a> = &'a dyn Fn(ItemPointer) -> bool;

struct VacState<'a> {
    rel: &'a GistRelation,
    stats: &'a mut IndexBulkDeleteResult,
    callback: Option<BulkDeleteCallback<'a>>,
    /// Splits stamped with a later NSN happened during this pass.
    start_nsn: Lsn,
    internal_pages: IntegerSet,
    empty_leaves: IntegerSet,
}

/// Removes every index entry whose heap TID `callback` reports dead.
pub fn bulk_delete(
    rel: &GistRelation,
    info: &IndexVacuumInfo,
    stats: Option<IndexBulkDeleteResult>,
    callback: BulkDeleteCallback<'_>,
) -> GistResult<IndexBulkDeleteResult> {
    let mut stats = stats.unwrap_or_default();
    vacuum_scan(rel, info, &mut stats, Some(callback))?;
    Ok(stats)
}

/// Post-vacuum cleanup. Without a preceding bulk delete this runs a full
/// pass of its own so that recyclable pages still reach the free space map.
pub fn vacuum_cleanup(
    rel: &GistRelation,
    info: &IndexVacuumInfo,
    stats: Option<IndexBulkDeleteResult>,
) -> GistResult<Option<IndexBulkDeleteResult>> {
    if info.analyze_only {
        return Ok(stats);
    }
    let mut stats = match stats {
        Some(stats) => stats,
        None => {
            let mut stats = IndexBulkDeleteResult::default();
            vacuum_scan(rel, info, &mut stats, None)?;
            stats
        }
    };
    // concurrent splits can make us count a tuple twice
    if !info.estimated_count && stats.num_index_tuples > info.num_heap_tuples {
        stats.num_index_tuples = info.num_heap_tuples;
    }
    Ok(Some(stats))
}

fn vacuum_scan(
    rel: &GistRelation,
    _info: &IndexVacuumInfo,
    stats: &mut IndexBulkDeleteResult,
    callback: Option<BulkDeleteCallback<'_>>,
) -> GistResult<()> {
    stats.estimated_count = false;
    stats.num_index_tuples = 0.0;
    stats.pages_deleted = 0;
    stats.pages_free = 0;

    let start_nsn = rel.insert_lsn()?;
    let mut vstate = VacState {
        rel,
        stats,
        callback,
        start_nsn,
        internal_pages: IntegerSet::new(),
        empty_leaves: IntegerSet::new(),
    };

    // pages added by concurrent splits while we scan are picked up by
    // re-reading the length after each sweep
    let mut block = GIST_ROOT_BLKNO;
    let mut num_pages;
    loop {
        num_pages = {
            let disk = rel.bpm().disk_manager();
            let _extension = disk.extension_lock();
            disk.num_blocks()
        };
        if block >= num_pages {
            break;
        }
        while block < num_pages {
            rel.check_interrupts()?;
            vacuum_page(&mut vstate, block, block)?;
            block += 1;
        }
    }

    if vstate.stats.pages_free > 0 {
        debug!(
            "index \"{}\": {} recyclable pages, vacuuming free space map",
            rel.name(),
            vstate.stats.pages_free
        );
        rel.fsm().vacuum()?;
    }
    vstate.stats.num_pages = num_pages;

    delete_empty_pages(&mut vstate)
}

fn vacuum_page(
    vstate: &mut VacState<'_>,
    block: BlockNumber,
    orig_block: BlockNumber,
) -> GistResult<()> {
    let rel = vstate.rel;
    let mut block = block;
    loop {
        let mut recurse_to = INVALID_BLOCK_NUMBER;
        let mut guard = rel.read_exclusive(block)?;

        let (recyclable, deleted, leaf) = {
            let page = GistPage::new(guard.data());
            (
                page.is_recyclable(rel.horizon().as_ref()),
                !page.is_new() && page.is_deleted(),
                !page.is_new() && page.is_leaf(),
            )
        };

        if recyclable {
            rel.fsm().record_free_page(block);
            vstate.stats.pages_deleted += 1;
            vstate.stats.pages_free += 1;
        } else if deleted {
            vstate.stats.pages_deleted += 1;
        } else if leaf {
            let (todelete, rightlink, moved_left) = {
                let page = GistPage::new(guard.data());
                let moved = (page.follow_right() || vstate.start_nsn < page.nsn())
                    && page.rightlink() != INVALID_BLOCK_NUMBER
                    && page.rightlink() < orig_block;
                let todelete: Vec<OffsetNumber> = match vstate.callback {
                    Some(callback) => (FIRST_OFFSET_NUMBER..=page.max_offset())
                        .filter(|&off| callback(page.tuple(off).tid()))
                        .collect(),
                    None => Vec::new(),
                };
                (todelete, page.rightlink(), moved)
            };
            if moved_left {
                // a split since we started moved tuples to an earlier block
                recurse_to = rightlink;
            }

            if !todelete.is_empty() {
                delete_tuples(rel, &mut guard, todelete.clone())?;
                vstate.stats.tuples_removed += todelete.len() as f64;
            }

            let nremain = GistPage::new(guard.data()).max_offset();
            if nremain == 0 {
                // only ascending block numbers may go into the set
                if block == orig_block {
                    vstate.empty_leaves.add_member(block as u64)?;
                }
            } else {
                vstate.stats.num_index_tuples += nremain as f64;
            }
        } else {
            let invalid = {
                let page = GistPage::new(guard.data());
                (FIRST_OFFSET_NUMBER..=page.max_offset()).any(|off| page.tuple(off).is_invalid())
            };
            if invalid {
                warn!(
                    "index \"{}\" contains an inner tuple marked as invalid on block {}. \
                     This is caused by an incomplete page split at crash recovery. Please REINDEX it.",
                    rel.name(),
                    block
                );
            }
            if block == orig_block {
                vstate.internal_pages.add_member(block as u64)?;
            }
        }
        drop(guard);

        if recurse_to == INVALID_BLOCK_NUMBER {
            return Ok(());
        }
        block = recurse_to;
    }
}

fn delete_tuples(
    rel: &GistRelation,
    guard: &mut WritePageGuard,
    todelete: Vec<OffsetNumber>,
) -> GistResult<()> {
    let block = guard.block();
    {
        let mut page = GistPage::new(guard.data_mut());
        page.multi_delete(&todelete)?;
        page.set_tuples_deleted(true);
    }
    guard.mark_dirty();
    let lsn = rel.log_or_fake(|| {
        GistWalRecord::PageUpdate(PageUpdateRecord {
            block,
            todelete,
            tuples: Vec::new(),
            left_child: None,
        })
    })?;
    guard.set_lsn(lsn);
    Ok(())
}

fn delete_empty_pages(vstate: &mut VacState<'_>) -> GistResult<()> {
    let rel = vstate.rel;
    let mut empty_remaining = vstate.empty_leaves.num_entries();
    let internal: Vec<u64> = vstate.internal_pages.iter().collect();

    for parent in internal {
        if empty_remaining == 0 {
            break;
        }
        let parent = parent as BlockNumber;

        let (todelete, leaves) = {
            let guard = rel.read_shared(parent)?;
            let page = GistPage::new(guard.data());
            if page.is_new() || page.is_deleted() || page.is_leaf() {
                // no longer internal; nothing to unlink here
                continue;
            }
            let maxoff = page.max_offset();
            let mut todelete = Vec::new();
            let mut leaves = Vec::new();
            let mut off = FIRST_OFFSET_NUMBER;
            while off <= maxoff && (todelete.len() as OffsetNumber) < maxoff - 1 {
                let child = page.downlink_block(off);
                if vstate.empty_leaves.is_member(child as u64) {
                    todelete.push(off);
                    leaves.push(child);
                }
                off += 1;
            }
            (todelete, leaves)
        };

        // child before parent: the parent latch was released above
        let mut deleted: OffsetNumber = 0;
        for (off, leaf) in todelete.iter().zip(&leaves) {
            let mut leaf_guard = rel.read_exclusive(*leaf)?;
            GistPage::new(leaf_guard.data()).check(*leaf)?;
            let mut parent_guard = rel.read_exclusive(parent)?;
            if GistPage::new(parent_guard.data()).max_offset() <= FIRST_OFFSET_NUMBER {
                // never remove the last downlink
                break;
            }
            if delete_page(vstate, &mut parent_guard, off - deleted, &mut leaf_guard)? {
                deleted += 1;
            }
        }
        empty_remaining = empty_remaining.saturating_sub(todelete.len() as u64);
    }
    Ok(())
}

/// Unlinks `leaf` from `parent` and turns it into a tombstone, after
/// checking that nothing changed while neither page was latched.
fn delete_page(
    vstate: &mut VacState<'_>,
    parent: &mut WritePageGuard,
    downlink: OffsetNumber,
    leaf: &mut WritePageGuard,
) -> GistResult<bool> {
    let rel = vstate.rel;
    {
        let leaf_page = GistPage::new(leaf.data());
        if !leaf_page.is_leaf() || leaf_page.follow_right() || leaf_page.max_offset() != 0 {
            return Ok(false);
        }
        let parent_page = GistPage::new(parent.data());
        if parent_page.is_new() || parent_page.is_deleted() || parent_page.is_leaf() {
            return Ok(false);
        }
        // the downlink may have moved; the next vacuum tries again
        if parent_page.max_offset() < downlink
            || parent_page.max_offset() <= FIRST_OFFSET_NUMBER
            || parent_page.downlink_block(downlink) != leaf.block()
        {
            return Ok(false);
        }
    }

    let delete_xid = rel.horizon().next_full_xid();
    GistPage::new(leaf.data_mut()).set_deleted(delete_xid);
    leaf.mark_dirty();
    GistPage::new(parent.data_mut()).tuple_delete(downlink)?;
    parent.mark_dirty();
    vstate.stats.pages_newly_deleted += 1;
    vstate.stats.pages_deleted += 1;

    let (leaf_block, parent_block) = (leaf.block(), parent.block());
    let lsn = rel.log_or_fake(|| {
        GistWalRecord::PageDelete(PageDeleteRecord {
            leaf: leaf_block,
            parent: parent_block,
            delete_xid,
            downlink_offset: downlink,
        })
    })?;
    parent.set_lsn(lsn);
    leaf.set_lsn(lsn);
    debug!(
        "index \"{}\" deleted empty leaf {} below block {}",
        rel.name(),
        leaf_block,
        parent_block
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::gist::insert::gist_insert;
    use crate::tests::harness::{leaf_blocks, range_relation, walk_tree};
    use crate::tests::opclasses::range_datum;

    fn fill(rel: &GistRelation, n: u32) {
        for i in 0..n {
            gist_insert(
                rel,
                &[Some(range_datum(i as i64, i as i64))],
                ItemPointer::new(i, 1),
            )
            .unwrap();
        }
    }

    #[test]
    fn removes_exactly_the_dead_tuples() {
        let (_dir, rel) = range_relation(1, Some(11));
        fill(&rel, 2000);
        let info = IndexVacuumInfo::default();
        let dead = |tid: ItemPointer| tid.block % 3 == 0;
        let stats = bulk_delete(&rel, &info, None, &dead).unwrap();
        assert_eq!(stats.tuples_removed, 667.0);
        assert_eq!(stats.num_index_tuples, 1333.0);
        assert!(!stats.estimated_count);
        assert_eq!(walk_tree(&rel).leaf_tuples, 1333);
    }

    #[test]
    fn cleanup_alone_counts_and_clamps() {
        let (_dir, rel) = range_relation(1, Some(11));
        fill(&rel, 500);
        let info = IndexVacuumInfo {
            analyze_only: false,
            estimated_count: false,
            num_heap_tuples: 400.0,
        };
        let stats = vacuum_cleanup(&rel, &info, None).unwrap().unwrap();
        assert_eq!(stats.num_index_tuples, 400.0);
        assert_eq!(stats.tuples_removed, 0.0);

        let analyze = IndexVacuumInfo {
            analyze_only: true,
            ..info
        };
        assert!(vacuum_cleanup(&rel, &analyze, None).unwrap().is_none());
    }

    #[test]
    fn empty_leaves_are_unlinked_but_one_downlink_stays() {
        let (_dir, rel) = range_relation(1, Some(11));
        fill(&rel, 3000);
        let leaves_before = leaf_blocks(&rel).len() as u32;
        assert!(leaves_before > 2);

        let stats = bulk_delete(&rel, &IndexVacuumInfo::default(), None, &|_| true).unwrap();
        assert_eq!(stats.tuples_removed, 3000.0);
        assert!(stats.pages_newly_deleted >= leaves_before - 1 - walk_tree(&rel).internal_pages);

        let summary = walk_tree(&rel);
        assert_eq!(summary.leaf_tuples, 0);
        assert!(summary.reachable_leaves >= 1);
    }
}
