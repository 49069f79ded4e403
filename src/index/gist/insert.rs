//! Tuple insertion: descent with lock coupling, page placement, the split
//! cascade towards the root and repair of splits left incomplete.
//!
//! Pages are only ever latched child before parent. A split leaves
//! FOLLOW_RIGHT on every page of the chain but the last until the parent has
//! downlinks for all of them; readers that reach such a page through the old
//! downlink follow its right-link instead.

use std::collections::VecDeque;

use log::{debug, info};

use crate::buffer::{ReadPageGuard, WritePageGuard};
use crate::error::{GistError, GistResult};
use crate::index::gist::choose::gist_choose;
use crate::index::gist::opclass::Datum;
use crate::index::gist::page::{
    GistPage, F_LEAF, GIST_BUILD_LSN, GIST_MAX_SPLIT_PAGES, GIST_ROOT_BLKNO,
};
use crate::index::gist::relation::GistRelation;
use crate::index::gist::split::gist_split;
use crate::index::gist::tuple::IndexTuple;
use crate::index::gist::xlog::{GistWalRecord, PageSplitRecord, PageUpdateRecord, SplitPageImage};
use crate::recovery::Lsn;
use crate::storage::page::{
    BlockNumber, ItemPointer, OffsetNumber, BLCKSZ, FIRST_OFFSET_NUMBER, INVALID_BLOCK_NUMBER,
    INVALID_OFFSET_NUMBER,
};

/// One page of a split chain with the downlink that should point at it.
/// The guard of the original page is held by the caller and left `None`.
pub(crate) struct SplitInfo {
    pub guard: Option<WritePageGuard>,
    pub block: BlockNumber,
    pub downlink: IndexTuple,
}

pub(crate) struct PlaceOutcome {
    pub is_split: bool,
    /// Empty unless a non-root page was split.
    pub splitinfo: Vec<SplitInfo>,
    /// Block that received the first of the placed tuples.
    pub new_block: BlockNumber,
}

/// Puts `tuples` on the page held by `buf`, replacing the tuple at `oldoff`
/// if given, and splits the page when they do not fit.
///
/// A root split is completed here: the root keeps its block and receives the
/// downlinks of its new children. Any other split returns the new chain in
/// `splitinfo`, every page still latched, for the caller to link into the
/// parent. When `left_child` is given this placement inserts the downlink of
/// its right sibling, and the child's FOLLOW_RIGHT is cleared under the same
/// LSN.
pub(crate) fn place_to_page(
    rel: &GistRelation,
    freespace: usize,
    is_build: bool,
    buf: &mut WritePageGuard,
    tuples: &[IndexTuple],
    oldoff: Option<OffsetNumber>,
    left_child: Option<&mut WritePageGuard>,
    mark_follow_right: bool,
) -> GistResult<PlaceOutcome> {
    let block = buf.block();
    let (is_leaf, follow_right, has_garbage) = {
        let page = GistPage::new(buf.data());
        (page.is_leaf(), page.follow_right(), page.has_garbage())
    };
    if follow_right {
        return Err(GistError::Internal(
            "concurrent GiST page split was incomplete".to_string(),
        ));
    }

    let mut is_split = GistPage::new(buf.data()).no_space(tuples, oldoff, freespace);
    if is_split && is_leaf && has_garbage {
        prune_page(rel, buf)?;
        is_split = GistPage::new(buf.data()).no_space(tuples, oldoff, freespace);
    }
    let left_child_block = left_child.as_ref().map(|g| g.block());

    let mut outcome = PlaceOutcome {
        is_split,
        splitinfo: Vec::new(),
        new_block: block,
    };

    let lsn = if is_split {
        let is_root = block == GIST_ROOT_BLKNO;
        let mut itvec = GistPage::new(buf.data()).extract();
        if let Some(off) = oldoff {
            if off < FIRST_OFFSET_NUMBER || off as usize > itvec.len() {
                return Err(GistError::Internal(format!(
                    "replaced offset {} is not on block {} of index \"{}\"",
                    off,
                    block,
                    rel.name()
                )));
            }
            itvec.remove(off as usize - 1);
        }
        itvec.extend_from_slice(tuples);

        let mut dist = gist_split(rel.state(), is_leaf, &itvec)?;
        let npage = dist.len() + usize::from(is_root);
        if npage > GIST_MAX_SPLIT_PAGES {
            return Err(GistError::StructuralLimit(format!(
                "GiST page split into too many halves ({}, maximum {})",
                npage, GIST_MAX_SPLIT_PAGES
            )));
        }

        let (old_rightlink, old_nsn) = if is_root {
            (INVALID_BLOCK_NUMBER, 0)
        } else {
            let page = GistPage::new(buf.data());
            (page.rightlink(), page.nsn())
        };
        let flags = if is_leaf { F_LEAF } else { 0 };

        // the original page stays leftmost unless it is the root
        let reused = usize::from(!is_root);
        let mut new_bufs = Vec::with_capacity(dist.len());
        for _ in reused..dist.len() {
            let mut guard = rel.new_buffer()?;
            GistPage::new(guard.data_mut()).init(flags);
            new_bufs.push(guard);
        }
        for (i, half) in dist.iter_mut().enumerate() {
            let child = if i < reused {
                block
            } else {
                new_bufs[i - reused].block()
            };
            half.downlink.set_block(child);
        }

        let mut images = Vec::with_capacity(npage);
        if is_root {
            images.push(SplitPageImage {
                block: GIST_ROOT_BLKNO,
                tuples: dist.iter().map(|h| h.downlink.clone()).collect(),
            });
        }
        for half in &dist {
            images.push(SplitPageImage {
                block: IndexTuple::block_of(half.downlink.as_bytes()),
                tuples: half.tuples.clone(),
            });
        }

        let mut contents = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            let last = i + 1 == images.len();
            let page_flags = if image.block == GIST_ROOT_BLKNO { 0 } else { flags };
            let rightlink = if !last && image.block != GIST_ROOT_BLKNO {
                images[i + 1].block
            } else {
                old_rightlink
            };
            let mut bytes = vec![0u8; BLCKSZ];
            {
                let mut page = GistPage::new(&mut bytes[..]);
                page.init(page_flags);
                page.fill(&image.tuples).map_err(|_| {
                    GistError::Internal(format!(
                        "failed to add item to index page in \"{}\"",
                        rel.name()
                    ))
                })?;
                page.set_rightlink(rightlink);
                page.set_follow_right(!last && !is_root && mark_follow_right);
                page.set_nsn(old_nsn);
            }
            contents.push((image.block, bytes));
        }

        if let Some(first) = tuples.first() {
            let tid = first.tid();
            if let Some(image) = images
                .iter()
                .find(|img| img.block != GIST_ROOT_BLKNO && img.tuples.iter().any(|t| t.tid() == tid))
            {
                outcome.new_block = image.block;
            }
        }

        let lsn = if is_build {
            GIST_BUILD_LSN
        } else {
            rel.log_or_fake(|| {
                GistWalRecord::PageSplit(PageSplitRecord {
                    orig_rightlink: old_rightlink,
                    orig_nsn: old_nsn,
                    orig_leaf: is_leaf,
                    mark_follow_right,
                    left_child: left_child_block,
                    pages: images,
                })
            })?
        };

        for (target, bytes) in &contents {
            if *target == block {
                buf.overwrite(bytes, Some(lsn));
            } else if let Some(guard) = new_bufs.iter_mut().find(|g| g.block() == *target) {
                guard.overwrite(bytes, Some(lsn));
            }
        }
        debug!(
            "index \"{}\" split block {} into {} pages",
            rel.name(),
            block,
            dist.len()
        );

        if !is_root {
            let mut new_bufs = new_bufs.into_iter();
            for (i, half) in dist.into_iter().enumerate() {
                let guard = if i == 0 { None } else { new_bufs.next() };
                outcome.splitinfo.push(SplitInfo {
                    guard,
                    block: IndexTuple::block_of(half.downlink.as_bytes()),
                    downlink: half.downlink,
                });
            }
        }
        lsn
    } else {
        {
            let mut page = GistPage::new(buf.data_mut());
            match oldoff {
                Some(off) if tuples.len() == 1 => page.tuple_overwrite(off, tuples[0].as_bytes())?,
                Some(off) => {
                    page.tuple_delete(off)?;
                    page.fill(tuples)?;
                }
                None => page.fill(tuples)?,
            }
        }
        buf.mark_dirty();
        let lsn = if is_build {
            GIST_BUILD_LSN
        } else {
            rel.log_or_fake(|| {
                GistWalRecord::PageUpdate(PageUpdateRecord {
                    block,
                    todelete: oldoff.into_iter().collect(),
                    tuples: tuples.to_vec(),
                    left_child: left_child_block,
                })
            })?
        };
        buf.set_lsn(lsn);
        lsn
    };

    if let Some(child) = left_child {
        {
            let mut page = GistPage::new(child.data_mut());
            page.set_nsn(lsn);
            page.set_follow_right(false);
        }
        child.set_lsn(lsn);
        child.mark_dirty();
    }
    Ok(outcome)
}

/// Removes LP_DEAD tuples from a full leaf before it is split.
fn prune_page(rel: &GistRelation, buf: &mut WritePageGuard) -> GistResult<()> {
    let block = buf.block();
    let deletable: Vec<OffsetNumber> = {
        let page = GistPage::new(buf.data());
        (FIRST_OFFSET_NUMBER..=page.max_offset())
            .filter(|&off| page.item_id(off).is_dead())
            .collect()
    };
    if deletable.is_empty() {
        // the hint was stale; the next split clears it
        return Ok(());
    }
    {
        let mut page = GistPage::new(buf.data_mut());
        page.multi_delete(&deletable)?;
        page.set_has_garbage(false);
    }
    buf.mark_dirty();
    let ndeleted = deletable.len();
    let lsn = rel.log_or_fake(|| {
        GistWalRecord::PageUpdate(PageUpdateRecord {
            block,
            todelete: deletable,
            tuples: Vec::new(),
            left_child: None,
        })
    })?;
    buf.set_lsn(lsn);
    debug!(
        "index \"{}\" pruned {} dead tuples from block {}",
        rel.name(),
        ndeleted,
        block
    );
    Ok(())
}

/// A page on the path from the root to the insertion target.
#[derive(Debug, Clone)]
struct InsertStackNode {
    block: BlockNumber,
    /// Page LSN when the page was last looked at; 0 before that.
    lsn: Lsn,
    /// Offset of this page's downlink in the parent.
    downlink_off: OffsetNumber,
    parent: Option<usize>,
    /// The page was split while we held it: choose again from the parent.
    retry_from_parent: bool,
}

impl InsertStackNode {
    fn new(block: BlockNumber, downlink_off: OffsetNumber, parent: Option<usize>) -> Self {
        Self {
            block,
            lsn: 0,
            downlink_off,
            parent,
            retry_from_parent: false,
        }
    }
}

struct InsertOutcome {
    split: bool,
    buf: Option<WritePageGuard>,
    left_child: Option<WritePageGuard>,
}

enum Latched {
    Shared(ReadPageGuard),
    Exclusive(WritePageGuard),
}

impl Latched {
    fn data(&self) -> &[u8] {
        match self {
            Latched::Shared(g) => g.data(),
            Latched::Exclusive(g) => g.data(),
        }
    }

    fn lsn(&self) -> Lsn {
        match self {
            Latched::Shared(g) => g.lsn(),
            Latched::Exclusive(g) => g.lsn(),
        }
    }
}

/// Insertion state for one tuple. The stack is an arena: nodes refer to
/// their parent by index, and path searches append fresh nodes to it.
pub struct GistInserter<'a> {
    rel: &'a GistRelation,
    freespace: usize,
    is_build: bool,
    stack: Vec<InsertStackNode>,
}

impl<'a> GistInserter<'a> {
    pub fn new(rel: &'a GistRelation, freespace: usize, is_build: bool) -> Self {
        Self {
            rel,
            freespace,
            is_build,
            stack: Vec::new(),
        }
    }

    fn parent_of(&self, node: usize) -> GistResult<usize> {
        self.stack[node].parent.ok_or_else(|| {
            GistError::Internal(format!(
                "block {} of index \"{}\" has no parent on the insert path",
                self.stack[node].block,
                self.rel.name()
            ))
        })
    }

    fn push(&mut self, node: InsertStackNode) -> usize {
        self.stack.push(node);
        self.stack.len() - 1
    }

    fn exclusive(&self, latched: Latched) -> GistResult<WritePageGuard> {
        match latched {
            Latched::Exclusive(guard) => Ok(guard),
            Latched::Shared(guard) => {
                let block = guard.block();
                drop(guard);
                self.rel.read_exclusive(block)
            }
        }
    }

    /// Inserts a formed leaf tuple.
    pub fn do_insert(&mut self, itup: &IndexTuple) -> GistResult<()> {
        self.stack.clear();
        let mut cur = self.push(InsertStackNode::new(GIST_ROOT_BLKNO, INVALID_OFFSET_NUMBER, None));
        let mut xlocked: Option<WritePageGuard> = None;

        loop {
            while self.stack[cur].retry_from_parent {
                xlocked = None;
                cur = self.parent_of(cur)?;
            }
            let block = self.stack[cur].block;

            let latched = match xlocked.take() {
                Some(guard) => Latched::Exclusive(guard),
                None => {
                    let guard = self.rel.read_shared(block)?;
                    GistPage::new(guard.data()).check(block)?;
                    Latched::Shared(guard)
                }
            };
            self.stack[cur].lsn = latched.lsn();
            let (follow_right, nsn, deleted, leaf) = {
                let page = GistPage::new(latched.data());
                (page.follow_right(), page.nsn(), page.is_deleted(), page.is_leaf())
            };
            let parent_lsn = self.stack[cur].parent.map(|p| self.stack[p].lsn);

            if follow_right {
                let already_exclusive = matches!(latched, Latched::Exclusive(_));
                let guard = self.exclusive(latched)?;
                if !already_exclusive && !GistPage::new(guard.data()).follow_right() {
                    // someone finished the split while we were unlatched
                    xlocked = Some(guard);
                    continue;
                }
                self.fix_split(cur, guard)?;
                cur = self.parent_of(cur)?;
                continue;
            }

            if parent_lsn.is_some_and(|lsn| lsn < nsn) || deleted {
                // concurrent split or deletion: choose again from the parent
                drop(latched);
                cur = self.parent_of(cur)?;
                continue;
            }

            if !leaf {
                let (off, child, downlink) = {
                    let page = GistPage::new(latched.data());
                    let off = gist_choose(self.rel, block, &page, itup)?;
                    (off, page.downlink_block(off), page.tuple(off))
                };
                if downlink.is_invalid() {
                    return Err(GistError::corrupted(
                        block,
                        format!(
                            "index \"{}\" contains an inner tuple marked as invalid at offset {}, \
                             left by an incomplete page split at crash recovery",
                            self.rel.name(),
                            off
                        ),
                    ));
                }

                if let Some(newtup) = self.rel.state().get_adjusted(&downlink, itup)? {
                    let already_exclusive = matches!(latched, Latched::Exclusive(_));
                    let guard = self.exclusive(latched)?;
                    if !already_exclusive && guard.lsn() != self.stack[cur].lsn {
                        // the page changed while we were unlatched
                        xlocked = Some(guard);
                        continue;
                    }
                    let outcome =
                        self.insert_tuples(cur, guard, &[newtup], Some(off), None, None, true, false)?;
                    if outcome.split {
                        if block == GIST_ROOT_BLKNO {
                            // the root is still the parent of whatever page
                            // the adjusted downlink went to
                            xlocked = outcome.buf;
                        } else {
                            cur = self.parent_of(cur)?;
                        }
                        continue;
                    }
                } else {
                    drop(latched);
                }

                cur = self.push(InsertStackNode::new(child, off, Some(cur)));
                continue;
            }

            let guard = match latched {
                Latched::Exclusive(guard) => guard,
                Latched::Shared(guard) => {
                    drop(guard);
                    let guard = self.rel.read_exclusive(block)?;
                    self.stack[cur].lsn = guard.lsn();
                    let (still_leaf, moved) = {
                        let page = GistPage::new(guard.data());
                        (
                            page.is_leaf(),
                            page.follow_right()
                                || parent_lsn.is_some_and(|lsn| lsn < page.nsn())
                                || page.is_deleted(),
                        )
                    };
                    if block == GIST_ROOT_BLKNO {
                        if !still_leaf {
                            // the root was split while we were unlatched
                            continue;
                        }
                    } else if moved {
                        drop(guard);
                        cur = self.parent_of(cur)?;
                        continue;
                    }
                    guard
                }
            };

            self.insert_tuples(cur, guard, std::slice::from_ref(itup), None, None, None, false, false)?;
            return Ok(());
        }
    }

    /// Places `tuples` on the page of stack node `node` and, if it split,
    /// links the new pages into the parent. `buf` comes back when
    /// `keep_buf`, and `left_child` when `keep_left_child`.
    #[allow(clippy::too_many_arguments)]
    fn insert_tuples(
        &mut self,
        node: usize,
        mut buf: WritePageGuard,
        tuples: &[IndexTuple],
        oldoff: Option<OffsetNumber>,
        mut left_child: Option<WritePageGuard>,
        right_child: Option<WritePageGuard>,
        keep_buf: bool,
        keep_left_child: bool,
    ) -> GistResult<InsertOutcome> {
        let placed = place_to_page(
            self.rel,
            self.freespace,
            self.is_build,
            &mut buf,
            tuples,
            oldoff,
            left_child.as_mut(),
            true,
        )?;

        // children are not needed while the parent is updated
        drop(right_child);
        if !keep_left_child {
            left_child = None;
        }

        let buf = if placed.splitinfo.is_empty() {
            keep_buf.then_some(buf)
        } else {
            self.finish_split(node, buf, placed.splitinfo, keep_buf)?
        };
        Ok(InsertOutcome {
            split: placed.is_split,
            buf,
            left_child,
        })
    }

    /// Inserts downlinks for a split chain into the parent of `node`, right
    /// to left, updating the original page's downlink last. `orig` is the
    /// leftmost page of the chain and is returned when `keep_orig`.
    fn finish_split(
        &mut self,
        node: usize,
        orig: WritePageGuard,
        mut splitinfo: Vec<SplitInfo>,
        keep_orig: bool,
    ) -> GistResult<Option<WritePageGuard>> {
        if splitinfo.len() < 2 {
            return Err(GistError::Internal(format!(
                "split of block {} produced {} pages",
                orig.block(),
                splitinfo.len()
            )));
        }
        splitinfo[0].guard = Some(orig);

        let parent = self.parent_of(node)?;
        let mut parent_buf = self.rel.read_exclusive(self.stack[parent].block)?;

        while splitinfo.len() > 2 {
            let right = pop_split(&mut splitinfo)?;
            let left_guard = splitinfo.last_mut().and_then(|s| s.guard.take());

            parent_buf = self.find_correct_parent(node, parent_buf)?;
            let parent = self.parent_of(node)?;
            let outcome = self.insert_tuples(
                parent,
                parent_buf,
                std::slice::from_ref(&right.downlink),
                None,
                left_guard,
                right.guard,
                true,
                true,
            )?;
            if outcome.split {
                // our downlink may have moved with the parent's split
                self.stack[node].downlink_off = INVALID_OFFSET_NUMBER;
            }
            if let Some(last) = splitinfo.last_mut() {
                last.guard = outcome.left_child;
            }
            parent_buf = outcome.buf.ok_or_else(|| {
                GistError::Internal("lost the parent latch while finishing a split".to_string())
            })?;
        }

        let right = pop_split(&mut splitinfo)?;
        let left = pop_split(&mut splitinfo)?;
        parent_buf = self.find_correct_parent(node, parent_buf)?;
        let parent = self.parent_of(node)?;
        let oldoff = self.stack[node].downlink_off;
        let outcome = self.insert_tuples(
            parent,
            parent_buf,
            &[left.downlink, right.downlink],
            Some(oldoff),
            left.guard,
            right.guard,
            false,
            keep_orig,
        )?;

        // the downlink was deleted and re-added even without a split
        self.stack[node].downlink_off = INVALID_OFFSET_NUMBER;
        self.stack[node].retry_from_parent = true;
        Ok(outcome.left_child)
    }

    /// Completes a split whose downlinks never reached the parent. `guard`
    /// is the leftmost page of the chain, latched exclusively.
    fn fix_split(&mut self, node: usize, guard: WritePageGuard) -> GistResult<()> {
        info!(
            "fixing incomplete split in index \"{}\", block {}",
            self.rel.name(),
            guard.block()
        );
        let mut splitinfo = Vec::new();
        let mut buf = guard;
        loop {
            let downlink = self.form_downlink(node, &buf)?;
            let (follow_right, rightlink) = {
                let page = GistPage::new(buf.data());
                (page.follow_right(), page.rightlink())
            };
            splitinfo.push(SplitInfo {
                block: buf.block(),
                guard: Some(buf),
                downlink,
            });
            if !follow_right {
                break;
            }
            buf = self.rel.read_exclusive(rightlink)?;
        }
        let orig = splitinfo[0].guard.take().ok_or_else(|| {
            GistError::Internal("split chain lost its first page".to_string())
        })?;
        self.finish_split(node, orig, splitinfo, false)?;
        Ok(())
    }

    /// Downlink covering every tuple on `buf`. An empty page borrows the key
    /// of the downlink that currently leads to the chain.
    fn form_downlink(&mut self, node: usize, buf: &WritePageGuard) -> GistResult<IndexTuple> {
        let tuples = GistPage::new(buf.data()).extract();
        let mut downlink = if tuples.is_empty() {
            let parent = self.parent_of(node)?;
            let parent_buf = self.rel.read_exclusive(self.stack[parent].block)?;
            let parent_buf = self.find_correct_parent(node, parent_buf)?;
            let mut copy = GistPage::new(parent_buf.data()).tuple(self.stack[node].downlink_off);
            copy.set_valid();
            copy
        } else {
            let refs: Vec<&IndexTuple> = tuples.iter().collect();
            self.rel.state().union_tuples(&refs)?
        };
        downlink.set_block(buf.block());
        Ok(downlink)
    }

    /// Makes sure the parent recorded for `node` still holds its downlink,
    /// moving right through the parent's split siblings or, failing that,
    /// searching the tree from the root. Returns the correct parent latched
    /// exclusively.
    fn find_correct_parent(
        &mut self,
        child: usize,
        parent_buf: WritePageGuard,
    ) -> GistResult<WritePageGuard> {
        let parent = self.parent_of(child)?;
        let child_block = self.stack[child].block;
        let mut buf = parent_buf;
        GistPage::new(buf.data()).check(buf.block())?;

        {
            let page = GistPage::new(buf.data());
            let off = self.stack[child].downlink_off;
            if off != INVALID_OFFSET_NUMBER
                && off <= page.max_offset()
                && page.downlink_block(off) == child_block
            {
                return Ok(buf);
            }
        }

        loop {
            let (found, rightlink) = {
                let page = GistPage::new(buf.data());
                let found = (FIRST_OFFSET_NUMBER..=page.max_offset())
                    .find(|&off| page.downlink_block(off) == child_block);
                (found, page.rightlink())
            };
            if let Some(off) = found {
                self.stack[child].downlink_off = off;
                return Ok(buf);
            }
            self.stack[parent].block = rightlink;
            self.stack[parent].downlink_off = INVALID_OFFSET_NUMBER;
            drop(buf);
            if rightlink == INVALID_BLOCK_NUMBER {
                // only a root split moves a downlink off the right-link chain
                break;
            }
            buf = self.rel.read_exclusive(rightlink)?;
            GistPage::new(buf.data()).check(rightlink)?;
        }

        let (new_parent, off) = self.find_path(child_block)?;
        self.stack[child].parent = Some(new_parent);
        self.stack[child].downlink_off = off;
        let buf = self.rel.read_exclusive(self.stack[new_parent].block)?;
        self.find_correct_parent(child, buf)
    }

    /// Breadth-first search from the root for the internal page holding the
    /// downlink to `child`. Returns the arena index of that page, whose
    /// ancestors are linked up to the root, and the downlink offset.
    fn find_path(&mut self, child: BlockNumber) -> GistResult<(usize, OffsetNumber)> {
        let top = self.push(InsertStackNode::new(GIST_ROOT_BLKNO, INVALID_OFFSET_NUMBER, None));
        let mut fifo = VecDeque::from([top]);

        while let Some(top) = fifo.pop_front() {
            let block = self.stack[top].block;
            let guard = self.rel.read_shared(block)?;
            let page = GistPage::new(guard.data());
            page.check(block)?;
            if page.is_leaf() {
                // everything behind a leaf in the queue is a leaf too
                break;
            }
            self.stack[top].lsn = guard.lsn();
            if page.follow_right() {
                return Err(GistError::Internal(
                    "concurrent GiST page split was incomplete".to_string(),
                ));
            }
            if let Some(parent) = self.stack[top].parent {
                if self.stack[parent].lsn < page.nsn() && page.rightlink() != INVALID_BLOCK_NUMBER
                {
                    // split since the parent was read: visit the new sibling next
                    let sibling = self.push(InsertStackNode::new(
                        page.rightlink(),
                        INVALID_OFFSET_NUMBER,
                        Some(parent),
                    ));
                    fifo.push_front(sibling);
                }
            }
            for off in FIRST_OFFSET_NUMBER..=page.max_offset() {
                let blk = page.downlink_block(off);
                if blk == child {
                    return Ok((top, off));
                }
                let next = self.push(InsertStackNode::new(blk, off, Some(top)));
                fifo.push_back(next);
            }
        }

        Err(GistError::Internal(format!(
            "failed to re-find parent of a page in index \"{}\", block {}",
            self.rel.name(),
            child
        )))
    }
}

fn pop_split(splitinfo: &mut Vec<SplitInfo>) -> GistResult<SplitInfo> {
    splitinfo
        .pop()
        .ok_or_else(|| GistError::Internal("split chain ran out of pages".to_string()))
}

/// Forms a leaf tuple for `values` pointing at `tid` and inserts it.
pub fn gist_insert(
    rel: &GistRelation,
    values: &[Option<Datum>],
    tid: ItemPointer,
) -> GistResult<()> {
    let mut itup = rel.state().form_tuple(values, true)?;
    itup.set_tid(tid);
    GistInserter::new(rel, 0, false).do_insert(&itup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::harness::{leaf_blocks, range_relation, walk_tree};
    use crate::tests::opclasses::range_datum;

    fn insert(rel: &GistRelation, i: i64) {
        gist_insert(
            rel,
            &[Some(range_datum(i * 10, i * 10 + 5))],
            ItemPointer::new(i as u32, 1),
        )
        .unwrap();
    }

    #[test]
    fn first_insert_lands_on_the_root_leaf() {
        let (_dir, rel) = range_relation(1, Some(3));
        insert(&rel, 1);
        let guard = rel.read_shared(GIST_ROOT_BLKNO).unwrap();
        let page = GistPage::new(guard.data());
        assert!(page.is_leaf());
        assert_eq!(page.tuple_count(), 1);
        assert_eq!(page.tuple(1).tid(), ItemPointer::new(1, 1));
    }

    #[test]
    fn root_split_grows_the_tree_and_keeps_every_tuple() {
        let (_dir, rel) = range_relation(1, Some(3));
        for i in 0..3000 {
            insert(&rel, i);
        }
        let guard = rel.read_shared(GIST_ROOT_BLKNO).unwrap();
        assert!(!GistPage::new(guard.data()).is_leaf());
        drop(guard);

        let summary = walk_tree(&rel);
        assert_eq!(summary.leaf_tuples, 3000);
        assert_eq!(summary.follow_right_pages, 0);
        assert!(summary.depth >= 2);
        assert!(leaf_blocks(&rel).len() > 1);
    }

    #[test]
    fn unfinished_split_is_repaired_by_the_next_insert() {
        let (_dir, rel) = range_relation(1, Some(3));
        for i in 0..1500 {
            insert(&rel, i);
        }
        let root_downlinks = {
            let guard = rel.read_shared(GIST_ROOT_BLKNO).unwrap();
            GistPage::new(guard.data()).tuple_count()
        };

        // split a leaf but never tell the parent about it
        let target = leaf_blocks(&rel)[0];
        let filler: Vec<IndexTuple> = (0..400)
            .map(|i| {
                let mut t = rel
                    .state()
                    .form_tuple(&[Some(range_datum(-1000 - i, -1000 - i))], true)
                    .unwrap();
                t.set_tid(ItemPointer::new(90_000 + i as u32, 1));
                t
            })
            .collect();
        {
            let mut guard = rel.read_exclusive(target).unwrap();
            let outcome =
                place_to_page(&rel, 0, false, &mut guard, &filler, None, None, true).unwrap();
            assert!(outcome.is_split);
            assert!(GistPage::new(guard.data()).follow_right());
        }

        // a key only the split chain can take
        let key = {
            let guard = rel.read_shared(target).unwrap();
            GistPage::new(guard.data()).tuple(1).attrs(1).unwrap()[0].clone()
        };
        let mut itup = rel.state().form_tuple(&[key], true).unwrap();
        itup.set_tid(ItemPointer::new(99_999, 1));
        GistInserter::new(&rel, 0, false).do_insert(&itup).unwrap();

        let summary = walk_tree(&rel);
        assert_eq!(summary.follow_right_pages, 0);
        assert_eq!(summary.leaf_tuples, 1500 + 400 + 1);
        let guard = rel.read_shared(GIST_ROOT_BLKNO).unwrap();
        let page = GistPage::new(guard.data());
        assert!(page.is_leaf() || page.tuple_count() > root_downlinks || summary.depth > 2);
    }
}
