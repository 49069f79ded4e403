//! Bulk index build.
//!
//! Starts by inserting tuples one at a time, like ordinary inserts but
//! without WAL. Depending on the `buffering` option the build then switches
//! to buffered mode, where tuples travel down the tree through node buffers
//! (see [`GistBuildBuffers`]). Leaf tuples are formed in parallel batches.

use std::collections::HashMap;

use log::debug;
use rayon::prelude::*;

use crate::buffer::WritePageGuard;
use crate::config::GistBuildConfig;
use crate::error::{GistError, GistResult};
use crate::index::gist::build_buffers::GistBuildBuffers;
use crate::index::gist::choose::gist_choose;
use crate::index::gist::insert::{place_to_page, GistInserter};
use crate::index::gist::opclass::Datum;
use crate::index::gist::options::{BufferingMode, GistOptions};
use crate::index::gist::page::{GistPage, F_LEAF, GIST_BUILD_LSN, GIST_OPAQUE_SIZE, GIST_ROOT_BLKNO};
use crate::index::gist::relation::GistRelation;
use crate::index::gist::tuple::{IndexTuple, INDEX_TUPLE_HEADER_SIZE};
use crate::storage::page::{
    max_align, BlockNumber, ItemPointer, OffsetNumber, BLCKSZ, FIRST_OFFSET_NUMBER,
    INVALID_BLOCK_NUMBER, INVALID_OFFSET_NUMBER, ITEM_ID_SIZE, PAGE_HEADER_SIZE,
};

/// Tuples between checks of the index size in `auto` mode.
const BUFFERING_MODE_SWITCH_CHECK_STEP: u64 = 256;

/// Tuples inserted before switching when buffering is `on`, and between
/// recalculations of the buffer size once buffering.
const BUFFERING_MODE_TUPLE_SIZE_STATS_TARGET: u64 = 4096;

/// A heap row to index: its TID and one value per index column.
pub type HeapRow = (ItemPointer, Vec<Option<Datum>>);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndexBuildResult {
    pub heap_tuples: f64,
    pub index_tuples: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferingState {
    /// Plain inserts until the end.
    Disabled,
    /// Plain inserts, switching once the index outgrows the cache.
    Auto,
    /// Plain inserts while gathering tuple size statistics.
    Stats,
    Active,
}

struct GistBuildState<'a> {
    rel: &'a GistRelation,
    config: GistBuildConfig,
    freespace: usize,
    mode: BufferingState,
    buffers: Option<GistBuildBuffers>,
    /// Parent of every internal page seen since buffering started.
    parent_map: HashMap<BlockNumber, BlockNumber>,
    indtuples: u64,
    indtuples_size: u64,
}

/// Builds the index over `rows` into an empty relation.
pub fn gist_build(
    rel: &GistRelation,
    options: &GistOptions,
    config: &GistBuildConfig,
    rows: impl IntoIterator<Item = HeapRow>,
) -> GistResult<IndexBuildResult> {
    if rel.num_blocks() != 0 {
        return Err(GistError::Internal(format!(
            "index \"{}\" already contains data",
            rel.name()
        )));
    }

    {
        let mut root = rel.new_buffer()?;
        if root.block() != GIST_ROOT_BLKNO {
            return Err(GistError::Internal(format!(
                "root of index \"{}\" was allocated at block {}",
                rel.name(),
                root.block()
            )));
        }
        GistPage::new(root.data_mut()).init(F_LEAF);
        root.set_lsn(GIST_BUILD_LSN);
        root.mark_dirty();
    }

    let mut build = GistBuildState {
        rel,
        config: *config,
        freespace: options.freespace(),
        mode: match options.buffering {
            BufferingMode::On => BufferingState::Stats,
            BufferingMode::Off => BufferingState::Disabled,
            BufferingMode::Auto => BufferingState::Auto,
        },
        buffers: None,
        parent_map: HashMap::new(),
        indtuples: 0,
        indtuples_size: 0,
    };

    let state = rel.state();
    let batch_size = config.batch_size.max(1);
    let mut heap_tuples = 0u64;
    let mut rows = rows.into_iter();
    loop {
        let batch: Vec<HeapRow> = rows.by_ref().take(batch_size).collect();
        if batch.is_empty() {
            break;
        }
        rel.check_interrupts()?;
        heap_tuples += batch.len() as u64;
        let tuples = batch
            .par_iter()
            .map(|(tid, values)| {
                let mut itup = state.form_tuple(values, true)?;
                itup.set_tid(*tid);
                Ok(itup)
            })
            .collect::<GistResult<Vec<IndexTuple>>>()?;
        for itup in tuples {
            build.add_tuple(itup)?;
        }
    }

    if build.mode == BufferingState::Active {
        debug!("all tuples processed, emptying buffers");
        build.empty_all_buffers()?;
    }

    Ok(IndexBuildResult {
        heap_tuples: heap_tuples as f64,
        index_tuples: build.indtuples as f64,
    })
}

impl GistBuildState<'_> {
    fn gfbb(&mut self) -> GistResult<&mut GistBuildBuffers> {
        self.buffers
            .as_mut()
            .ok_or_else(|| GistError::Internal("build buffers are not initialised".to_string()))
    }

    fn add_tuple(&mut self, itup: IndexTuple) -> GistResult<()> {
        let size = itup.size() as u64;
        if self.mode == BufferingState::Active {
            let root_level = self.gfbb()?.root_level;
            self.process_itup(itup, GIST_ROOT_BLKNO, root_level)?;
            self.process_emptying_queue()?;
        } else {
            GistInserter::new(self.rel, self.freespace, true).do_insert(&itup)?;
        }
        self.indtuples += 1;
        self.indtuples_size += size;

        if self.mode == BufferingState::Active
            && self.indtuples % BUFFERING_MODE_TUPLE_SIZE_STATS_TARGET == 0
        {
            let level_step = self.gfbb()?.level_step;
            let pages_per_buffer = self.pages_per_buffer(level_step);
            self.gfbb()?.pages_per_buffer = pages_per_buffer;
        }

        let outgrew_cache = self.mode == BufferingState::Auto
            && self.indtuples % BUFFERING_MODE_SWITCH_CHECK_STEP == 0
            && (self.config.effective_cache_size as u64) < self.rel.num_blocks() as u64;
        let stats_done = self.mode == BufferingState::Stats
            && self.indtuples >= BUFFERING_MODE_TUPLE_SIZE_STATS_TARGET;
        if outgrew_cache || stats_done {
            self.init_buffering()?;
        }
        Ok(())
    }

    /// Space on an index page available for tuples.
    fn page_free_space(&self) -> f64 {
        (BLCKSZ - PAGE_HEADER_SIZE - GIST_OPAQUE_SIZE - ITEM_ID_SIZE)
            .saturating_sub(self.freespace) as f64
    }

    fn avg_tuples_per_page(&self) -> f64 {
        let avg_size = self.indtuples_size as f64 / self.indtuples.max(1) as f64;
        self.page_free_space() / avg_size.max(1.0)
    }

    /// Buffer size such that emptying half a buffer fills about one page in
    /// every buffer on the next buffered level.
    fn pages_per_buffer(&self, level_step: u32) -> usize {
        (2.0 * self.avg_tuples_per_page().powi(level_step as i32)).round() as usize
    }

    fn init_buffering(&mut self) -> GistResult<()> {
        let avg_per_page = self.avg_tuples_per_page();
        let min_size = max_align(INDEX_TUPLE_HEADER_SIZE + 4 * self.rel.state().leaf_natts());
        let max_per_page = self.page_free_space() / min_size as f64;
        let cache_pages = self.config.effective_cache_size as f64;
        let work_mem_pages = (self.config.maintenance_work_mem * 1024 / BLCKSZ) as f64;

        // the largest subtree that fits in a quarter of the cache, with one
        // page per buffer of its lowest level in memory
        let mut level_step: i32 = 1;
        while (1.0 - avg_per_page.powi(level_step + 1)) / (1.0 - avg_per_page) < cache_pages / 4.0
            && max_per_page.powi(level_step) < work_mem_pages
        {
            level_step += 1;
        }
        level_step -= 1;

        if level_step <= 0 {
            debug!("failed to switch to buffered GiST build");
            self.mode = BufferingState::Disabled;
            return Ok(());
        }

        let level_step = level_step as u32;
        let pages_per_buffer = self.pages_per_buffer(level_step);
        let max_level = self.max_level()?;
        self.buffers = Some(GistBuildBuffers::new(
            pages_per_buffer,
            level_step,
            max_level,
        )?);
        self.parent_map.clear();
        self.mode = BufferingState::Active;
        debug!(
            "switched to buffered GiST build; level step = {}, pagesPerBuffer = {}",
            level_step, pages_per_buffer
        );
        Ok(())
    }

    /// Depth of the tree, following first downlinks.
    fn max_level(&self) -> GistResult<u32> {
        let mut level = 0;
        let mut block = GIST_ROOT_BLKNO;
        loop {
            let guard = self.rel.read_shared(block)?;
            let page = GistPage::new(guard.data());
            if page.is_leaf() {
                return Ok(level);
            }
            block = page.downlink_block(FIRST_OFFSET_NUMBER);
            level += 1;
        }
    }

    fn memorize_all_downlinks<B: AsRef<[u8]>>(&mut self, parent: BlockNumber, page: &GistPage<B>) {
        for off in FIRST_OFFSET_NUMBER..=page.tuple_count() {
            self.parent_map.insert(page.downlink_block(off), parent);
        }
    }

    /// Runs `itup` down from `start_block` at `start_level` until it reaches
    /// a leaf or a buffered level below the start. Returns true when it was
    /// added to a buffer that is now overflowing.
    fn process_itup(
        &mut self,
        itup: IndexTuple,
        start_block: BlockNumber,
        start_level: u32,
    ) -> GistResult<bool> {
        let rel = self.rel;
        let mut block = start_block;
        let mut level = start_level;
        let mut parent_block = INVALID_BLOCK_NUMBER;
        let mut downlink_off = INVALID_OFFSET_NUMBER;

        loop {
            if level == 0 || (level != start_level && self.gfbb()?.level_has_buffers(level)) {
                break;
            }
            let guard = rel.read_exclusive(block)?;
            let (child_off, child_block, downlink) = {
                let page = GistPage::new(guard.data());
                let off = gist_choose(rel, block, &page, &itup)?;
                (off, page.downlink_block(off), page.tuple(off))
            };
            if level > 1 {
                self.parent_map.insert(child_block, block);
            }
            match rel.state().get_adjusted(&downlink, &itup)? {
                Some(newtup) => {
                    block = self.insert_tuples(
                        guard,
                        level,
                        vec![newtup],
                        Some(child_off),
                        INVALID_BLOCK_NUMBER,
                        INVALID_OFFSET_NUMBER,
                    )?;
                }
                None => drop(guard),
            }
            parent_block = block;
            block = child_block;
            downlink_off = child_off;
            level -= 1;
        }

        if self.gfbb()?.level_has_buffers(level) {
            let gfbb = self.gfbb()?;
            gfbb.push_tuple(block, level, &itup)?;
            return Ok(gfbb.is_overflowed(block));
        }

        let guard = rel.read_exclusive(block)?;
        self.insert_tuples(guard, level, vec![itup], None, parent_block, downlink_off)?;
        Ok(false)
    }

    /// Places `tuples` on the page in `guard`, which is at `level`, and
    /// carries any split up the tree. Returns the block the first tuple
    /// ended up on.
    fn insert_tuples(
        &mut self,
        mut guard: WritePageGuard,
        level: u32,
        tuples: Vec<IndexTuple>,
        oldoff: Option<OffsetNumber>,
        parent_block: BlockNumber,
        downlink_off: OffsetNumber,
    ) -> GistResult<BlockNumber> {
        let rel = self.rel;
        let block = guard.block();
        let outcome = place_to_page(
            rel,
            self.freespace,
            true,
            &mut guard,
            &tuples,
            oldoff,
            None,
            false,
        )?;

        if outcome.is_split && block == GIST_ROOT_BLKNO {
            let root_level = {
                let gfbb = self.gfbb()?;
                gfbb.root_level += 1;
                gfbb.root_level
            };
            debug!("splitting GiST root page, now {} levels deep", root_level);
            // the old root's downlinks moved one level down
            if root_level > 1 {
                let children: Vec<BlockNumber> = {
                    let page = GistPage::new(guard.data());
                    (FIRST_OFFSET_NUMBER..=page.tuple_count())
                        .map(|off| page.downlink_block(off))
                        .collect()
                };
                for child in children {
                    let child_guard = rel.read_shared(child)?;
                    self.memorize_all_downlinks(child, &GistPage::new(child_guard.data()));
                    self.parent_map.insert(child, GIST_ROOT_BLKNO);
                }
            }
        }

        let mut splitinfo = outcome.splitinfo;
        if splitinfo.is_empty() {
            return Ok(outcome.new_block);
        }

        self.gfbb()?
            .relocate_on_split(rel.state(), level, block, &mut splitinfo)?;
        let (parent_guard, parent, downlink_off) =
            self.find_correct_parent(block, level, parent_block, downlink_off)?;

        let mut downlinks = Vec::with_capacity(splitinfo.len());
        for si in &splitinfo {
            if level > 0 {
                self.parent_map.insert(si.block, parent);
            }
            if level > 1 {
                match &si.guard {
                    Some(g) => self.memorize_all_downlinks(si.block, &GistPage::new(g.data())),
                    None => self.memorize_all_downlinks(si.block, &GistPage::new(guard.data())),
                }
            }
            downlinks.push(si.downlink.clone());
        }
        // nobody else touches the index, so the split pages can go before
        // the parent is updated
        drop(splitinfo);
        drop(guard);

        self.insert_tuples(
            parent_guard,
            level + 1,
            downlinks,
            Some(downlink_off),
            INVALID_BLOCK_NUMBER,
            INVALID_OFFSET_NUMBER,
        )?;
        Ok(outcome.new_block)
    }

    /// Latches the parent of `child` and finds its downlink there. Parents of
    /// leaves come from the caller, those of internal pages from the map.
    fn find_correct_parent(
        &mut self,
        child: BlockNumber,
        level: u32,
        parent_block: BlockNumber,
        downlink_off: OffsetNumber,
    ) -> GistResult<(WritePageGuard, BlockNumber, OffsetNumber)> {
        let parent = if level > 0 {
            self.parent_map.get(&child).copied().ok_or_else(|| {
                GistError::Internal(format!(
                    "could not find parent of block {} in lookup table",
                    child
                ))
            })?
        } else if parent_block == INVALID_BLOCK_NUMBER {
            return Err(GistError::Internal(format!(
                "no parent buffer provided of child {}",
                child
            )));
        } else {
            parent_block
        };

        let guard = self.rel.read_exclusive(parent)?;
        let found = {
            let page = GistPage::new(guard.data());
            page.check(parent)?;
            let max = page.tuple_count();
            if parent == parent_block
                && downlink_off != INVALID_OFFSET_NUMBER
                && downlink_off <= max
                && page.downlink_block(downlink_off) == child
            {
                Some(downlink_off)
            } else {
                (FIRST_OFFSET_NUMBER..=max).find(|off| page.downlink_block(*off) == child)
            }
        };
        match found {
            Some(off) => Ok((guard, parent, off)),
            None => Err(GistError::Internal(format!(
                "failed to re-find parent for block {}",
                child
            ))),
        }
    }

    /// Empties queued buffers until the queue runs dry. Emptying one buffer
    /// stops as soon as a buffer below it overflows; that one is queued and
    /// emptied next.
    fn process_emptying_queue(&mut self) -> GistResult<()> {
        while let Some(block) = self.gfbb()?.next_to_empty() {
            self.rel.check_interrupts()?;
            let gfbb = self.gfbb()?;
            gfbb.unload_all()?;
            let Some(level) = gfbb.level_of(block) else {
                continue;
            };
            while let Some(itup) = self.gfbb()?.pop_tuple(block)? {
                if self.process_itup(itup, block, level)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Flushes every buffer, top level first.
    fn empty_all_buffers(&mut self) -> GistResult<()> {
        let levels = self.gfbb()?.num_levels();
        for level in (0..levels).rev() {
            while let Some(block) = self.gfbb()?.last_on_level(level) {
                if self.gfbb()?.blocks_count(block) != 0 {
                    self.gfbb()?.queue_for_emptying(block);
                    self.process_emptying_queue()?;
                } else {
                    self.gfbb()?.forget_last_on_level(level);
                }
            }
            debug!("emptied all buffers at level {}", level);
        }
        Ok(())
    }
}
