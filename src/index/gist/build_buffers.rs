//! Node buffers for the buffered build.
//!
//! Every `level_step`-th level of the tree gets a buffer per page. Tuples
//! descending the tree stop in the first buffer they meet and are pushed
//! further down in bulk when that buffer is emptied, which keeps the working
//! set of index pages small. Buffer contents live in pages of a temporary
//! file; only the last page of each recently used buffer stays in memory.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use bytes::{Buf, BufMut};

use crate::error::{GistError, GistResult};
use crate::index::gist::insert::SplitInfo;
use crate::index::gist::opclass::GistEntry;
use crate::index::gist::state::GistState;
use crate::index::gist::tuple::IndexTuple;
use crate::storage::page::{BlockNumber, BLCKSZ, INVALID_BLOCK_NUMBER};

/// prev: u32, used: u32
const NODE_PAGE_HEADER_SIZE: usize = 8;
/// Each stored tuple is followed by its length.
const NODE_TUPLE_TRAILER_SIZE: usize = 2;

/// One page of a node buffer. Tuples are stacked; popping returns the most
/// recently pushed one.
#[derive(Debug)]
struct NodeBufferPage {
    /// Temp file block holding the previous, full page of the same buffer.
    prev: BlockNumber,
    data: Vec<u8>,
}

impl NodeBufferPage {
    fn new(prev: BlockNumber) -> Self {
        Self {
            prev,
            data: Vec::with_capacity(BLCKSZ - NODE_PAGE_HEADER_SIZE),
        }
    }

    fn has_room(&self, itup: &IndexTuple) -> bool {
        self.data.len() + itup.size() + NODE_TUPLE_TRAILER_SIZE <= BLCKSZ - NODE_PAGE_HEADER_SIZE
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn push(&mut self, itup: &IndexTuple) {
        self.data.extend_from_slice(itup.as_bytes());
        self.data.put_u16_le(itup.size() as u16);
    }

    fn pop(&mut self) -> Option<IndexTuple> {
        let end = self.data.len().checked_sub(NODE_TUPLE_TRAILER_SIZE)?;
        let len = (&self.data[end..]).get_u16_le() as usize;
        let start = end.checked_sub(len)?;
        let itup = IndexTuple::from_bytes(&self.data[start..end]);
        self.data.truncate(start);
        Some(itup)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLCKSZ);
        buf.put_u32_le(self.prev);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.resize(BLCKSZ, 0);
        buf
    }

    fn decode(block: BlockNumber, mut buf: &[u8]) -> GistResult<Self> {
        let prev = buf.get_u32_le();
        let used = buf.get_u32_le() as usize;
        if used > buf.len() {
            return Err(GistError::Internal(format!(
                "build buffer page {} claims {} bytes",
                block, used
            )));
        }
        Ok(Self {
            prev,
            data: buf[..used].to_vec(),
        })
    }
}

/// Anonymous file of `BLCKSZ` pages with a free list.
#[derive(Debug)]
struct TempPageFile {
    file: File,
    num_blocks: BlockNumber,
    free_blocks: Vec<BlockNumber>,
}

impl TempPageFile {
    fn new() -> GistResult<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            num_blocks: 0,
            free_blocks: Vec::new(),
        })
    }

    fn get_free_block(&mut self) -> BlockNumber {
        self.free_blocks.pop().unwrap_or_else(|| {
            self.num_blocks += 1;
            self.num_blocks - 1
        })
    }

    fn release_block(&mut self, block: BlockNumber) {
        self.free_blocks.push(block);
    }

    fn write_page(&mut self, block: BlockNumber, page: &NodeBufferPage) -> GistResult<()> {
        self.file.seek(SeekFrom::Start(block as u64 * BLCKSZ as u64))?;
        self.file.write_all(&page.encode())?;
        Ok(())
    }

    fn read_page(&mut self, block: BlockNumber) -> GistResult<NodeBufferPage> {
        let mut buf = vec![0u8; BLCKSZ];
        self.file.seek(SeekFrom::Start(block as u64 * BLCKSZ as u64))?;
        self.file.read_exact(&mut buf)?;
        NodeBufferPage::decode(block, &buf)
    }
}

/// Buffer attached to one index page.
#[derive(Debug)]
struct NodeBuffer {
    level: u32,
    /// Pages in the buffer, counting the in-memory one.
    blocks_count: usize,
    /// Last page, when loaded.
    page: Option<NodeBufferPage>,
    /// Where the last page was written when it was unloaded.
    page_blocknum: BlockNumber,
    queued_for_emptying: bool,
}

impl NodeBuffer {
    fn new(level: u32) -> Self {
        Self {
            level,
            blocks_count: 0,
            page: None,
            page_blocknum: INVALID_BLOCK_NUMBER,
            queued_for_emptying: false,
        }
    }

    /// Returns true when the last page had to be brought into memory.
    fn load(&mut self, file: &mut TempPageFile) -> GistResult<bool> {
        if self.page.is_some() {
            return Ok(false);
        }
        if self.blocks_count == 0 {
            self.page = Some(NodeBufferPage::new(INVALID_BLOCK_NUMBER));
            self.blocks_count = 1;
        } else {
            let block = self.page_blocknum;
            self.page = Some(file.read_page(block)?);
            file.release_block(block);
            self.page_blocknum = INVALID_BLOCK_NUMBER;
        }
        Ok(true)
    }

    fn unload(&mut self, file: &mut TempPageFile) -> GistResult<()> {
        if let Some(page) = self.page.take() {
            let block = file.get_free_block();
            file.write_page(block, &page)?;
            self.page_blocknum = block;
        }
        Ok(())
    }

    fn push(&mut self, file: &mut TempPageFile, itup: &IndexTuple) -> GistResult<bool> {
        let loaded = self.load(file)?;
        let Some(page) = self.page.as_mut() else {
            return Err(GistError::Internal("build buffer page is not loaded".to_string()));
        };
        if !page.has_room(itup) {
            let block = file.get_free_block();
            file.write_page(block, page)?;
            *page = NodeBufferPage::new(block);
            self.blocks_count += 1;
        }
        page.push(itup);
        Ok(loaded)
    }

    fn pop(&mut self, file: &mut TempPageFile) -> GistResult<Option<IndexTuple>> {
        if self.blocks_count == 0 {
            return Ok(None);
        }
        self.load(file)?;
        let Some(page) = self.page.as_mut() else {
            return Ok(None);
        };
        let itup = page
            .pop()
            .ok_or_else(|| GistError::Internal("build buffer page is empty".to_string()))?;
        if page.is_empty() {
            self.blocks_count -= 1;
            if page.prev != INVALID_BLOCK_NUMBER {
                let prev = page.prev;
                *page = file.read_page(prev)?;
                file.release_block(prev);
            } else {
                self.page = None;
            }
        }
        Ok(Some(itup))
    }
}

/// All node buffers of one build.
#[derive(Debug)]
pub struct GistBuildBuffers {
    pub level_step: u32,
    pub pages_per_buffer: usize,
    pub root_level: u32,
    file: TempPageFile,
    buffers: HashMap<BlockNumber, NodeBuffer>,
    /// Buffers past half full, most recent first.
    emptying_queue: VecDeque<BlockNumber>,
    /// Buffers per level, newest last.
    buffers_on_levels: Vec<Vec<BlockNumber>>,
    /// Buffers whose last page is in memory.
    loaded: Vec<BlockNumber>,
}

impl GistBuildBuffers {
    pub fn new(pages_per_buffer: usize, level_step: u32, max_level: u32) -> GistResult<Self> {
        Ok(Self {
            level_step,
            pages_per_buffer,
            root_level: max_level,
            file: TempPageFile::new()?,
            buffers: HashMap::new(),
            emptying_queue: VecDeque::new(),
            buffers_on_levels: vec![Vec::new(); max_level as usize + 1],
            loaded: Vec::new(),
        })
    }

    /// Levels that carry buffers: every `level_step`-th, never the leaves
    /// and never the root.
    pub fn level_has_buffers(&self, level: u32) -> bool {
        level != 0 && level % self.level_step == 0 && level != self.root_level
    }

    fn get_node_buffer(&mut self, block: BlockNumber, level: u32) -> &mut NodeBuffer {
        let levels = &mut self.buffers_on_levels;
        self.buffers.entry(block).or_insert_with(|| {
            if levels.len() <= level as usize {
                levels.resize(level as usize + 1, Vec::new());
            }
            levels[level as usize].push(block);
            NodeBuffer::new(level)
        })
    }

    pub fn level_of(&self, block: BlockNumber) -> Option<u32> {
        self.buffers.get(&block).map(|b| b.level)
    }

    pub fn blocks_count(&self, block: BlockNumber) -> usize {
        self.buffers.get(&block).map(|b| b.blocks_count).unwrap_or(0)
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer is past its target size; the caller should stop feeding it.
    pub fn is_overflowed(&self, block: BlockNumber) -> bool {
        self.blocks_count(block) > self.pages_per_buffer
    }

    pub fn push_tuple(
        &mut self,
        block: BlockNumber,
        level: u32,
        itup: &IndexTuple,
    ) -> GistResult<()> {
        let half = self.pages_per_buffer / 2;
        self.get_node_buffer(block, level);
        let Self {
            file,
            buffers,
            emptying_queue,
            loaded,
            ..
        } = self;
        let Some(buffer) = buffers.get_mut(&block) else {
            return Ok(());
        };
        if buffer.push(file, itup)? {
            loaded.push(block);
        }
        if buffer.blocks_count > half && !buffer.queued_for_emptying {
            buffer.queued_for_emptying = true;
            emptying_queue.push_front(block);
        }
        Ok(())
    }

    pub fn pop_tuple(&mut self, block: BlockNumber) -> GistResult<Option<IndexTuple>> {
        let Self {
            file,
            buffers,
            loaded,
            ..
        } = self;
        let Some(buffer) = buffers.get_mut(&block) else {
            return Ok(None);
        };
        let was_loaded = buffer.page.is_some();
        let itup = buffer.pop(file)?;
        if !was_loaded && buffer.page.is_some() {
            loaded.push(block);
        }
        Ok(itup)
    }

    pub fn queue_for_emptying(&mut self, block: BlockNumber) {
        if let Some(buffer) = self.buffers.get_mut(&block) {
            if !buffer.queued_for_emptying {
                buffer.queued_for_emptying = true;
                self.emptying_queue.push_front(block);
            }
        }
    }

    pub fn next_to_empty(&mut self) -> Option<BlockNumber> {
        let block = self.emptying_queue.pop_front()?;
        if let Some(buffer) = self.buffers.get_mut(&block) {
            buffer.queued_for_emptying = false;
        }
        Some(block)
    }

    /// Writes out the in-memory page of every buffer touched since the
    /// last call.
    pub fn unload_all(&mut self) -> GistResult<()> {
        let Self {
            file,
            buffers,
            loaded,
            ..
        } = self;
        for block in loaded.drain(..) {
            if let Some(buffer) = buffers.get_mut(&block) {
                buffer.unload(file)?;
            }
        }
        Ok(())
    }

    pub fn num_levels(&self) -> usize {
        self.buffers_on_levels.len()
    }

    pub fn last_on_level(&self, level: usize) -> Option<BlockNumber> {
        self.buffers_on_levels.get(level)?.last().copied()
    }

    pub fn forget_last_on_level(&mut self, level: usize) {
        if let Some(list) = self.buffers_on_levels.get_mut(level) {
            list.pop();
        }
    }

    /// Moves the buffered tuples of a page that was just split to the
    /// buffers of the resulting pages, widening their downlinks so they
    /// also cover what is still waiting in the buffers.
    ///
    /// The left half keeps the block, and with it the buffer, of the split
    /// page.
    pub(crate) fn relocate_on_split(
        &mut self,
        state: &GistState,
        level: u32,
        block: BlockNumber,
        splitinfo: &mut [SplitInfo],
    ) -> GistResult<()> {
        if !self.level_has_buffers(level) {
            return Ok(());
        }
        let Some(buffer) = self.buffers.get_mut(&block) else {
            return Ok(());
        };
        let mut old = NodeBuffer {
            level,
            blocks_count: buffer.blocks_count,
            page: buffer.page.take(),
            page_blocknum: buffer.page_blocknum,
            queued_for_emptying: false,
        };
        buffer.blocks_count = 0;
        buffer.page_blocknum = INVALID_BLOCK_NUMBER;

        let mut targets: Vec<Vec<Option<GistEntry>>> = Vec::with_capacity(splitinfo.len());
        for si in splitinfo.iter() {
            targets.push(state.decompress_att(&si.downlink)?);
            self.get_node_buffer(si.block, level);
        }

        let nkeys = state.nkeys();
        while let Some(itup) = old.pop(&mut self.file)? {
            let entry = state.decompress_att(&itup)?;
            let mut which = 0;
            let mut best_penalty: Vec<Option<f32>> = vec![None; nkeys];
            for (i, target) in targets.iter().enumerate() {
                let mut zero_penalty = true;
                for attno in 0..nkeys {
                    let penalty =
                        state.penalty(attno, target[attno].as_ref(), entry[attno].as_ref())?;
                    if penalty > 0.0 {
                        zero_penalty = false;
                    }
                    match best_penalty[attno] {
                        Some(best) if penalty == best => {}
                        Some(best) if penalty > best => {
                            zero_penalty = false;
                            break;
                        }
                        _ => {
                            which = i;
                            best_penalty[attno] = Some(penalty);
                            if attno + 1 < nkeys {
                                best_penalty[attno + 1] = None;
                            }
                        }
                    }
                }
                if zero_penalty {
                    break;
                }
            }

            self.push_tuple(splitinfo[which].block, level, &itup)?;
            if let Some(newtup) = state.get_adjusted(&splitinfo[which].downlink, &itup)? {
                targets[which] = state.decompress_att(&newtup)?;
                splitinfo[which].downlink = newtup;
            }
        }
        Ok(())
    }
}
