use crate::buffer::buffer_pool::FrameMeta;
use crate::buffer::{BufferManager, FrameId};
use crate::recovery::Lsn;
use crate::storage::page::{BlockNumber, SlottedPage};
use log::warn;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};
use std::mem::ManuallyDrop;
use std::sync::Arc;

type FrameReadLatch = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
type FrameWriteLatch = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// A pinned page held under a shared latch.
pub struct ReadPageGuard {
    bpm: Arc<BufferManager>,
    frame_id: FrameId,
    block: BlockNumber,
    guard: ManuallyDrop<FrameReadLatch>,
}

impl ReadPageGuard {
    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    pub fn block(&self) -> BlockNumber {
        self.block
    }

    pub fn lsn(&self) -> Lsn {
        SlottedPage::new(self.data()).lsn()
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.bpm.buffer_pool().frame_meta(self.frame_id).clone()
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl std::fmt::Debug for ReadPageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadPageGuard")
            .field("block", &self.block)
            .field("frame_id", &self.frame_id)
            .finish()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // SAFETY: the latch is released exactly once and never touched again.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if let Err(e) = self.bpm.complete_unpin(self.frame_id, self.block) {
            warn!("Failed to complete_unpin block {}: {}", self.block, e);
        }
    }
}

/// A pinned page held under an exclusive latch.
pub struct WritePageGuard {
    bpm: Arc<BufferManager>,
    frame_id: FrameId,
    block: BlockNumber,
    guard: ManuallyDrop<FrameWriteLatch>,
}

impl WritePageGuard {
    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }

    pub fn block(&self) -> BlockNumber {
        self.block
    }

    pub fn lsn(&self) -> Lsn {
        SlottedPage::new(self.data()).lsn()
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        SlottedPage::new(self.data_mut()).set_lsn(lsn);
    }

    pub fn mark_dirty(&mut self) {
        self.bpm.buffer_pool().frame_meta(self.frame_id).is_dirty = true;
    }

    /// Dirties the buffer for a change that is not WAL-logged, such as
    /// LP_DEAD hints. Losing it in a crash is harmless.
    pub fn mark_dirty_hint(&mut self) {
        self.mark_dirty();
    }

    pub fn overwrite(&mut self, data: &[u8], new_lsn: Option<Lsn>) {
        self.data_mut().copy_from_slice(data);
        if let Some(lsn) = new_lsn {
            self.set_lsn(lsn);
        }
        self.mark_dirty();
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.bpm.buffer_pool().frame_meta(self.frame_id).clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_snapshot().is_dirty
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl std::fmt::Debug for WritePageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePageGuard")
            .field("block", &self.block)
            .field("frame_id", &self.frame_id)
            .finish()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // SAFETY: the latch is released exactly once and never touched again.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if let Err(e) = self.bpm.complete_unpin(self.frame_id, self.block) {
            warn!("Failed to complete_unpin block {}: {}", self.block, e);
        }
    }
}

/// Latches an already pinned frame in shared mode.
pub(crate) fn new_read_guard(
    bpm: Arc<BufferManager>,
    frame_id: FrameId,
    block: BlockNumber,
) -> ReadPageGuard {
    let latch = bpm.buffer_pool().frame_latch(frame_id).read_arc();
    ReadPageGuard {
        bpm,
        frame_id,
        block,
        guard: ManuallyDrop::new(latch),
    }
}

/// Latches an already pinned frame in exclusive mode.
pub(crate) fn new_write_guard(
    bpm: Arc<BufferManager>,
    frame_id: FrameId,
    block: BlockNumber,
) -> WritePageGuard {
    let latch = bpm.buffer_pool().frame_latch(frame_id).write_arc();
    WritePageGuard {
        bpm,
        frame_id,
        block,
        guard: ManuallyDrop::new(latch),
    }
}

/// Conditional exclusive latch; `None` when someone else holds the page.
pub(crate) fn try_new_write_guard(
    bpm: Arc<BufferManager>,
    frame_id: FrameId,
    block: BlockNumber,
) -> Option<WritePageGuard> {
    let latch = bpm.buffer_pool().frame_latch(frame_id).try_write_arc()?;
    Some(WritePageGuard {
        bpm,
        frame_id,
        block,
        guard: ManuallyDrop::new(latch),
    })
}
