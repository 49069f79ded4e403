//! Low-level buffer pool responsible for frame storage, page table, and disk I/O.

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::BufferPoolConfig;
use crate::error::{GistError, GistResult};
use crate::storage::disk_manager::DiskManager;
use crate::storage::page::{BlockNumber, SlottedPage, BLCKSZ, INVALID_BLOCK_NUMBER};

pub type FrameId = usize;

pub type FrameLatch = Arc<RwLock<Box<[u8]>>>;

#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub block: BlockNumber,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self {
            block: INVALID_BLOCK_NUMBER,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

#[derive(Debug)]
pub struct BufferPool {
    frames: Vec<FrameLatch>,
    meta: Vec<Mutex<FrameMeta>>,
    page_table: DashMap<BlockNumber, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    disk_manager: Arc<DiskManager>,
    data_checksums: bool,
}

impl BufferPool {
    pub fn new(num_pages: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_manager,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_manager: Arc<DiskManager>) -> Self {
        let num_pages = config.buffer_pool_size.max(1);
        let mut free_list = VecDeque::with_capacity(num_pages);
        let mut meta = Vec::with_capacity(num_pages);
        let mut frames = Vec::with_capacity(num_pages);
        for frame_id in 0..num_pages {
            free_list.push_back(frame_id);
            meta.push(Mutex::new(FrameMeta::default()));
            frames.push(Arc::new(RwLock::new(vec![0u8; BLCKSZ].into_boxed_slice())));
        }

        Self {
            frames,
            meta,
            page_table: DashMap::new(),
            free_list: Mutex::new(free_list),
            disk_manager,
            data_checksums: config.data_checksums,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_latch(&self, frame_id: FrameId) -> &FrameLatch {
        &self.frames[frame_id]
    }

    pub fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.meta[frame_id].lock()
    }

    pub fn clear_frame_meta(&self, frame_id: FrameId) {
        let mut meta = self.meta[frame_id].lock();
        *meta = FrameMeta::default();
    }

    pub fn pop_free_frame(&self) -> Option<FrameId> {
        self.free_list.lock().pop_front()
    }

    pub fn has_free_frame(&self) -> bool {
        !self.free_list.lock().is_empty()
    }

    pub fn push_free_frame(&self, frame_id: FrameId) {
        self.free_list.lock().push_back(frame_id);
    }

    pub fn insert_mapping(&self, block: BlockNumber, frame_id: FrameId) {
        self.page_table.insert(block, frame_id);
    }

    pub fn remove_mapping_if(&self, block: BlockNumber, frame_id: FrameId) -> bool {
        self.page_table
            .remove_if(&block, |_, current| *current == frame_id)
            .is_some()
    }

    pub fn lookup_frame(&self, block: BlockNumber) -> Option<FrameId> {
        self.page_table.get(&block).map(|entry| *entry.value())
    }

    pub fn mapped_blocks(&self) -> Vec<(BlockNumber, FrameId)> {
        self.page_table
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn disk_manager(&self) -> Arc<DiskManager> {
        self.disk_manager.clone()
    }

    /// Reads `block` into the frame, verifying its checksum.
    pub fn load_page_into_frame(&self, block: BlockNumber, frame_id: FrameId) -> GistResult<()> {
        let mut data = self.frames[frame_id].write();
        self.disk_manager.read_block(block, &mut data)?;
        if self.data_checksums {
            let page = SlottedPage::new(&data[..]);
            if !page.verify_checksum(block) {
                return Err(GistError::corrupted(
                    block,
                    format!(
                        "page verification failed, calculated checksum {} but expected {}",
                        page.compute_checksum(block),
                        page.checksum()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn write_page_to_disk(&self, block: BlockNumber, bytes: &mut [u8]) -> GistResult<()> {
        if self.data_checksums {
            let mut page = SlottedPage::new(&mut bytes[..]);
            if !page.is_new() {
                page.set_checksum(block);
            }
        }
        self.disk_manager.write_block(block, bytes)
    }

    pub fn reset_frame(&self, frame_id: FrameId) {
        self.frames[frame_id].write().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_pool(num_pages: usize) -> (TempDir, Arc<DiskManager>, BufferPool) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("pool.db")).unwrap());
        let config = BufferPoolConfig::default().with_buffer_pool_size(num_pages);
        let pool = BufferPool::new_with_config(config, disk_manager.clone());
        (temp_dir, disk_manager, pool)
    }

    #[test]
    fn load_page_rejects_bad_checksum() {
        let (_tmp, disk, pool) = setup_pool(2);
        let block = disk.extend().unwrap();
        let mut bytes = vec![0u8; BLCKSZ];
        SlottedPage::new(&mut bytes[..]).init(16);
        pool.write_page_to_disk(block, &mut bytes).unwrap();

        let frame_id = pool.pop_free_frame().expect("free frame");
        pool.load_page_into_frame(block, frame_id).unwrap();
        assert_eq!(&pool.frame_latch(frame_id).read()[..24], &bytes[..24]);

        bytes[100] = 1;
        disk.write_block(block, &bytes).unwrap();
        let err = pool.load_page_into_frame(block, frame_id).unwrap_err();
        assert!(matches!(err, GistError::CorruptedPage { .. }));
    }

    #[test]
    fn page_table_insert_lookup_and_remove() {
        let (_tmp, _disk, pool) = setup_pool(2);
        pool.insert_mapping(7, 1);
        assert_eq!(pool.lookup_frame(7), Some(1));
        assert!(!pool.remove_mapping_if(7, 0));
        assert!(pool.remove_mapping_if(7, 1));
        assert!(pool.lookup_frame(7).is_none());
    }
}
