//! BufferManager coordinates replacement, dirty tracking, and WAL with a shared BufferPool.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::buffer::buffer_pool::{BufferPool, FrameId};
use crate::buffer::page::{self, ReadPageGuard, WritePageGuard};
use crate::config::BufferPoolConfig;
use crate::error::{GistError, GistResult};
use crate::recovery::{Lsn, WalManager};
use crate::storage::disk_manager::DiskManager;
use crate::storage::page::{BlockNumber, SlottedPage, INVALID_BLOCK_NUMBER};
use crate::utils::cache::lru_k::LruKReplacer;
use crate::utils::cache::Replacer;

#[derive(Debug)]
pub struct BufferManager {
    pool: Arc<BufferPool>,
    replacer: Arc<RwLock<LruKReplacer>>,
    inflight_loads: DashMap<BlockNumber, Arc<Mutex<()>>>,
    wal_manager: Arc<RwLock<Option<Arc<WalManager>>>>,
}

impl BufferManager {
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
        let pool = Arc::new(BufferPool::new_with_config(config, disk_manager));
        let replacer = Arc::new(RwLock::new(LruKReplacer::with_k(
            pool.capacity(),
            config.lru_k_k,
        )));

        Self {
            pool,
            replacer,
            inflight_loads: DashMap::new(),
            wal_manager: Arc::new(RwLock::new(None)),
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    pub fn disk_manager(&self) -> Arc<DiskManager> {
        self.pool.disk_manager()
    }

    pub fn set_wal_manager(&self, wal_manager: Arc<WalManager>) {
        *self.wal_manager.write() = Some(wal_manager);
    }

    pub fn wal_manager(&self) -> Option<Arc<WalManager>> {
        self.wal_manager.read().clone()
    }

    /// Extends the relation by one zeroed block and returns it latched.
    pub fn new_page(self: &Arc<Self>) -> GistResult<WritePageGuard> {
        let disk = self.pool.disk_manager();
        let _extension = disk.extension_lock();
        let frame_id = self.allocate_frame()?;
        let block = match disk.extend() {
            Ok(block) => block,
            Err(e) => {
                self.pool.push_free_frame(frame_id);
                return Err(e);
            }
        };
        self.pool.reset_frame(frame_id);
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.block = block;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        self.pool.insert_mapping(block, frame_id);
        self.replacer_record_access(frame_id)?;
        self.mark_non_evictable(frame_id)?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id, block))
    }

    pub fn fetch_page_read(self: &Arc<Self>, block: BlockNumber) -> GistResult<ReadPageGuard> {
        let frame_id = self.pin_frame(block)?;
        Ok(page::new_read_guard(Arc::clone(self), frame_id, block))
    }

    pub fn fetch_page_write(self: &Arc<Self>, block: BlockNumber) -> GistResult<WritePageGuard> {
        let frame_id = self.pin_frame(block)?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id, block))
    }

    /// Like `fetch_page_write`, but first extends the relation with zeroed
    /// blocks when `block` lies past its end. Used by redo, where a page may
    /// have been allocated before the crash but never written.
    pub fn fetch_page_write_extending(
        self: &Arc<Self>,
        block: BlockNumber,
    ) -> GistResult<WritePageGuard> {
        if block == INVALID_BLOCK_NUMBER {
            return Err(GistError::Storage(
                "fetch page: invalid block number".to_string(),
            ));
        }
        {
            let disk = self.pool.disk_manager();
            let _extension = disk.extension_lock();
            while disk.num_blocks() <= block {
                disk.extend()?;
            }
        }
        self.fetch_page_write(block)
    }

    /// Pins the page but only latches it if nobody else holds the latch.
    pub fn try_fetch_page_write(
        self: &Arc<Self>,
        block: BlockNumber,
    ) -> GistResult<Option<WritePageGuard>> {
        let frame_id = self.pin_frame(block)?;
        match page::try_new_write_guard(Arc::clone(self), frame_id, block) {
            Some(guard) => Ok(Some(guard)),
            None => {
                self.complete_unpin(frame_id, block)?;
                Ok(None)
            }
        }
    }

    pub fn complete_unpin(&self, frame_id: FrameId, block: BlockNumber) -> GistResult<()> {
        let mut meta = self.pool.frame_meta(frame_id);
        if meta.block != block {
            return Err(GistError::Internal(format!(
                "frame {} holds block {} while unpinning block {}",
                frame_id, meta.block, block
            )));
        }
        meta.pin_count = meta.pin_count.saturating_sub(1);
        if meta.pin_count == 0 {
            self.mark_evictable(frame_id)?;
        }
        Ok(())
    }

    /// Writes the page back if it is cached and dirty. Must not be called
    /// while holding an exclusive guard on the same page.
    pub fn flush_page(&self, block: BlockNumber) -> GistResult<bool> {
        let Some(frame_id) = self.pool.lookup_frame(block) else {
            return Ok(false);
        };
        let latch = self.pool.frame_latch(frame_id).read();
        self.flush_latched_frame(frame_id, block, &latch)
    }

    pub fn flush_all_pages(&self) -> GistResult<()> {
        if let Some(wal) = self.wal_manager.read().clone() {
            wal.flush(None)?;
        }
        for (block, _) in self.pool.mapped_blocks() {
            self.flush_page(block)?;
        }
        self.pool.disk_manager().sync()
    }

    fn flush_latched_frame(
        &self,
        frame_id: FrameId,
        block: BlockNumber,
        data: &[u8],
    ) -> GistResult<bool> {
        {
            let mut meta = self.pool.frame_meta(frame_id);
            if meta.block != block || !meta.is_dirty {
                return Ok(false);
            }
            // Writers need the exclusive latch to re-dirty, so clearing the
            // flag before the copy cannot lose a change.
            meta.is_dirty = false;
        }
        let mut bytes = data.to_vec();
        let lsn = SlottedPage::new(&bytes[..]).lsn();
        let result = self
            .ensure_wal_durable(lsn)
            .and_then(|_| self.pool.write_page_to_disk(block, &mut bytes));
        if let Err(e) = result {
            let mut meta = self.pool.frame_meta(frame_id);
            if meta.block == block {
                meta.is_dirty = true;
            }
            return Err(e);
        }
        Ok(true)
    }

    fn pin_frame(&self, block: BlockNumber) -> GistResult<FrameId> {
        if block == INVALID_BLOCK_NUMBER {
            return Err(GistError::Storage(
                "fetch page: invalid block number".to_string(),
            ));
        }
        loop {
            if let Some(frame_id) = self.pool.lookup_frame(block) {
                if self.try_pin(frame_id, block)? {
                    return Ok(frame_id);
                }
                continue;
            }

            let (gate, created_here) = match self.inflight_loads.entry(block) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let gate = Arc::new(Mutex::new(()));
                    entry.insert(gate.clone());
                    (gate, true)
                }
            };
            let lock = gate.lock();
            let result = self.load_frame(block);
            if created_here {
                self.inflight_loads.remove(&block);
            }
            drop(lock);
            if let Some(frame_id) = result? {
                return Ok(frame_id);
            }
        }
    }

    /// Loads `block` unless another thread already did; `None` asks the
    /// caller to retry the lookup.
    fn load_frame(&self, block: BlockNumber) -> GistResult<Option<FrameId>> {
        if let Some(frame_id) = self.pool.lookup_frame(block) {
            return Ok(if self.try_pin(frame_id, block)? {
                Some(frame_id)
            } else {
                None
            });
        }
        let frame_id = self.allocate_frame()?;
        if let Err(e) = self.pool.load_page_into_frame(block, frame_id) {
            self.pool.clear_frame_meta(frame_id);
            self.pool.push_free_frame(frame_id);
            return Err(e);
        }
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.block = block;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        self.pool.insert_mapping(block, frame_id);
        self.replacer_record_access(frame_id)?;
        self.mark_non_evictable(frame_id)?;
        Ok(Some(frame_id))
    }

    fn try_pin(&self, frame_id: FrameId, block: BlockNumber) -> GistResult<bool> {
        let mut meta = self.pool.frame_meta(frame_id);
        if meta.block != block {
            return Ok(false);
        }
        meta.pin_count += 1;
        let mut rep = self.replacer.write();
        rep.record_access(frame_id)?;
        rep.set_evictable(frame_id, false)?;
        Ok(true)
    }

    fn allocate_frame(&self) -> GistResult<FrameId> {
        if let Some(frame_id) = self.pool.pop_free_frame() {
            return Ok(frame_id);
        }
        self.evict_victim_frame()
    }

    fn replacer_record_access(&self, frame_id: FrameId) -> GistResult<()> {
        self.replacer.write().record_access(frame_id)
    }

    fn evict_victim_frame(&self) -> GistResult<FrameId> {
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            if attempts > self.pool.capacity() * 4 {
                return Err(GistError::Storage(
                    "Cannot allocate frame: buffer pool is full".to_string(),
                ));
            }
            let victim = {
                let mut rep = self.replacer.write();
                match rep.evict() {
                    Some(frame_id) => frame_id,
                    None => {
                        return Err(GistError::Storage(
                            "Cannot allocate frame: buffer pool is full".to_string(),
                        ))
                    }
                }
            };

            let (block, pin_count, is_dirty) = {
                let meta = self.pool.frame_meta(victim);
                (meta.block, meta.pin_count, meta.is_dirty)
            };
            if pin_count > 0 {
                self.keep_frame(victim, false)?;
                continue;
            }

            if block != INVALID_BLOCK_NUMBER && is_dirty {
                // someone may be latching it right now; pick another victim
                let Some(latch) = self.pool.frame_latch(victim).try_read() else {
                    self.keep_frame(victim, true)?;
                    continue;
                };
                self.flush_latched_frame(victim, block, &latch)?;
            }

            let mut meta = self.pool.frame_meta(victim);
            if meta.pin_count > 0 || meta.is_dirty || meta.block != block {
                let pinned = meta.pin_count > 0;
                drop(meta);
                self.keep_frame(victim, !pinned)?;
                continue;
            }
            if block != INVALID_BLOCK_NUMBER {
                self.pool.remove_mapping_if(block, victim);
                debug!("evicted block {} from frame {}", block, victim);
            }
            meta.block = INVALID_BLOCK_NUMBER;
            meta.is_dirty = false;
            return Ok(victim);
        }
    }

    fn keep_frame(&self, frame_id: FrameId, evictable: bool) -> GistResult<()> {
        let mut rep = self.replacer.write();
        rep.record_access(frame_id)?;
        rep.set_evictable(frame_id, evictable)
    }

    fn mark_evictable(&self, frame_id: FrameId) -> GistResult<()> {
        self.replacer.write().set_evictable(frame_id, true)
    }

    fn mark_non_evictable(&self, frame_id: FrameId) -> GistResult<()> {
        self.replacer.write().set_evictable(frame_id, false)
    }

    /// WAL-before-data: the log must be durable up to the page LSN.
    fn ensure_wal_durable(&self, lsn: Lsn) -> GistResult<()> {
        if lsn == 0 {
            return Ok(());
        }
        if let Some(wal) = self.wal_manager.read().clone() {
            if lsn > wal.durable_lsn() && lsn <= wal.insert_lsn() {
                wal.flush(Some(lsn))?;
                if wal.durable_lsn() < lsn {
                    return Err(GistError::Wal(format!(
                        "Flush blocked: page_lsn={} > durable_lsn={}",
                        lsn,
                        wal.durable_lsn()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::BLCKSZ;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn setup_manager(num_pages: usize) -> (TempDir, Arc<BufferManager>) {
        let temp_dir = TempDir::new().unwrap();
        let db_file = temp_dir.path().join("test.gist");
        let disk_manager = Arc::new(DiskManager::try_new(db_file).unwrap());
        let manager = Arc::new(BufferManager::new(num_pages, disk_manager));
        (temp_dir, manager)
    }

    fn init_page(guard: &mut WritePageGuard) {
        SlottedPage::new(guard.data_mut()).init(16);
        guard.mark_dirty();
    }

    #[test]
    fn new_page_extends_relation() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        assert_eq!(guard.block(), 0);
        assert!(guard.data().iter().all(|b| *b == 0));
        assert!(!guard.is_dirty());
        assert_eq!(guard.pin_count(), 1);
        let frame_id = guard.frame_id();
        drop(guard);

        assert_eq!(manager.disk_manager().num_blocks(), 1);
        let meta = manager.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.block, 0);
        assert_eq!(meta.pin_count, 0);
    }

    #[test]
    fn dirty_pages_survive_eviction() {
        let (_tmp, manager) = setup_manager(2);
        for i in 0..6u8 {
            let mut guard = manager.new_page().unwrap();
            init_page(&mut guard);
            guard.data_mut()[BLCKSZ - 1] = i;
            guard.set_lsn(i as Lsn + 1);
        }
        for i in 0..6u8 {
            let guard = manager.fetch_page_read(i as BlockNumber).unwrap();
            assert_eq!(guard.data()[BLCKSZ - 1], i);
            assert_eq!(guard.lsn(), i as Lsn + 1);
        }
    }

    #[test]
    fn try_fetch_write_respects_latch() {
        let (_tmp, manager) = setup_manager(4);
        let block = manager.new_page().unwrap().block();
        let held = manager.fetch_page_read(block).unwrap();
        assert!(manager.try_fetch_page_write(block).unwrap().is_none());
        drop(held);
        assert!(manager.try_fetch_page_write(block).unwrap().is_some());
        let pool = manager.buffer_pool();
        let frame_id = pool.lookup_frame(block).unwrap();
        assert_eq!(pool.frame_meta(frame_id).pin_count, 0);
    }

    #[test]
    fn pool_exhaustion_is_an_error() {
        let (_tmp, manager) = setup_manager(2);
        let _a = manager.new_page().unwrap();
        let _b = manager.new_page().unwrap();
        assert!(manager.new_page().is_err());
        assert_eq!(manager.disk_manager().num_blocks(), 2);
    }

    #[test]
    fn flush_page_writes_back_and_clears_dirty_flag() {
        let (_tmp, manager) = setup_manager(2);
        let mut guard = manager.new_page().unwrap();
        let block = guard.block();
        init_page(&mut guard);
        guard.data_mut()[100] = 42;
        drop(guard);

        assert!(manager.flush_page(block).unwrap());
        assert!(!manager.flush_page(block).unwrap());

        let mut raw = vec![0u8; BLCKSZ];
        manager.disk_manager().read_block(block, &mut raw).unwrap();
        assert_eq!(raw[100], 42);
    }

    #[test]
    fn concurrent_reads_do_not_leak_pins() {
        const THREADS: usize = 8;
        let (_tmp, manager) = setup_manager(4);
        let (block, frame_id) = {
            let mut guard = manager.new_page().unwrap();
            init_page(&mut guard);
            guard.data_mut()[200] = 42;
            (guard.block(), guard.frame_id())
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let mgr = manager.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let guard = mgr.fetch_page_read(block).expect("read page");
                    assert_eq!(guard.data()[200], 42);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let pool = manager.buffer_pool();
        let meta = pool.frame_meta(frame_id);
        assert_eq!(meta.pin_count, 0);
        assert_eq!(meta.block, block);
    }

    #[test]
    fn concurrent_writers_under_eviction_pressure() {
        const THREADS: usize = 4;
        let (_tmp, manager) = setup_manager(3);
        for _ in 0..THREADS {
            let mut guard = manager.new_page().unwrap();
            init_page(&mut guard);
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for tid in 0..THREADS {
            let mgr = manager.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for round in 0..40u8 {
                    let block = tid as BlockNumber;
                    let mut guard = loop {
                        match mgr.fetch_page_write(block) {
                            Ok(guard) => break guard,
                            Err(_) => thread::yield_now(),
                        }
                    };
                    guard.data_mut()[300] = round;
                    guard.mark_dirty();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        manager.flush_all_pages().unwrap();
        for tid in 0..THREADS {
            let mut raw = vec![0u8; BLCKSZ];
            manager
                .disk_manager()
                .read_block(tid as BlockNumber, &mut raw)
                .unwrap();
            assert_eq!(raw[300], 39);
        }
    }
}
