//! Everything an index operation needs to touch the relation: buffers, free
//! space map, WAL or fake LSNs, the visibility horizon and cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::{BufferManager, ReadPageGuard, WritePageGuard};
use crate::config::RelPersistence;
use crate::error::{GistError, GistResult};
use crate::index::gist::page::GistPage;
use crate::index::gist::state::GistState;
use crate::index::gist::xlog::{GistWalRecord, PageReuseRecord};
use crate::recovery::{Lsn, ResourceManagerId, WalManager};
use crate::storage::fsm::FreeSpaceMap;
use crate::storage::page::BlockNumber;
use crate::transaction::TransactionHorizon;

/// First LSN handed out to relations that are not WAL-logged.
pub const FIRST_NORMAL_UNLOGGED_LSN: Lsn = 1000;

/// Shared cancellation flag, checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> GistResult<()> {
        if self.is_cancelled() {
            Err(GistError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Where page LSNs come from when changes are not WAL-logged.
#[derive(Debug)]
pub enum FakeLsnSource {
    /// Temporary relations: a counter private to this handle.
    Local(AtomicU64),
    /// Unlogged relations: a counter shared by every handle and carried
    /// across clean restarts in the control file.
    Shared(Arc<AtomicU64>),
    /// Permanent relations built without WAL: LSNs must stay distinct and
    /// below the next real record, so a dummy record is written whenever the
    /// insert position has not moved since the last call.
    AssignLsn {
        wal: Arc<WalManager>,
        last: Mutex<Lsn>,
    },
}

impl FakeLsnSource {
    pub fn local() -> Self {
        FakeLsnSource::Local(AtomicU64::new(FIRST_NORMAL_UNLOGGED_LSN))
    }

    pub fn shared(counter: Arc<AtomicU64>) -> Self {
        FakeLsnSource::Shared(counter)
    }

    pub fn assign_lsn(wal: Arc<WalManager>) -> Self {
        FakeLsnSource::AssignLsn {
            wal,
            last: Mutex::new(0),
        }
    }

    pub fn next(&self) -> GistResult<Lsn> {
        match self {
            FakeLsnSource::Local(counter) => Ok(counter.fetch_add(1, Ordering::AcqRel)),
            FakeLsnSource::Shared(counter) => Ok(counter.fetch_add(1, Ordering::AcqRel)),
            FakeLsnSource::AssignLsn { wal, last } => {
                let mut last = last.lock();
                let mut current = wal.insert_lsn();
                if *last != 0 && *last == current {
                    current = wal
                        .append(
                            ResourceManagerId::Gist,
                            GistWalRecord::AssignLsn.info(),
                            &GistWalRecord::AssignLsn.encode(),
                        )?
                        .end_lsn;
                }
                *last = current;
                Ok(current)
            }
        }
    }
}

pub struct GistRelation {
    bpm: Arc<BufferManager>,
    fsm: Arc<FreeSpaceMap>,
    wal: Option<Arc<WalManager>>,
    fake_lsn: FakeLsnSource,
    horizon: Arc<dyn TransactionHorizon>,
    persistence: RelPersistence,
    state: GistState,
    cancel: CancelToken,
    choose_rng: Mutex<StdRng>,
}

impl std::fmt::Debug for GistRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GistRelation")
            .field("name", &self.state.name())
            .field("persistence", &self.persistence)
            .field("needs_wal", &self.needs_wal())
            .finish()
    }
}

impl GistRelation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bpm: Arc<BufferManager>,
        fsm: Arc<FreeSpaceMap>,
        wal: Option<Arc<WalManager>>,
        fake_lsn: FakeLsnSource,
        horizon: Arc<dyn TransactionHorizon>,
        persistence: RelPersistence,
        state: GistState,
        choose_seed: Option<u64>,
    ) -> Self {
        let seed = choose_seed.unwrap_or_else(process_seed);
        Self {
            bpm,
            fsm,
            wal,
            fake_lsn,
            horizon,
            persistence,
            state,
            cancel: CancelToken::new(),
            choose_rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn state(&self) -> &GistState {
        &self.state
    }

    pub fn bpm(&self) -> &Arc<BufferManager> {
        &self.bpm
    }

    pub fn fsm(&self) -> &Arc<FreeSpaceMap> {
        &self.fsm
    }

    pub fn horizon(&self) -> &Arc<dyn TransactionHorizon> {
        &self.horizon
    }

    pub fn persistence(&self) -> RelPersistence {
        self.persistence
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn check_interrupts(&self) -> GistResult<()> {
        self.cancel.check()
    }

    pub fn needs_wal(&self) -> bool {
        self.wal.is_some()
    }

    /// Writes `record` and returns the LSN to stamp on the changed pages.
    pub fn xlog_insert(&self, record: &GistWalRecord) -> GistResult<Lsn> {
        let wal = self.wal.as_ref().ok_or_else(|| {
            GistError::Internal(format!(
                "index \"{}\" is not WAL-logged",
                self.state.name()
            ))
        })?;
        Ok(wal
            .append(ResourceManagerId::Gist, record.info(), &record.encode())?
            .end_lsn)
    }

    /// LSN for a page change: the record's when WAL-logged, a fake one otherwise.
    pub fn log_or_fake(&self, record: impl FnOnce() -> GistWalRecord) -> GistResult<Lsn> {
        if self.needs_wal() {
            self.xlog_insert(&record())
        } else {
            self.fake_lsn.next()
        }
    }

    pub fn fake_lsn(&self) -> GistResult<Lsn> {
        self.fake_lsn.next()
    }

    /// Current insert position; every later page change is stamped above it.
    pub fn insert_lsn(&self) -> GistResult<Lsn> {
        match &self.wal {
            Some(wal) => Ok(wal.insert_lsn()),
            None => self.fake_lsn.next(),
        }
    }

    /// The shared unlogged counter, if this relation uses one.
    pub fn unlogged_lsn(&self) -> Option<Lsn> {
        match &self.fake_lsn {
            FakeLsnSource::Shared(counter) => Some(counter.load(Ordering::Acquire)),
            _ => None,
        }
    }

    /// Fair coin for the choose-subtree tie-break.
    pub fn coin_flip(&self) -> bool {
        self.choose_rng.lock().random::<bool>()
    }

    pub fn read_shared(&self, block: BlockNumber) -> GistResult<ReadPageGuard> {
        self.bpm.fetch_page_read(block)
    }

    pub fn read_exclusive(&self, block: BlockNumber) -> GistResult<WritePageGuard> {
        self.bpm.fetch_page_write(block)
    }

    pub fn num_blocks(&self) -> BlockNumber {
        self.bpm.disk_manager().num_blocks()
    }

    /// Returns an exclusively latched page for a split or a new root: a
    /// recyclable page from the free space map if there is one, otherwise a
    /// fresh block at the end of the relation.
    pub fn new_buffer(&self) -> GistResult<WritePageGuard> {
        while let Some(block) = self.fsm.get_free_page() {
            if block >= self.num_blocks() {
                continue;
            }
            // someone else may have recycled it already
            let Some(guard) = self.bpm.try_fetch_page_write(block)? else {
                continue;
            };
            let page = GistPage::new(guard.data());
            if page.is_new() {
                return Ok(guard);
            }
            page.check(block)?;
            if page.is_recyclable(self.horizon.as_ref()) {
                if self.needs_wal() {
                    let xid = page.delete_xid();
                    self.xlog_insert(&GistWalRecord::PageReuse(PageReuseRecord {
                        block,
                        latest_removed_xid: xid,
                    }))?;
                }
                debug!("index \"{}\" reuses block {}", self.state.name(), block);
                return Ok(guard);
            }
        }
        self.bpm.new_page()
    }
}

fn process_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ ((std::process::id() as u64) << 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use tempfile::TempDir;

    #[test]
    fn local_and_shared_counters_start_above_build_lsn() {
        let local = FakeLsnSource::local();
        assert_eq!(local.next().unwrap(), FIRST_NORMAL_UNLOGGED_LSN);
        assert_eq!(local.next().unwrap(), FIRST_NORMAL_UNLOGGED_LSN + 1);

        let counter = Arc::new(AtomicU64::new(5000));
        let a = FakeLsnSource::shared(counter.clone());
        let b = FakeLsnSource::shared(counter.clone());
        assert_eq!(a.next().unwrap(), 5000);
        assert_eq!(b.next().unwrap(), 5001);
        assert_eq!(counter.load(Ordering::Acquire), 5002);
    }

    #[test]
    fn assign_lsn_emits_record_only_when_insert_position_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Arc::new(
            WalManager::open(WalConfig::default().with_directory(temp_dir.path().join("wal")))
                .unwrap(),
        );
        let source = FakeLsnSource::assign_lsn(wal.clone());
        let first = source.next().unwrap();
        assert_eq!(first, wal.insert_lsn());
        let second = source.next().unwrap();
        assert!(second > first);
        assert_eq!(second, wal.insert_lsn());
        wal.append(ResourceManagerId::Gist, 0, b"other").unwrap();
        let third = source.next().unwrap();
        assert_eq!(third, wal.insert_lsn());
        assert_eq!(wal.read_frames(0).unwrap().len(), 2);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(matches!(clone.check(), Err(GistError::Interrupted)));
        clone.reset();
        assert!(!token.is_cancelled());
    }
}
