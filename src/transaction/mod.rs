use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub type FullTransactionId = u64;

pub const INVALID_FULL_XID: FullTransactionId = 0;
pub const FIRST_NORMAL_FULL_XID: FullTransactionId = 3;

/// Visibility horizon used to decide when a deleted index page can be reused.
pub trait TransactionHorizon: Send + Sync {
    /// The xid the next transaction will receive.
    fn next_full_xid(&self) -> FullTransactionId;

    /// Oldest xid any running snapshot may still consider in progress.
    fn global_xmin(&self) -> FullTransactionId;

    /// True once no snapshot can see anything stamped with `xid`.
    fn is_removable(&self, xid: FullTransactionId) -> bool {
        xid < self.global_xmin()
    }
}

/// Counter-based xid source with registered snapshots.
#[derive(Debug)]
pub struct TransactionManager {
    next_xid: AtomicU64,
    /// Snapshot xmin -> number of live snapshots holding it.
    snapshots: Mutex<BTreeMap<FullTransactionId, usize>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::starting_at(FIRST_NORMAL_FULL_XID)
    }

    pub fn starting_at(next_xid: FullTransactionId) -> Self {
        Self {
            next_xid: AtomicU64::new(next_xid.max(FIRST_NORMAL_FULL_XID)),
            snapshots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn assign_xid(&self) -> FullTransactionId {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a snapshot; the horizon cannot pass its xmin until the
    /// returned guard is dropped.
    pub fn snapshot(self: &Arc<Self>) -> Snapshot {
        let mut snapshots = self.snapshots.lock();
        let xmin = self.next_xid.load(Ordering::SeqCst);
        *snapshots.entry(xmin).or_insert(0) += 1;
        Snapshot {
            xmin,
            manager: self.clone(),
        }
    }

    pub fn active_snapshots(&self) -> usize {
        self.snapshots.lock().values().sum()
    }

    fn release(&self, xmin: FullTransactionId) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&xmin) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&xmin);
            }
        }
    }
}

impl TransactionHorizon for TransactionManager {
    fn next_full_xid(&self) -> FullTransactionId {
        self.next_xid.load(Ordering::SeqCst)
    }

    fn global_xmin(&self) -> FullTransactionId {
        let snapshots = self.snapshots.lock();
        match snapshots.keys().next() {
            Some(xmin) => *xmin,
            None => self.next_xid.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
pub struct Snapshot {
    xmin: FullTransactionId,
    manager: Arc<TransactionManager>,
}

impl Snapshot {
    pub fn xmin(&self) -> FullTransactionId {
        self.xmin
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.manager.release(self.xmin);
    }
}
