//! GiST view over a slotted page: the 16-byte opaque trailer, page flags and
//! the deleted-page overlay.

use std::ops::{Deref, DerefMut};

use crate::error::{GistError, GistResult};
use crate::index::gist::tuple::IndexTuple;
use crate::recovery::Lsn;
use crate::storage::page::{
    max_align, BlockNumber, OffsetNumber, SlottedPage, BLCKSZ, FIRST_OFFSET_NUMBER,
    INVALID_BLOCK_NUMBER, ITEM_ID_SIZE, PAGE_HEADER_SIZE,
};
use crate::transaction::{FullTransactionId, TransactionHorizon, FIRST_NORMAL_FULL_XID};

pub const GIST_ROOT_BLKNO: BlockNumber = 0;

pub const F_LEAF: u16 = 1 << 0;
pub const F_DELETED: u16 = 1 << 1;
pub const F_TUPLES_DELETED: u16 = 1 << 2;
pub const F_FOLLOW_RIGHT: u16 = 1 << 3;
pub const F_HAS_GARBAGE: u16 = 1 << 4;

pub const GIST_PAGE_ID: u16 = 0xFF81;
pub const GIST_OPAQUE_SIZE: usize = 16;

/// Tuple area of an empty page, line pointers included.
pub const GIST_PAGE_SIZE: usize = BLCKSZ - PAGE_HEADER_SIZE - GIST_OPAQUE_SIZE;

pub const GIST_MAX_SPLIT_PAGES: usize = 75;

/// LSN stamped on pages written by an index build before WAL logging starts.
pub const GIST_BUILD_LSN: Lsn = 1;

const OPAQUE_NSN: usize = 0;
const OPAQUE_RIGHTLINK: usize = 8;
const OPAQUE_FLAGS: usize = 12;
const OPAQUE_PAGE_ID: usize = 14;

/// Size of the contents written behind the header of a deleted page.
const DELETED_CONTENTS_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GistPageOpaque {
    pub nsn: Lsn,
    pub rightlink: BlockNumber,
    pub flags: u16,
    pub page_id: u16,
}

pub struct GistPage<B> {
    inner: SlottedPage<B>,
}

impl<B> Deref for GistPage<B> {
    type Target = SlottedPage<B>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<B> DerefMut for GistPage<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<B: AsRef<[u8]>> GistPage<B> {
    pub fn new(buf: B) -> Self {
        Self {
            inner: SlottedPage::new(buf),
        }
    }

    fn opaque_u16(&self, at: usize) -> u16 {
        let s = self.special();
        if s.len() < GIST_OPAQUE_SIZE {
            return 0;
        }
        u16::from_le_bytes([s[at], s[at + 1]])
    }

    pub fn opaque(&self) -> GistPageOpaque {
        GistPageOpaque {
            nsn: self.nsn(),
            rightlink: self.rightlink(),
            flags: self.flags(),
            page_id: self.opaque_u16(OPAQUE_PAGE_ID),
        }
    }

    pub fn nsn(&self) -> Lsn {
        let s = self.special();
        if s.len() < GIST_OPAQUE_SIZE {
            return 0;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&s[OPAQUE_NSN..OPAQUE_NSN + 8]);
        u64::from_le_bytes(raw)
    }

    pub fn rightlink(&self) -> BlockNumber {
        let s = self.special();
        if s.len() < GIST_OPAQUE_SIZE {
            return INVALID_BLOCK_NUMBER;
        }
        u32::from_le_bytes([
            s[OPAQUE_RIGHTLINK],
            s[OPAQUE_RIGHTLINK + 1],
            s[OPAQUE_RIGHTLINK + 2],
            s[OPAQUE_RIGHTLINK + 3],
        ])
    }

    pub fn flags(&self) -> u16 {
        self.opaque_u16(OPAQUE_FLAGS)
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & F_LEAF != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags() & F_DELETED != 0
    }

    pub fn follow_right(&self) -> bool {
        self.flags() & F_FOLLOW_RIGHT != 0
    }

    pub fn has_garbage(&self) -> bool {
        self.flags() & F_HAS_GARBAGE != 0
    }

    pub fn tuples_deleted(&self) -> bool {
        self.flags() & F_TUPLES_DELETED != 0
    }

    /// Xid stamped by page deletion. Pages deleted by older layouts carry no
    /// xid and are treated as deleted long ago.
    pub fn delete_xid(&self) -> FullTransactionId {
        let at = max_align(PAGE_HEADER_SIZE);
        if self.lower() < at + DELETED_CONTENTS_SIZE {
            return FIRST_NORMAL_FULL_XID;
        }
        let b = self.bytes();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b[at..at + DELETED_CONTENTS_SIZE]);
        u64::from_le_bytes(raw)
    }

    /// Validates the page as read through a buffer. New pages are rejected
    /// here; callers that expect them must test `is_new` first.
    pub fn check(&self, block: BlockNumber) -> GistResult<()> {
        if self.is_new() {
            return Err(GistError::corrupted(block, "contains unexpected zero page"));
        }
        if !self.header_is_valid() || self.special_size() != GIST_OPAQUE_SIZE {
            return Err(GistError::corrupted(block, "contains corrupted page"));
        }
        if self.opaque_u16(OPAQUE_PAGE_ID) != GIST_PAGE_ID {
            return Err(GistError::corrupted(block, "contains corrupted page"));
        }
        Ok(())
    }

    /// True when the page can be handed out again: never initialised, or
    /// deleted so long ago that no snapshot can still follow a downlink to it.
    pub fn is_recyclable(&self, horizon: &dyn TransactionHorizon) -> bool {
        if self.is_new() {
            return true;
        }
        self.is_deleted() && horizon.is_removable(self.delete_xid())
    }

    /// Number of live line pointers; zero on deleted pages.
    pub fn tuple_count(&self) -> OffsetNumber {
        if self.is_deleted() {
            0
        } else {
            self.max_offset()
        }
    }

    pub fn tuple(&self, off: OffsetNumber) -> IndexTuple {
        IndexTuple::from_bytes(self.item(off))
    }

    /// Child block referenced by the tuple at `off`.
    pub fn downlink_block(&self, off: OffsetNumber) -> BlockNumber {
        IndexTuple::block_of(self.item(off))
    }

    /// Copies every tuple off the page, in offset order.
    pub fn extract(&self) -> Vec<IndexTuple> {
        (FIRST_OFFSET_NUMBER..=self.tuple_count())
            .map(|off| self.tuple(off))
            .collect()
    }

    /// Whether `itvec` does not fit after optionally removing `todelete`,
    /// keeping `freespace` bytes in reserve.
    pub fn no_space(
        &self,
        itvec: &[IndexTuple],
        todelete: Option<OffsetNumber>,
        freespace: usize,
    ) -> bool {
        let size = freespace
            + itvec
                .iter()
                .map(|t| t.size() + ITEM_ID_SIZE)
                .sum::<usize>();
        let deleted = todelete
            .map(|off| self.item(off).len() + ITEM_ID_SIZE)
            .unwrap_or(0);
        self.free_space() + deleted < size
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> GistPage<B> {
    /// Formats an empty GiST page.
    pub fn init(&mut self, flags: u16) {
        self.inner.init(GIST_OPAQUE_SIZE);
        let s = self.inner.special_mut();
        s[OPAQUE_NSN..OPAQUE_NSN + 8].copy_from_slice(&0u64.to_le_bytes());
        s[OPAQUE_RIGHTLINK..OPAQUE_RIGHTLINK + 4]
            .copy_from_slice(&INVALID_BLOCK_NUMBER.to_le_bytes());
        s[OPAQUE_FLAGS..OPAQUE_FLAGS + 2].copy_from_slice(&flags.to_le_bytes());
        s[OPAQUE_PAGE_ID..OPAQUE_PAGE_ID + 2].copy_from_slice(&GIST_PAGE_ID.to_le_bytes());
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.inner.special_mut()[OPAQUE_FLAGS..OPAQUE_FLAGS + 2]
            .copy_from_slice(&flags.to_le_bytes());
    }

    fn update_flag(&mut self, flag: u16, on: bool) {
        let flags = self.flags();
        self.set_flags(if on { flags | flag } else { flags & !flag });
    }

    pub fn set_leaf(&mut self, leaf: bool) {
        self.update_flag(F_LEAF, leaf);
    }

    pub fn set_follow_right(&mut self, on: bool) {
        self.update_flag(F_FOLLOW_RIGHT, on);
    }

    pub fn set_has_garbage(&mut self, on: bool) {
        self.update_flag(F_HAS_GARBAGE, on);
    }

    pub fn set_tuples_deleted(&mut self, on: bool) {
        self.update_flag(F_TUPLES_DELETED, on);
    }

    pub fn set_nsn(&mut self, nsn: Lsn) {
        self.inner.special_mut()[OPAQUE_NSN..OPAQUE_NSN + 8].copy_from_slice(&nsn.to_le_bytes());
    }

    pub fn set_rightlink(&mut self, rightlink: BlockNumber) {
        self.inner.special_mut()[OPAQUE_RIGHTLINK..OPAQUE_RIGHTLINK + 4]
            .copy_from_slice(&rightlink.to_le_bytes());
    }

    /// Turns an empty leaf into a tombstone carrying `xid`.
    pub fn set_deleted(&mut self, xid: FullTransactionId) {
        self.update_flag(F_DELETED, true);
        let at = max_align(PAGE_HEADER_SIZE);
        self.inner.set_lower(at + DELETED_CONTENTS_SIZE);
        self.inner.header_tail_mut(at - PAGE_HEADER_SIZE + DELETED_CONTENTS_SIZE)
            [at - PAGE_HEADER_SIZE..]
            .copy_from_slice(&xid.to_le_bytes());
    }

    /// Appends tuples after the last line pointer.
    pub fn fill(&mut self, itvec: &[IndexTuple]) -> GistResult<()> {
        for tuple in itvec {
            self.inner.add_item(tuple.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::ItemPointer;
    use bytes::Bytes;
    use crate::transaction::TransactionManager;

    fn leaf_page() -> Vec<u8> {
        let mut buf = vec![0u8; BLCKSZ];
        GistPage::new(&mut buf[..]).init(F_LEAF);
        buf
    }

    #[test]
    fn init_writes_opaque_trailer() {
        let buf = leaf_page();
        let page = GistPage::new(&buf[..]);
        page.check(3).unwrap();
        assert!(page.is_leaf());
        assert!(!page.follow_right());
        assert_eq!(page.rightlink(), INVALID_BLOCK_NUMBER);
        assert_eq!(page.nsn(), 0);
        assert_eq!(page.opaque().page_id, GIST_PAGE_ID);
        assert_eq!(page.free_space(), GIST_PAGE_SIZE - ITEM_ID_SIZE);
    }

    #[test]
    fn check_rejects_zero_and_foreign_pages() {
        let zero = vec![0u8; BLCKSZ];
        let err = GistPage::new(&zero[..]).check(7).unwrap_err();
        assert!(err.to_string().contains("unexpected zero page"));
        assert!(err.to_string().contains("REINDEX"));

        let mut foreign = vec![0u8; BLCKSZ];
        SlottedPage::new(&mut foreign[..]).init(8);
        let err = GistPage::new(&foreign[..]).check(7).unwrap_err();
        assert!(err.to_string().contains("corrupted page"));

        let mut bad_magic = leaf_page();
        let at = BLCKSZ - 2;
        bad_magic[at] = 0;
        assert!(GistPage::new(&bad_magic[..]).check(7).is_err());
    }

    #[test]
    fn flags_toggle_independently() {
        let mut buf = leaf_page();
        let mut page = GistPage::new(&mut buf[..]);
        page.set_follow_right(true);
        page.set_has_garbage(true);
        page.set_nsn(99);
        page.set_rightlink(12);
        assert_eq!(page.flags(), F_LEAF | F_FOLLOW_RIGHT | F_HAS_GARBAGE);
        page.set_follow_right(false);
        assert!(!page.follow_right());
        assert!(page.has_garbage());
        assert_eq!(page.nsn(), 99);
        assert_eq!(page.rightlink(), 12);
    }

    #[test]
    fn deleted_page_carries_xid_until_horizon_passes() {
        let txns = TransactionManager::starting_at(10);
        let mut buf = leaf_page();
        let mut page = GistPage::new(&mut buf[..]);
        page.set_deleted(txns.next_full_xid());
        assert!(page.is_deleted());
        assert_eq!(page.delete_xid(), 10);
        assert_eq!(page.tuple_count(), 0);
        assert!(!page.is_recyclable(&txns));
        txns.assign_xid();
        assert!(page.is_recyclable(&txns));
    }

    #[test]
    fn no_space_accounts_for_replaced_tuple() {
        let mut buf = leaf_page();
        let mut page = GistPage::new(&mut buf[..]);
        let big = IndexTuple::form(
            ItemPointer::new(1, 1),
            &[Some(Bytes::from(vec![7u8; 4000]))],
        )
        .unwrap();
        page.fill(&[big.clone()]).unwrap();
        assert!(page.no_space(&[big.clone(), big.clone()], None, 0));
        assert!(!page.no_space(&[big.clone()], None, 0));
        assert!(!page.no_space(&[big.clone(), big.clone()], Some(1), 0));
        assert!(page.no_space(&[big], None, 4000));
        assert_eq!(page.extract().len(), 1);
    }
}
