//! Slotted page: 24-byte header, line pointers growing up, tuples growing down
//! and an access-method specific special area at the tail.

use crate::error::{GistError, GistResult};
use crate::recovery::Lsn;
use crate::storage::page::{BlockNumber, OffsetNumber, BLCKSZ, FIRST_OFFSET_NUMBER};

pub const PAGE_HEADER_SIZE: usize = 24;
pub const ITEM_ID_SIZE: usize = 4;
pub const MAXIMUM_ALIGNOF: usize = 8;

pub const LP_UNUSED: u8 = 0;
pub const LP_NORMAL: u8 = 1;
pub const LP_REDIRECT: u8 = 2;
pub const LP_DEAD: u8 = 3;

const PAGE_LAYOUT_VERSION: u16 = 4;
const PD_VALID_FLAG_BITS: u16 = 0x0007;

const OFF_LSN: usize = 0;
const OFF_CHECKSUM: usize = 8;
const OFF_FLAGS: usize = 10;
const OFF_LOWER: usize = 12;
const OFF_UPPER: usize = 14;
const OFF_SPECIAL: usize = 16;
const OFF_VERSION: usize = 18;
const OFF_PRUNE_XID: usize = 20;

pub const fn max_align(len: usize) -> usize {
    (len + MAXIMUM_ALIGNOF - 1) & !(MAXIMUM_ALIGNOF - 1)
}

/// Line pointer packed as `{off:15, flags:2, len:15}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemId {
    pub off: u16,
    pub flags: u8,
    pub len: u16,
}

impl ItemId {
    pub fn decode(raw: u32) -> Self {
        Self {
            off: (raw & 0x7FFF) as u16,
            flags: ((raw >> 15) & 0x3) as u8,
            len: ((raw >> 17) & 0x7FFF) as u16,
        }
    }

    pub fn encode(&self) -> u32 {
        (self.off as u32 & 0x7FFF) | ((self.flags as u32 & 0x3) << 15) | ((self.len as u32 & 0x7FFF) << 17)
    }

    pub fn is_dead(&self) -> bool {
        self.flags == LP_DEAD
    }

    pub fn is_used(&self) -> bool {
        self.flags != LP_UNUSED
    }

    pub fn has_storage(&self) -> bool {
        self.len != 0
    }
}

#[derive(Debug)]
pub struct SlottedPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn read_u16(&self, at: usize) -> u16 {
        let b = self.bytes();
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    pub fn lsn(&self) -> Lsn {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes()[OFF_LSN..OFF_LSN + 8]);
        Lsn::from_le_bytes(raw)
    }

    pub fn checksum(&self) -> u16 {
        self.read_u16(OFF_CHECKSUM)
    }

    pub fn pd_flags(&self) -> u16 {
        self.read_u16(OFF_FLAGS)
    }

    pub fn lower(&self) -> usize {
        self.read_u16(OFF_LOWER) as usize
    }

    pub fn upper(&self) -> usize {
        self.read_u16(OFF_UPPER) as usize
    }

    pub fn special_offset(&self) -> usize {
        self.read_u16(OFF_SPECIAL) as usize
    }

    pub fn special_size(&self) -> usize {
        BLCKSZ.saturating_sub(self.special_offset())
    }

    pub fn prune_xid(&self) -> u32 {
        let b = self.bytes();
        u32::from_le_bytes([
            b[OFF_PRUNE_XID],
            b[OFF_PRUNE_XID + 1],
            b[OFF_PRUNE_XID + 2],
            b[OFF_PRUNE_XID + 3],
        ])
    }

    /// A page that was never initialised (fresh extension or zeroed block).
    pub fn is_new(&self) -> bool {
        self.upper() == 0
    }

    pub fn is_all_zero(&self) -> bool {
        self.bytes().iter().all(|b| *b == 0)
    }

    /// Sanity check of the header fields.
    pub fn header_is_valid(&self) -> bool {
        let lower = self.lower();
        let upper = self.upper();
        let special = self.special_offset();
        (self.pd_flags() & !PD_VALID_FLAG_BITS) == 0
            && lower >= PAGE_HEADER_SIZE
            && lower <= upper
            && upper <= special
            && special <= BLCKSZ
            && special == max_align(special)
            && self.read_u16(OFF_VERSION) & 0x00FF == PAGE_LAYOUT_VERSION
    }

    pub fn max_offset(&self) -> OffsetNumber {
        let lower = self.lower();
        if lower <= PAGE_HEADER_SIZE {
            0
        } else {
            ((lower - PAGE_HEADER_SIZE) / ITEM_ID_SIZE) as OffsetNumber
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max_offset() == 0
    }

    fn item_id_pos(off: OffsetNumber) -> usize {
        PAGE_HEADER_SIZE + (off as usize - 1) * ITEM_ID_SIZE
    }

    pub fn item_id(&self, off: OffsetNumber) -> ItemId {
        debug_assert!(off >= FIRST_OFFSET_NUMBER && off <= self.max_offset());
        let at = Self::item_id_pos(off);
        let b = self.bytes();
        ItemId::decode(u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]))
    }

    /// Raw tuple bytes behind a line pointer. Out-of-range pointers yield an
    /// empty slice; callers validate the header before trusting contents.
    pub fn item(&self, off: OffsetNumber) -> &[u8] {
        let id = self.item_id(off);
        let start = id.off as usize;
        let end = start + id.len as usize;
        self.bytes().get(start..end).unwrap_or(&[])
    }

    pub fn special(&self) -> &[u8] {
        let start = self.special_offset().min(BLCKSZ);
        &self.bytes()[start..BLCKSZ]
    }

    /// Free space left for one more tuple plus its line pointer.
    pub fn free_space(&self) -> usize {
        let space = self.upper().saturating_sub(self.lower());
        space.saturating_sub(ITEM_ID_SIZE)
    }

    pub fn exact_free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// CRC32 of the block folded into 16 bits, never zero.
    pub fn compute_checksum(&self, block: BlockNumber) -> u16 {
        let b = self.bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&block.to_le_bytes());
        hasher.update(&b[..OFF_CHECKSUM]);
        hasher.update(&b[OFF_CHECKSUM + 2..BLCKSZ]);
        ((hasher.finalize() % 65535) + 1) as u16
    }

    pub fn verify_checksum(&self, block: BlockNumber) -> bool {
        if self.is_new() {
            return self.is_all_zero();
        }
        self.checksum() == self.compute_checksum(block)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn write_u16(&mut self, at: usize, value: u16) {
        self.bytes_mut()[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn init(&mut self, special_size: usize) {
        let special_size = max_align(special_size);
        let buf = self.bytes_mut();
        buf[..BLCKSZ].fill(0);
        self.write_u16(OFF_LOWER, PAGE_HEADER_SIZE as u16);
        self.write_u16(OFF_UPPER, (BLCKSZ - special_size) as u16);
        self.write_u16(OFF_SPECIAL, (BLCKSZ - special_size) as u16);
        self.write_u16(OFF_VERSION, (BLCKSZ as u16) | PAGE_LAYOUT_VERSION);
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.bytes_mut()[OFF_LSN..OFF_LSN + 8].copy_from_slice(&lsn.to_le_bytes());
    }

    pub fn set_checksum(&mut self, block: BlockNumber) {
        let sum = self.compute_checksum(block);
        self.write_u16(OFF_CHECKSUM, sum);
    }

    pub fn set_lower(&mut self, lower: usize) {
        self.write_u16(OFF_LOWER, lower as u16);
    }

    pub fn set_prune_xid(&mut self, xid: u32) {
        self.bytes_mut()[OFF_PRUNE_XID..OFF_PRUNE_XID + 4].copy_from_slice(&xid.to_le_bytes());
    }

    pub fn special_mut(&mut self) -> &mut [u8] {
        let start = self.special_offset().min(BLCKSZ);
        &mut self.bytes_mut()[start..BLCKSZ]
    }

    /// Writes `len` raw bytes right after the page header, used by layouts
    /// that overlay a fixed struct on a page without line pointers.
    pub fn header_tail_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.bytes_mut()[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len]
    }

    pub fn set_item_id(&mut self, off: OffsetNumber, id: ItemId) {
        let at = Self::item_id_pos(off);
        self.bytes_mut()[at..at + ITEM_ID_SIZE].copy_from_slice(&id.encode().to_le_bytes());
    }

    pub fn mark_dead(&mut self, off: OffsetNumber) {
        let mut id = self.item_id(off);
        id.flags = LP_DEAD;
        self.set_item_id(off, id);
    }

    /// Appends a tuple after the last line pointer.
    pub fn add_item(&mut self, item: &[u8]) -> GistResult<OffsetNumber> {
        let aligned = max_align(item.len());
        let lower = self.lower();
        let upper = self.upper();
        if item.len() > 0x7FFF || lower + ITEM_ID_SIZE + aligned > upper {
            return Err(GistError::Storage(format!(
                "failed to add item of size {} to page with {} bytes free",
                item.len(),
                self.exact_free_space()
            )));
        }
        let new_upper = upper - aligned;
        let buf = self.bytes_mut();
        buf[new_upper..new_upper + item.len()].copy_from_slice(item);
        buf[new_upper + item.len()..new_upper + aligned].fill(0);
        let off = self.max_offset() + 1;
        self.write_u16(OFF_LOWER, (lower + ITEM_ID_SIZE) as u16);
        self.write_u16(OFF_UPPER, new_upper as u16);
        self.set_item_id(
            off,
            ItemId {
                off: new_upper as u16,
                flags: LP_NORMAL,
                len: item.len() as u16,
            },
        );
        Ok(off)
    }

    fn collect_items(&self) -> Vec<(u8, Vec<u8>)> {
        (FIRST_OFFSET_NUMBER..=self.max_offset())
            .map(|off| (self.item_id(off).flags, self.item(off).to_vec()))
            .collect()
    }

    /// Re-lays out the tuple area with the given items, keeping header and
    /// special space intact.
    fn relayout(&mut self, items: &[(u8, Vec<u8>)]) -> GistResult<()> {
        let special = self.special_offset();
        let needed: usize = items
            .iter()
            .map(|(_, data)| ITEM_ID_SIZE + max_align(data.len()))
            .sum();
        if PAGE_HEADER_SIZE + needed > special {
            return Err(GistError::Storage(format!(
                "items need {} bytes but page has room for {}",
                needed,
                special - PAGE_HEADER_SIZE
            )));
        }
        self.bytes_mut()[PAGE_HEADER_SIZE..special].fill(0);
        let mut upper = special;
        for (idx, (flags, data)) in items.iter().enumerate() {
            let aligned = max_align(data.len());
            upper -= aligned;
            self.bytes_mut()[upper..upper + data.len()].copy_from_slice(data);
            self.set_item_id(
                (idx + 1) as OffsetNumber,
                ItemId {
                    off: upper as u16,
                    flags: *flags,
                    len: data.len() as u16,
                },
            );
        }
        self.write_u16(
            OFF_LOWER,
            (PAGE_HEADER_SIZE + items.len() * ITEM_ID_SIZE) as u16,
        );
        self.write_u16(OFF_UPPER, upper as u16);
        Ok(())
    }

    /// Removes one tuple, shifting later line pointers down by one.
    pub fn tuple_delete(&mut self, off: OffsetNumber) -> GistResult<()> {
        self.multi_delete(&[off])
    }

    /// Removes a set of tuples in one pass; offsets may come in any order.
    pub fn multi_delete(&mut self, offsets: &[OffsetNumber]) -> GistResult<()> {
        let max = self.max_offset();
        if let Some(bad) = offsets.iter().find(|o| **o == 0 || **o > max) {
            return Err(GistError::Storage(format!(
                "invalid offset {} to delete, page has {} items",
                bad, max
            )));
        }
        let items: Vec<(u8, Vec<u8>)> = self
            .collect_items()
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !offsets.contains(&((*idx + 1) as OffsetNumber)))
            .map(|(_, item)| item)
            .collect();
        self.relayout(&items)
    }

    /// Replaces the tuple at `off` in place, keeping its offset number.
    pub fn tuple_overwrite(&mut self, off: OffsetNumber, item: &[u8]) -> GistResult<()> {
        let max = self.max_offset();
        if off == 0 || off > max {
            return Err(GistError::Storage(format!(
                "invalid offset {} to overwrite, page has {} items",
                off, max
            )));
        }
        let mut items = self.collect_items();
        items[off as usize - 1] = (LP_NORMAL, item.to_vec());
        self.relayout(&items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page() -> Vec<u8> {
        let mut buf = vec![0u8; BLCKSZ];
        SlottedPage::new(&mut buf[..]).init(16);
        buf
    }

    #[test]
    fn init_sets_bounds_and_layout_version() {
        let buf = fresh_page();
        let page = SlottedPage::new(&buf[..]);
        assert!(page.header_is_valid());
        assert!(!page.is_new());
        assert_eq!(page.lower(), PAGE_HEADER_SIZE);
        assert_eq!(page.special_offset(), BLCKSZ - 16);
        assert_eq!(page.special().len(), 16);
        assert_eq!(page.max_offset(), 0);
    }

    #[test]
    fn add_and_delete_items_keep_order() {
        let mut buf = fresh_page();
        let mut page = SlottedPage::new(&mut buf[..]);
        for i in 0..5u8 {
            let off = page.add_item(&[i; 13]).unwrap();
            assert_eq!(off, (i + 1) as OffsetNumber);
        }
        page.mark_dead(4);
        page.multi_delete(&[3, 1]).unwrap();
        assert_eq!(page.max_offset(), 3);
        assert_eq!(page.item(1), &[1u8; 13][..]);
        assert_eq!(page.item(2), &[3u8; 13][..]);
        assert!(page.item_id(2).is_dead());
        assert_eq!(page.item(3), &[4u8; 13][..]);

        page.tuple_overwrite(1, &[9u8; 40]).unwrap();
        assert_eq!(page.item(1), &[9u8; 40][..]);
        assert_eq!(page.item(2), &[3u8; 13][..]);
        assert!(page.header_is_valid());
    }

    #[test]
    fn add_item_reports_full_page() {
        let mut buf = fresh_page();
        let mut page = SlottedPage::new(&mut buf[..]);
        let item = vec![7u8; 1000];
        let mut added = 0;
        while page.add_item(&item).is_ok() {
            added += 1;
        }
        assert_eq!(added, 8);
        assert!(page.free_space() < 1008);
    }

    #[test]
    fn checksum_detects_bit_flip() {
        let mut buf = fresh_page();
        {
            let mut page = SlottedPage::new(&mut buf[..]);
            page.add_item(b"payload").unwrap();
            page.set_checksum(3);
        }
        assert!(SlottedPage::new(&buf[..]).verify_checksum(3));
        assert!(!SlottedPage::new(&buf[..]).verify_checksum(4));
        buf[BLCKSZ - 100] ^= 0x40;
        assert!(!SlottedPage::new(&buf[..]).verify_checksum(3));
    }
}
