//! On-page index tuple layout.
//!
//! ```text
//! +-----------+------------+----------+--------------+-----------------------+
//! | block u32 | offset u16 | info u16 | null bitmap? | [len u32][bytes] ...  |
//! +-----------+------------+----------+--------------+-----------------------+
//! ```
//!
//! `info` holds the MAXALIGNed total size in its low 13 bits plus the
//! has-nulls and has-varwidth bits. The bitmap (one bit per attribute, set
//! when the attribute is present) only exists when some attribute is null;
//! attribute data starts at the next MAXALIGN boundary after it.

use bytes::Bytes;

use crate::error::{GistError, GistResult};
use crate::index::gist::opclass::Datum;
use crate::storage::page::{max_align, BlockNumber, ItemPointer, OffsetNumber};

pub const INDEX_TUPLE_HEADER_SIZE: usize = 8;
pub const INDEX_SIZE_MASK: u16 = 0x1FFF;
pub const INDEX_VAR_MASK: u16 = 0x4000;
pub const INDEX_NULL_MASK: u16 = 0x8000;
pub const INDEX_MAX_SIZE: usize = INDEX_SIZE_MASK as usize;

/// Offset stored in downlinks of internal pages.
pub const TUPLE_IS_VALID: OffsetNumber = 0xFFFF;
/// Offset of a downlink left behind by a split that never completed in an
/// old on-disk format; such a tuple carries no usable key.
pub const TUPLE_IS_INVALID: OffsetNumber = 0xFFFE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTuple {
    data: Vec<u8>,
}

impl IndexTuple {
    /// Builds a tuple from per-attribute values, `None` meaning null.
    pub fn form(tid: ItemPointer, values: &[Option<Datum>]) -> GistResult<Self> {
        let has_nulls = values.iter().any(|v| v.is_none());
        let bitmap_len = if has_nulls { values.len().div_ceil(8) } else { 0 };
        let data_off = if has_nulls {
            max_align(INDEX_TUPLE_HEADER_SIZE + bitmap_len)
        } else {
            INDEX_TUPLE_HEADER_SIZE
        };
        let payload: usize = values.iter().flatten().map(|v| 4 + v.len()).sum();
        let size = max_align(data_off + payload);
        if size > INDEX_MAX_SIZE {
            return Err(GistError::StructuralLimit(format!(
                "index row requires {} bytes, maximum size is {}",
                size, INDEX_MAX_SIZE
            )));
        }

        let mut data = vec![0u8; size];
        let mut info = size as u16;
        if has_nulls {
            info |= INDEX_NULL_MASK;
        }
        if values.iter().any(|v| v.is_some()) {
            info |= INDEX_VAR_MASK;
        }
        data[0..4].copy_from_slice(&tid.block.to_le_bytes());
        data[4..6].copy_from_slice(&tid.offset.to_le_bytes());
        data[6..8].copy_from_slice(&info.to_le_bytes());
        if has_nulls {
            for (i, value) in values.iter().enumerate() {
                if value.is_some() {
                    data[INDEX_TUPLE_HEADER_SIZE + i / 8] |= 1 << (i % 8);
                }
            }
        }
        let mut at = data_off;
        for value in values.iter().flatten() {
            data[at..at + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
            at += 4;
            data[at..at + value.len()].copy_from_slice(value);
            at += value.len();
        }
        Ok(Self { data })
    }

    /// A keyless downlink in the legacy invalid format.
    pub fn invalid(block: BlockNumber, natts: usize) -> GistResult<Self> {
        let nulls = vec![None; natts];
        Self::form(ItemPointer::new(block, TUPLE_IS_INVALID), &nulls)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn info(&self) -> u16 {
        if self.data.len() < INDEX_TUPLE_HEADER_SIZE {
            return 0;
        }
        u16::from_le_bytes([self.data[6], self.data[7]])
    }

    /// Total stored size, header and padding included.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn has_nulls(&self) -> bool {
        self.info() & INDEX_NULL_MASK != 0
    }

    pub fn block_of(bytes: &[u8]) -> BlockNumber {
        if bytes.len() < 4 {
            return crate::storage::page::INVALID_BLOCK_NUMBER;
        }
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn tid(&self) -> ItemPointer {
        if self.data.len() < INDEX_TUPLE_HEADER_SIZE {
            return ItemPointer::invalid();
        }
        ItemPointer::new(
            Self::block_of(&self.data),
            u16::from_le_bytes([self.data[4], self.data[5]]),
        )
    }

    pub fn set_tid(&mut self, tid: ItemPointer) {
        self.data[0..4].copy_from_slice(&tid.block.to_le_bytes());
        self.data[4..6].copy_from_slice(&tid.offset.to_le_bytes());
    }

    pub fn set_block(&mut self, block: BlockNumber) {
        self.data[0..4].copy_from_slice(&block.to_le_bytes());
    }

    pub fn is_invalid(&self) -> bool {
        self.tid().offset == TUPLE_IS_INVALID
    }

    pub fn set_valid(&mut self) {
        self.data[4..6].copy_from_slice(&TUPLE_IS_VALID.to_le_bytes());
    }

    fn attr_is_null(&self, attno: usize) -> bool {
        if !self.has_nulls() {
            return false;
        }
        let byte = self.data[INDEX_TUPLE_HEADER_SIZE + attno / 8];
        byte & (1 << (attno % 8)) == 0
    }

    fn data_offset(&self, natts: usize) -> usize {
        if self.has_nulls() {
            max_align(INDEX_TUPLE_HEADER_SIZE + natts.div_ceil(8))
        } else {
            INDEX_TUPLE_HEADER_SIZE
        }
    }

    /// Decodes every attribute of a tuple that has `natts` columns.
    pub fn attrs(&self, natts: usize) -> GistResult<Vec<Option<Datum>>> {
        let mut values = Vec::with_capacity(natts);
        let mut at = self.data_offset(natts);
        for attno in 0..natts {
            if self.attr_is_null(attno) {
                values.push(None);
                continue;
            }
            let (value, next) = self.read_attr(at)?;
            values.push(Some(value));
            at = next;
        }
        Ok(values)
    }

    /// Decodes attribute `attno` (0-based) of a tuple with `natts` columns.
    pub fn attr(&self, attno: usize, natts: usize) -> GistResult<Option<Datum>> {
        if attno >= natts {
            return Err(GistError::Internal(format!(
                "attribute {} out of range for tuple with {} columns",
                attno, natts
            )));
        }
        let mut at = self.data_offset(natts);
        for i in 0..attno {
            if !self.attr_is_null(i) {
                let (_, next) = self.read_attr(at)?;
                at = next;
            }
        }
        if self.attr_is_null(attno) {
            return Ok(None);
        }
        Ok(Some(self.read_attr(at)?.0))
    }

    fn read_attr(&self, at: usize) -> GistResult<(Datum, usize)> {
        let end = at + 4;
        if end > self.data.len() {
            return Err(GistError::Internal(format!(
                "index tuple of {} bytes truncated at attribute header {}",
                self.data.len(),
                at
            )));
        }
        let len = u32::from_le_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ]) as usize;
        if end + len > self.data.len() {
            return Err(GistError::Internal(format!(
                "index tuple of {} bytes truncated at attribute data {}",
                self.data.len(),
                end
            )));
        }
        Ok((Bytes::copy_from_slice(&self.data[end..end + len]), end + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datum(s: &str) -> Option<Datum> {
        Some(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn attributes_survive_with_and_without_nulls() {
        let tid = ItemPointer::new(42, 7);
        let full = IndexTuple::form(tid, &[datum("abc"), datum("de")]).unwrap();
        assert!(!full.has_nulls());
        assert_eq!(full.size() % 8, 0);
        assert_eq!(full.tid(), tid);
        assert_eq!(full.attrs(2).unwrap(), vec![datum("abc"), datum("de")]);

        let sparse = IndexTuple::form(tid, &[None, datum("x"), None]).unwrap();
        assert!(sparse.has_nulls());
        assert_eq!(sparse.attr(0, 3).unwrap(), None);
        assert_eq!(sparse.attr(1, 3).unwrap(), datum("x"));
        assert_eq!(sparse.attr(2, 3).unwrap(), None);
        assert!(sparse.attr(3, 3).is_err());
    }

    #[test]
    fn oversized_rows_are_rejected() {
        let big = Some(Bytes::from(vec![0u8; 9000]));
        let err = IndexTuple::form(ItemPointer::new(1, 1), &[big]).unwrap_err();
        assert!(err
            .to_string()
            .contains("maximum size is 8191"));
    }

    #[test]
    fn invalid_marker_round_trips_through_bytes() {
        let mut tuple = IndexTuple::invalid(9, 2).unwrap();
        assert!(tuple.is_invalid());
        let copy = IndexTuple::from_bytes(tuple.as_bytes());
        assert_eq!(copy.tid().block, 9);
        assert!(copy.is_invalid());
        tuple.set_valid();
        assert!(!tuple.is_invalid());
        assert_eq!(tuple.tid().offset, TUPLE_IS_VALID);
        assert_eq!(IndexTuple::block_of(tuple.as_bytes()), 9);
    }
}
