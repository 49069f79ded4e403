mod slotted_page;

pub use slotted_page::{
    max_align, ItemId, SlottedPage, ITEM_ID_SIZE, LP_DEAD, LP_NORMAL, LP_REDIRECT, LP_UNUSED,
    MAXIMUM_ALIGNOF, PAGE_HEADER_SIZE,
};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical block size of every relation file.
pub const BLCKSZ: usize = 8192;

pub type BlockNumber = u32;
pub const INVALID_BLOCK_NUMBER: BlockNumber = u32::MAX;

pub type OffsetNumber = u16;
pub const INVALID_OFFSET_NUMBER: OffsetNumber = 0;
pub const FIRST_OFFSET_NUMBER: OffsetNumber = 1;
pub const MAX_OFFSET_NUMBER: OffsetNumber = (BLCKSZ / ITEM_ID_SIZE) as OffsetNumber;

/// Heap (or child page) address stored in every index tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemPointer {
    pub block: BlockNumber,
    pub offset: OffsetNumber,
}

impl ItemPointer {
    pub const fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }

    pub fn invalid() -> Self {
        Self::new(INVALID_BLOCK_NUMBER, INVALID_OFFSET_NUMBER)
    }

    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK_NUMBER
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}
