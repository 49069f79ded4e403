//! GiST WAL records and their redo routines.
//!
//! The `info` byte of a frame carries the record kind in its low nibble and
//! the flag bits below in its high nibble. Bodies are little-endian:
//!
//! ```text
//! PAGE_UPDATE  block u32, ntodelete u16, ntoadd u16, [left_child u32],
//!              ntodelete x offset u16, ntoadd x tuple
//! PAGE_SPLIT   orig_rightlink u32, orig_nsn u64, npages u16, [left_child u32],
//!              npages x { block u32, ntuples u16, ntuples x tuple }
//! PAGE_DELETE  leaf u32, parent u32, delete_xid u64, downlink_offset u16
//! PAGE_REUSE   block u32, latest_removed_xid u64
//! ASSIGN_LSN   dummy u32
//! ```
//!
//! Every page change is guarded by the page LSN, so replaying a record whose
//! effects already reached disk is a no-op.

use std::convert::TryFrom;

use crate::error::{GistError, GistResult};
use crate::index::gist::page::{GistPage, F_LEAF, GIST_ROOT_BLKNO};
use crate::index::gist::tuple::{IndexTuple, INDEX_SIZE_MASK, INDEX_TUPLE_HEADER_SIZE};
use crate::recovery::{Lsn, RedoContext, ResourceManager, WalFrame};
use crate::storage::codec::CommonCodec;
use crate::storage::page::{BlockNumber, OffsetNumber, INVALID_BLOCK_NUMBER};
use crate::transaction::FullTransactionId;

pub const XLOG_GIST_KIND_MASK: u8 = 0x0F;
/// The page being split was a leaf.
pub const XLOG_GIST_ORIG_LEAF: u8 = 0x10;
/// Split pages other than the last carry FOLLOW_RIGHT.
pub const XLOG_GIST_MARK_FOLLOW_RIGHT: u8 = 0x20;
/// The record completes a child split: clear its FOLLOW_RIGHT, stamp its NSN.
pub const XLOG_GIST_HAS_LEFT_CHILD: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GistRecordKind {
    PageUpdate = 0,
    PageDelete = 1,
    PageReuse = 2,
    PageSplit = 3,
    AssignLsn = 4,
}

impl TryFrom<u8> for GistRecordKind {
    type Error = GistError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & XLOG_GIST_KIND_MASK {
            0 => Ok(GistRecordKind::PageUpdate),
            1 => Ok(GistRecordKind::PageDelete),
            2 => Ok(GistRecordKind::PageReuse),
            3 => Ok(GistRecordKind::PageSplit),
            4 => Ok(GistRecordKind::AssignLsn),
            other => Err(GistError::Wal(format!(
                "gist_redo: unknown op code {}",
                other
            ))),
        }
    }
}

/// Deletes and/or appends tuples on one page. One deleted offset plus one
/// tuple means an in-place overwrite.
#[derive(Debug, Clone, PartialEq)]
pub struct PageUpdateRecord {
    pub block: BlockNumber,
    pub todelete: Vec<OffsetNumber>,
    pub tuples: Vec<IndexTuple>,
    pub left_child: Option<BlockNumber>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitPageImage {
    pub block: BlockNumber,
    pub tuples: Vec<IndexTuple>,
}

/// Full contents of every page produced by one split, original page first.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSplitRecord {
    pub orig_rightlink: BlockNumber,
    pub orig_nsn: Lsn,
    pub orig_leaf: bool,
    pub mark_follow_right: bool,
    pub left_child: Option<BlockNumber>,
    pub pages: Vec<SplitPageImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDeleteRecord {
    pub leaf: BlockNumber,
    pub parent: BlockNumber,
    pub delete_xid: FullTransactionId,
    pub downlink_offset: OffsetNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageReuseRecord {
    pub block: BlockNumber,
    pub latest_removed_xid: FullTransactionId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GistWalRecord {
    PageUpdate(PageUpdateRecord),
    PageDelete(PageDeleteRecord),
    PageReuse(PageReuseRecord),
    PageSplit(PageSplitRecord),
    AssignLsn,
}

impl GistWalRecord {
    pub fn kind(&self) -> GistRecordKind {
        match self {
            GistWalRecord::PageUpdate(_) => GistRecordKind::PageUpdate,
            GistWalRecord::PageDelete(_) => GistRecordKind::PageDelete,
            GistWalRecord::PageReuse(_) => GistRecordKind::PageReuse,
            GistWalRecord::PageSplit(_) => GistRecordKind::PageSplit,
            GistWalRecord::AssignLsn => GistRecordKind::AssignLsn,
        }
    }

    pub fn info(&self) -> u8 {
        let mut info = self.kind() as u8;
        match self {
            GistWalRecord::PageUpdate(rec) if rec.left_child.is_some() => {
                info |= XLOG_GIST_HAS_LEFT_CHILD;
            }
            GistWalRecord::PageSplit(rec) => {
                if rec.orig_leaf {
                    info |= XLOG_GIST_ORIG_LEAF;
                }
                if rec.mark_follow_right {
                    info |= XLOG_GIST_MARK_FOLLOW_RIGHT;
                }
                if rec.left_child.is_some() {
                    info |= XLOG_GIST_HAS_LEFT_CHILD;
                }
            }
            _ => {}
        }
        info
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            GistWalRecord::PageUpdate(rec) => encode_page_update(rec),
            GistWalRecord::PageDelete(rec) => encode_page_delete(rec),
            GistWalRecord::PageReuse(rec) => encode_page_reuse(rec),
            GistWalRecord::PageSplit(rec) => encode_page_split(rec),
            GistWalRecord::AssignLsn => 0u32.to_le_bytes().to_vec(),
        }
    }

    pub fn decode(info: u8, body: &[u8]) -> GistResult<Self> {
        let mut reader = BodyReader::new(body);
        let record = match GistRecordKind::try_from(info)? {
            GistRecordKind::PageUpdate => {
                GistWalRecord::PageUpdate(decode_page_update(info, &mut reader)?)
            }
            GistRecordKind::PageDelete => GistWalRecord::PageDelete(PageDeleteRecord {
                leaf: reader.u32()?,
                parent: reader.u32()?,
                delete_xid: reader.u64()?,
                downlink_offset: reader.u16()?,
            }),
            GistRecordKind::PageReuse => GistWalRecord::PageReuse(PageReuseRecord {
                block: reader.u32()?,
                latest_removed_xid: reader.u64()?,
            }),
            GistRecordKind::PageSplit => {
                GistWalRecord::PageSplit(decode_page_split(info, &mut reader)?)
            }
            GistRecordKind::AssignLsn => {
                reader.u32()?;
                GistWalRecord::AssignLsn
            }
        };
        if !reader.is_empty() {
            return Err(GistError::Wal(format!(
                "gist_redo: {} trailing bytes in {:?} record",
                reader.remaining(),
                record.kind()
            )));
        }
        Ok(record)
    }
}

fn encode_page_update(rec: &PageUpdateRecord) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend(CommonCodec::encode_u32(rec.block));
    buf.extend(CommonCodec::encode_u16(rec.todelete.len() as u16));
    buf.extend(CommonCodec::encode_u16(rec.tuples.len() as u16));
    if let Some(left) = rec.left_child {
        buf.extend(CommonCodec::encode_u32(left));
    }
    for off in &rec.todelete {
        buf.extend(CommonCodec::encode_u16(*off));
    }
    for tuple in &rec.tuples {
        buf.extend_from_slice(tuple.as_bytes());
    }
    buf
}

fn decode_page_update(info: u8, reader: &mut BodyReader<'_>) -> GistResult<PageUpdateRecord> {
    let block = reader.u32()?;
    let ntodelete = reader.u16()? as usize;
    let ntoadd = reader.u16()? as usize;
    let left_child = if info & XLOG_GIST_HAS_LEFT_CHILD != 0 {
        Some(reader.u32()?)
    } else {
        None
    };
    let todelete = (0..ntodelete)
        .map(|_| reader.u16())
        .collect::<GistResult<Vec<_>>>()?;
    let tuples = (0..ntoadd)
        .map(|_| reader.tuple())
        .collect::<GistResult<Vec<_>>>()?;
    Ok(PageUpdateRecord {
        block,
        todelete,
        tuples,
        left_child,
    })
}

fn encode_page_split(rec: &PageSplitRecord) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend(CommonCodec::encode_u32(rec.orig_rightlink));
    buf.extend(CommonCodec::encode_u64(rec.orig_nsn));
    buf.extend(CommonCodec::encode_u16(rec.pages.len() as u16));
    if let Some(left) = rec.left_child {
        buf.extend(CommonCodec::encode_u32(left));
    }
    for page in &rec.pages {
        buf.extend(CommonCodec::encode_u32(page.block));
        buf.extend(CommonCodec::encode_u16(page.tuples.len() as u16));
        for tuple in &page.tuples {
            buf.extend_from_slice(tuple.as_bytes());
        }
    }
    buf
}

fn decode_page_split(info: u8, reader: &mut BodyReader<'_>) -> GistResult<PageSplitRecord> {
    let orig_rightlink = reader.u32()?;
    let orig_nsn = reader.u64()?;
    let npages = reader.u16()? as usize;
    let left_child = if info & XLOG_GIST_HAS_LEFT_CHILD != 0 {
        Some(reader.u32()?)
    } else {
        None
    };
    let mut pages = Vec::with_capacity(npages);
    for _ in 0..npages {
        let block = reader.u32()?;
        let ntuples = reader.u16()? as usize;
        let tuples = (0..ntuples)
            .map(|_| reader.tuple())
            .collect::<GistResult<Vec<_>>>()?;
        pages.push(SplitPageImage { block, tuples });
    }
    Ok(PageSplitRecord {
        orig_rightlink,
        orig_nsn,
        orig_leaf: info & XLOG_GIST_ORIG_LEAF != 0,
        mark_follow_right: info & XLOG_GIST_MARK_FOLLOW_RIGHT != 0,
        left_child,
        pages,
    })
}

fn encode_page_delete(rec: &PageDeleteRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18);
    buf.extend(CommonCodec::encode_u32(rec.leaf));
    buf.extend(CommonCodec::encode_u32(rec.parent));
    buf.extend(CommonCodec::encode_u64(rec.delete_xid));
    buf.extend(CommonCodec::encode_u16(rec.downlink_offset));
    buf
}

fn encode_page_reuse(rec: &PageReuseRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend(CommonCodec::encode_u32(rec.block));
    buf.extend(CommonCodec::encode_u64(rec.latest_removed_xid));
    buf
}

struct BodyReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BodyReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.offset..]
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn u16(&mut self) -> GistResult<u16> {
        let (v, n) = CommonCodec::decode_u16(self.rest())?;
        self.offset += n;
        Ok(v)
    }

    fn u32(&mut self) -> GistResult<u32> {
        let (v, n) = CommonCodec::decode_u32(self.rest())?;
        self.offset += n;
        Ok(v)
    }

    fn u64(&mut self) -> GistResult<u64> {
        let (v, n) = CommonCodec::decode_u64(self.rest())?;
        self.offset += n;
        Ok(v)
    }

    fn tuple(&mut self) -> GistResult<IndexTuple> {
        let rest = self.rest();
        if rest.len() < INDEX_TUPLE_HEADER_SIZE {
            return Err(GistError::Wal("gist_redo: truncated index tuple".to_string()));
        }
        let size = (u16::from_le_bytes([rest[6], rest[7]]) & INDEX_SIZE_MASK) as usize;
        if size < INDEX_TUPLE_HEADER_SIZE || size > rest.len() {
            return Err(GistError::Wal(format!(
                "gist_redo: index tuple of {} bytes overruns record",
                size
            )));
        }
        self.offset += size;
        Ok(IndexTuple::from_bytes(&rest[..size]))
    }
}

/// Applies `apply` to `block` unless the page already reflects `lsn`.
fn redo_block<F>(ctx: &RedoContext, block: BlockNumber, lsn: Lsn, apply: F) -> GistResult<bool>
where
    F: FnOnce(&mut GistPage<&mut [u8]>) -> GistResult<()>,
{
    let mut guard = ctx.buffer_manager.fetch_page_write_extending(block)?;
    if guard.lsn() >= lsn {
        return Ok(false);
    }
    {
        let mut page = GistPage::new(guard.data_mut());
        apply(&mut page)?;
    }
    guard.set_lsn(lsn);
    guard.mark_dirty();
    Ok(true)
}

fn redo_clear_follow_right(ctx: &RedoContext, block: BlockNumber, lsn: Lsn) -> GistResult<bool> {
    redo_block(ctx, block, lsn, |page| {
        page.set_nsn(lsn);
        page.set_follow_right(false);
        Ok(())
    })
}

fn redo_page_update(ctx: &RedoContext, rec: &PageUpdateRecord, lsn: Lsn) -> GistResult<usize> {
    let mut changed = 0;
    if redo_block(ctx, rec.block, lsn, |page| {
        let mut rest = &rec.tuples[..];
        if rec.todelete.len() == 1 && rec.tuples.len() == 1 {
            page.tuple_overwrite(rec.todelete[0], rec.tuples[0].as_bytes())?;
            rest = &[];
        } else if !rec.todelete.is_empty() {
            page.multi_delete(&rec.todelete)?;
            if page.is_leaf() {
                page.set_tuples_deleted(true);
            }
        }
        page.fill(rest)
    })? {
        changed += 1;
    }
    if let Some(left) = rec.left_child {
        if redo_clear_follow_right(ctx, left, lsn)? {
            changed += 1;
        }
    }
    Ok(changed)
}

fn redo_page_split(ctx: &RedoContext, rec: &PageSplitRecord, lsn: Lsn) -> GistResult<usize> {
    let mut changed = 0;
    let is_root_split = rec
        .pages
        .first()
        .map(|p| p.block == GIST_ROOT_BLKNO)
        .unwrap_or(false);
    let npages = rec.pages.len();
    for (i, image) in rec.pages.iter().enumerate() {
        let is_root = image.block == GIST_ROOT_BLKNO;
        if is_root && i != 0 {
            return Err(GistError::Wal(format!(
                "gist_redo: root block appears at position {} of a split",
                i
            )));
        }
        let applied = redo_block(ctx, image.block, lsn, |page| {
            let flags = if rec.orig_leaf && !is_root { F_LEAF } else { 0 };
            page.init(flags);
            page.fill(&image.tuples)?;
            page.set_nsn(rec.orig_nsn);
            if is_root {
                page.set_rightlink(INVALID_BLOCK_NUMBER);
                page.set_follow_right(false);
            } else {
                let rightlink = if i + 1 < npages {
                    rec.pages[i + 1].block
                } else {
                    rec.orig_rightlink
                };
                page.set_rightlink(rightlink);
                page.set_follow_right(i + 1 < npages && !is_root_split && rec.mark_follow_right);
            }
            Ok(())
        })?;
        if applied {
            changed += 1;
        }
    }
    if let Some(left) = rec.left_child {
        if redo_clear_follow_right(ctx, left, lsn)? {
            changed += 1;
        }
    }
    Ok(changed)
}

fn redo_page_delete(ctx: &RedoContext, rec: &PageDeleteRecord, lsn: Lsn) -> GistResult<usize> {
    let mut changed = 0;
    if redo_block(ctx, rec.leaf, lsn, |page| {
        page.set_deleted(rec.delete_xid);
        Ok(())
    })? {
        changed += 1;
    }
    if redo_block(ctx, rec.parent, lsn, |page| {
        page.tuple_delete(rec.downlink_offset)
    })? {
        changed += 1;
    }
    Ok(changed)
}

/// Replays GiST records during recovery.
#[derive(Debug, Default)]
pub struct GistResourceManager;

impl ResourceManager for GistResourceManager {
    fn name(&self) -> &'static str {
        "Gist"
    }

    fn redo(&self, frame: &WalFrame, ctx: &RedoContext) -> GistResult<usize> {
        let lsn = frame.end_lsn;
        match GistWalRecord::decode(frame.info, &frame.body)? {
            GistWalRecord::PageUpdate(rec) => redo_page_update(ctx, &rec, lsn),
            GistWalRecord::PageSplit(rec) => redo_page_split(ctx, &rec, lsn),
            GistWalRecord::PageDelete(rec) => redo_page_delete(ctx, &rec, lsn),
            // Only conflicts with standby snapshots; nothing to do on the page.
            GistWalRecord::PageReuse(_) => Ok(0),
            GistWalRecord::AssignLsn => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::recovery::ResourceManagerId;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::page::{ItemPointer, BLCKSZ};
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tuple(block: BlockNumber, off: OffsetNumber, key: &str) -> IndexTuple {
        IndexTuple::form(
            ItemPointer::new(block, off),
            &[Some(Bytes::copy_from_slice(key.as_bytes()))],
        )
        .unwrap()
    }

    fn redo_ctx() -> (TempDir, RedoContext) {
        let temp_dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::try_new(temp_dir.path().join("idx")).unwrap());
        let bpm = Arc::new(BufferManager::new(16, disk));
        (
            temp_dir,
            RedoContext {
                buffer_manager: bpm,
            },
        )
    }

    fn frame(record: &GistWalRecord, lsn: Lsn, end_lsn: Lsn) -> WalFrame {
        WalFrame {
            lsn,
            end_lsn,
            prev_lsn: 0,
            rmid: ResourceManagerId::Gist,
            info: record.info(),
            body: record.encode(),
        }
    }

    #[test]
    fn records_decode_to_what_was_encoded() {
        let update = GistWalRecord::PageUpdate(PageUpdateRecord {
            block: 4,
            todelete: vec![2, 7],
            tuples: vec![tuple(1, 1, "a"), tuple(2, 3, "bcdefghij")],
            left_child: Some(9),
        });
        let split = GistWalRecord::PageSplit(PageSplitRecord {
            orig_rightlink: INVALID_BLOCK_NUMBER,
            orig_nsn: 77,
            orig_leaf: true,
            mark_follow_right: true,
            left_child: None,
            pages: vec![
                SplitPageImage {
                    block: 3,
                    tuples: vec![tuple(1, 1, "x")],
                },
                SplitPageImage {
                    block: 8,
                    tuples: vec![],
                },
            ],
        });
        let delete = GistWalRecord::PageDelete(PageDeleteRecord {
            leaf: 5,
            parent: 1,
            delete_xid: 1 << 40,
            downlink_offset: 3,
        });
        for record in [update, split, delete, GistWalRecord::AssignLsn] {
            let decoded = GistWalRecord::decode(record.info(), &record.encode()).unwrap();
            assert_eq!(decoded, record);
        }
        assert_eq!(GistWalRecord::AssignLsn.encode().len(), 4);
        assert!(GistWalRecord::decode(0x0F, &[]).is_err());
    }

    #[test]
    fn split_redo_links_pages_and_is_idempotent() {
        let (_tmp, ctx) = redo_ctx();
        let record = GistWalRecord::PageSplit(PageSplitRecord {
            orig_rightlink: 42,
            orig_nsn: 10,
            orig_leaf: true,
            mark_follow_right: true,
            left_child: None,
            pages: vec![
                SplitPageImage {
                    block: 1,
                    tuples: vec![tuple(7, 1, "l1"), tuple(7, 2, "l2")],
                },
                SplitPageImage {
                    block: 2,
                    tuples: vec![tuple(7, 3, "r1")],
                },
            ],
        });
        let rm = GistResourceManager;
        assert_eq!(rm.redo(&frame(&record, 100, 150), &ctx).unwrap(), 2);
        assert_eq!(rm.redo(&frame(&record, 100, 150), &ctx).unwrap(), 0);

        let left = ctx.buffer_manager.fetch_page_read(1).unwrap();
        let page = GistPage::new(left.data());
        assert!(page.is_leaf());
        assert!(page.follow_right());
        assert_eq!(page.rightlink(), 2);
        assert_eq!(page.nsn(), 10);
        assert_eq!(page.tuple_count(), 2);
        assert_eq!(left.lsn(), 150);
        drop(left);

        let right = ctx.buffer_manager.fetch_page_read(2).unwrap();
        let page = GistPage::new(right.data());
        assert!(!page.follow_right());
        assert_eq!(page.rightlink(), 42);
        assert_eq!(page.tuple(1).tid(), ItemPointer::new(7, 3));
    }

    #[test]
    fn update_redo_overwrites_and_fixes_left_child() {
        let (_tmp, ctx) = redo_ctx();
        {
            let mut guard = ctx.buffer_manager.fetch_page_write_extending(3).unwrap();
            let mut page = GistPage::new(guard.data_mut());
            page.init(0);
            page.fill(&[tuple(1, 0xFFFF, "old"), tuple(2, 0xFFFF, "keep")])
                .unwrap();
            guard.set_lsn(20);
            guard.mark_dirty();
        }
        {
            let mut guard = ctx.buffer_manager.fetch_page_write(1).unwrap();
            let mut page = GistPage::new(guard.data_mut());
            page.init(F_LEAF);
            page.set_follow_right(true);
            guard.set_lsn(20);
            guard.mark_dirty();
        }
        let record = GistWalRecord::PageUpdate(PageUpdateRecord {
            block: 3,
            todelete: vec![1],
            tuples: vec![tuple(1, 0xFFFF, "new")],
            left_child: Some(1),
        });
        assert_eq!(
            GistResourceManager
                .redo(&frame(&record, 30, 60), &ctx)
                .unwrap(),
            2
        );
        let parent = ctx.buffer_manager.fetch_page_read(3).unwrap();
        let page = GistPage::new(parent.data());
        assert_eq!(page.tuple_count(), 2);
        assert_eq!(page.tuple(1).attrs(1).unwrap()[0].as_deref(), Some(&b"new"[..]));
        drop(parent);
        let child = ctx.buffer_manager.fetch_page_read(1).unwrap();
        let page = GistPage::new(child.data());
        assert!(!page.follow_right());
        assert_eq!(page.nsn(), 60);
    }

    #[test]
    fn delete_redo_marks_leaf_and_drops_downlink() {
        let (_tmp, ctx) = redo_ctx();
        for (block, flags) in [(0, 0), (1, F_LEAF)] {
            let mut guard = ctx.buffer_manager.fetch_page_write_extending(block).unwrap();
            let mut page = GistPage::new(guard.data_mut());
            page.init(flags);
            if block == 0 {
                page.fill(&[tuple(1, 0xFFFF, "a"), tuple(2, 0xFFFF, "b")])
                    .unwrap();
            }
            guard.set_lsn(5);
            guard.mark_dirty();
        }
        let record = GistWalRecord::PageDelete(PageDeleteRecord {
            leaf: 1,
            parent: 0,
            delete_xid: 12,
            downlink_offset: 1,
        });
        GistResourceManager
            .redo(&frame(&record, 40, 70), &ctx)
            .unwrap();
        let leaf = ctx.buffer_manager.fetch_page_read(1).unwrap();
        let page = GistPage::new(leaf.data());
        assert!(page.is_deleted());
        assert_eq!(page.delete_xid(), 12);
        drop(leaf);
        let parent = ctx.buffer_manager.fetch_page_read(0).unwrap();
        let page = GistPage::new(parent.data());
        assert_eq!(page.tuple_count(), 1);
        assert_eq!(page.downlink_block(1), 2);
        assert_eq!(parent.data().len(), BLCKSZ);
    }
}
