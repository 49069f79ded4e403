//! Per-index bundle of opclasses plus the key algebra built on top of them:
//! entry decompression, tuple forming, unions, penalties and downlink
//! adjustment.

use std::sync::Arc;

use log::debug;

use crate::error::{GistError, GistResult};
use crate::index::gist::opclass::{Datum, GistEntry, GistOpclass, IndexDescriptor};
use crate::index::gist::tuple::{IndexTuple, TUPLE_IS_VALID};
use crate::storage::page::{BlockNumber, ItemPointer, OffsetNumber, INVALID_BLOCK_NUMBER};

/// Upper bound on key plus include columns of one index.
pub const INDEX_MAX_KEYS: usize = 32;

#[derive(Debug)]
pub struct GistState {
    name: String,
    desc: IndexDescriptor,
}

impl GistState {
    pub fn new(name: impl Into<String>, desc: IndexDescriptor) -> GistResult<Self> {
        if desc.key_columns() == 0 {
            return Err(GistError::NotSupported(
                "GiST index needs at least one key column".to_string(),
            ));
        }
        if desc.leaf_columns() > INDEX_MAX_KEYS {
            return Err(GistError::StructuralLimit(format!(
                "cannot use more than {} columns in an index",
                INDEX_MAX_KEYS
            )));
        }
        Ok(Self {
            name: name.into(),
            desc,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.desc
    }

    pub fn nkeys(&self) -> usize {
        self.desc.key_columns()
    }

    pub fn leaf_natts(&self) -> usize {
        self.desc.leaf_columns()
    }

    pub fn opclass(&self, attno: usize) -> &Arc<dyn GistOpclass> {
        &self.desc.opclasses[attno]
    }

    /// Wraps a stored key into an entry, decompressing it when the opclass
    /// asks for that. Null keys produce no entry.
    pub fn dentry_init(
        &self,
        attno: usize,
        key: Option<Datum>,
        block: BlockNumber,
        offset: OffsetNumber,
        leaf: bool,
    ) -> GistResult<Option<GistEntry>> {
        let Some(key) = key else {
            return Ok(None);
        };
        let entry = GistEntry::new(key, block, offset, leaf);
        let opclass = self.opclass(attno);
        if !opclass.has_decompress() {
            return Ok(Some(entry));
        }
        opclass.decompress(entry).map(Some)
    }

    /// Decompressed key columns of `tuple`.
    pub fn decompress_att(&self, tuple: &IndexTuple) -> GistResult<Vec<Option<GistEntry>>> {
        let keys = tuple.attrs(self.nkeys())?;
        keys.into_iter()
            .enumerate()
            .map(|(attno, key)| self.dentry_init(attno, key, INVALID_BLOCK_NUMBER, 0, false))
            .collect()
    }

    /// Applies `compress` to key columns; include columns pass through on
    /// leaves and are dropped otherwise.
    pub fn compress_values(
        &self,
        values: &[Option<Datum>],
        leaf: bool,
    ) -> GistResult<Vec<Option<Datum>>> {
        let natts = if leaf { self.leaf_natts() } else { self.nkeys() };
        if values.len() < natts {
            return Err(GistError::Internal(format!(
                "index \"{}\" expects {} values, got {}",
                self.name,
                natts,
                values.len()
            )));
        }
        let mut out = Vec::with_capacity(natts);
        for (attno, value) in values.iter().take(natts).enumerate() {
            let compressed = match value {
                None => None,
                Some(v) if attno < self.nkeys() => {
                    let opclass = self.opclass(attno);
                    if opclass.has_compress() {
                        let entry = GistEntry::detached(v.clone(), leaf);
                        Some(opclass.compress(entry)?.key)
                    } else {
                        Some(v.clone())
                    }
                }
                Some(v) => Some(v.clone()),
            };
            out.push(compressed);
        }
        Ok(out)
    }

    /// Forms a tuple from uncompressed values. The TID offset is set to the
    /// downlink marker; leaf callers overwrite the TID afterwards.
    pub fn form_tuple(&self, values: &[Option<Datum>], leaf: bool) -> GistResult<IndexTuple> {
        let compressed = self.compress_values(values, leaf)?;
        IndexTuple::form(
            ItemPointer::new(INVALID_BLOCK_NUMBER, TUPLE_IS_VALID),
            &compressed,
        )
    }

    /// Union of column `attno` over `entries`, which holds the non-null keys.
    fn union_entries(&self, attno: usize, entries: &mut Vec<GistEntry>) -> GistResult<Option<Datum>> {
        match entries.len() {
            0 => Ok(None),
            1 => {
                let only = entries[0].clone();
                entries.push(only);
                self.opclass(attno).union(entries).map(Some)
            }
            _ => self.opclass(attno).union(entries).map(Some),
        }
    }

    /// Column-wise union of the key columns of `itvec`. Nulls are ignored;
    /// an all-null column yields a null union.
    pub fn make_union_itvec(&self, itvec: &[&IndexTuple]) -> GistResult<Vec<Option<Datum>>> {
        let decoded = itvec
            .iter()
            .map(|t| t.attrs(self.nkeys()))
            .collect::<GistResult<Vec<_>>>()?;
        let mut attr = Vec::with_capacity(self.nkeys());
        for attno in 0..self.nkeys() {
            let mut entries = Vec::with_capacity(decoded.len() + 1);
            for keys in &decoded {
                if let Some(entry) =
                    self.dentry_init(attno, keys[attno].clone(), INVALID_BLOCK_NUMBER, 0, false)?
                {
                    entries.push(entry);
                }
            }
            attr.push(self.union_entries(attno, &mut entries)?);
        }
        Ok(attr)
    }

    /// Union of two possibly-null keys of column `attno`.
    pub fn make_union_key(
        &self,
        attno: usize,
        a: Option<&GistEntry>,
        b: Option<&GistEntry>,
    ) -> GistResult<Option<Datum>> {
        let pair = match (a, b) {
            (None, None) => return Ok(None),
            (Some(a), Some(b)) => [a.clone(), b.clone()],
            (Some(x), None) | (None, Some(x)) => [x.clone(), x.clone()],
        };
        self.opclass(attno).union(&pair).map(Some)
    }

    pub fn key_is_eq(&self, attno: usize, a: &Datum, b: &Datum) -> GistResult<bool> {
        self.opclass(attno).same(a, b)
    }

    /// Widens `old` to also cover `add`. Returns `None` when `old` already
    /// covers it; the returned tuple keeps the TID of `old`.
    pub fn get_adjusted(
        &self,
        old: &IndexTuple,
        add: &IndexTuple,
    ) -> GistResult<Option<IndexTuple>> {
        let old_entries = self.decompress_att(old)?;
        let add_entries = self.decompress_att(add)?;
        let mut need_new = false;
        let mut attr = Vec::with_capacity(self.nkeys());
        for attno in 0..self.nkeys() {
            let union = self.make_union_key(
                attno,
                old_entries[attno].as_ref(),
                add_entries[attno].as_ref(),
            )?;
            if !need_new {
                if let (Some(union), Some(_)) = (&union, &add_entries[attno]) {
                    need_new = match &old_entries[attno] {
                        None => true,
                        Some(old_key) => !self.key_is_eq(attno, &old_key.key, union)?,
                    };
                }
            }
            attr.push(union);
        }
        if !need_new {
            return Ok(None);
        }
        let mut tuple = self.form_tuple(&attr, false)?;
        tuple.set_tid(old.tid());
        Ok(Some(tuple))
    }

    /// Penalty of widening `orig` by `add`, clamped to be non-negative.
    /// Mixing a null and a non-null key costs infinity.
    pub fn penalty(
        &self,
        attno: usize,
        orig: Option<&GistEntry>,
        add: Option<&GistEntry>,
    ) -> GistResult<f32> {
        match (orig, add) {
            (Some(orig), Some(add)) => {
                let penalty = self.opclass(attno).penalty(orig, add)?;
                if penalty.is_nan() || penalty < 0.0 {
                    debug!(
                        "penalty function of column {} in index \"{}\" returned {}, using 0",
                        attno + 1,
                        self.name,
                        penalty
                    );
                    Ok(0.0)
                } else {
                    Ok(penalty)
                }
            }
            (None, None) => Ok(0.0),
            _ => Ok(f32::INFINITY),
        }
    }

    /// Internal tuple covering every tuple of `itvec`.
    pub fn union_tuples(&self, itvec: &[&IndexTuple]) -> GistResult<IndexTuple> {
        let attr = self.make_union_itvec(itvec)?;
        self.form_tuple(&attr, false)
    }

    /// Whether index-only scans can reconstruct column `attno`.
    pub fn can_return(&self, attno: usize) -> bool {
        if attno >= self.nkeys() {
            return attno < self.leaf_natts();
        }
        let opclass = self.opclass(attno);
        opclass.has_fetch() || !opclass.has_compress()
    }

    /// Reconstructs the indexed values of a leaf tuple. Columns whose
    /// stored form cannot be reversed come back as null.
    pub fn fetch_tuple(&self, tuple: &IndexTuple) -> GistResult<Vec<Option<Datum>>> {
        let mut values = tuple.attrs(self.leaf_natts())?;
        for (attno, value) in values.iter_mut().enumerate().take(self.nkeys()) {
            let opclass = self.opclass(attno);
            if opclass.has_fetch() {
                if let Some(key) = value.take() {
                    let entry = GistEntry::detached(key, false);
                    *value = Some(opclass.fetch(entry)?.key);
                }
            } else if opclass.has_compress() {
                *value = None;
            }
        }
        Ok(values)
    }
}
