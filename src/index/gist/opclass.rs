//! Operator class interface: the support functions that give meaning to the
//! bytes stored in an index column.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::GistResult;
use crate::storage::page::{BlockNumber, OffsetNumber, INVALID_BLOCK_NUMBER};

/// Opaque key or value bytes; only the opclass interprets them.
pub type Datum = Bytes;

pub type StrategyNumber = u16;

/// Type of the query argument when an operator family accepts several.
pub type SubtypeId = u32;

/// A key handed to a support function together with where it came from.
#[derive(derive_new::new, Debug, Clone, PartialEq)]
pub struct GistEntry {
    pub key: Datum,
    pub block: BlockNumber,
    pub offset: OffsetNumber,
    pub leaf: bool,
}

impl GistEntry {
    /// An entry not tied to any page, as built for unions and penalties.
    pub fn detached(key: Datum, leaf: bool) -> Self {
        Self::new(key, INVALID_BLOCK_NUMBER, 0, leaf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consistent {
    pub matched: bool,
    pub recheck: bool,
}

impl Consistent {
    pub fn exact(matched: bool) -> Self {
        Self {
            matched,
            recheck: false,
        }
    }

    pub fn lossy(matched: bool) -> Self {
        Self {
            matched,
            recheck: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distance {
    pub value: f64,
    /// The value is only a lower bound and the caller must re-sort.
    pub recheck: bool,
}

impl Distance {
    pub fn exact(value: f64) -> Self {
        Self {
            value,
            recheck: false,
        }
    }
}

/// Input and output of `picksplit`. `left`/`right` index into the entry
/// slice passed to the call. When `ldatum_exists`/`rdatum_exists` is set on
/// entry, the side already carries the union of tuples routed there by an
/// earlier column; an opclass that merges them clears the flag.
#[derive(Debug, Clone, Default)]
pub struct SplitVec {
    pub left: Vec<usize>,
    pub right: Vec<usize>,
    pub ldatum: Datum,
    pub rdatum: Datum,
    pub ldatum_exists: bool,
    pub rdatum_exists: bool,
}

/// Support functions of one indexed column. Collation, if the type has
/// one, is part of the implementing value.
pub trait GistOpclass: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a subtree (internal entry) or a row (leaf entry) may satisfy
    /// `query` under `strategy`. `subtype` names the type of `query` when
    /// the operator was declared cross-type.
    fn consistent(
        &self,
        entry: &GistEntry,
        query: &Datum,
        strategy: StrategyNumber,
        subtype: Option<SubtypeId>,
    ) -> GistResult<Consistent>;

    /// Smallest key covering every entry. Called with at least one entry.
    fn union(&self, entries: &[GistEntry]) -> GistResult<Datum>;

    fn has_compress(&self) -> bool {
        false
    }

    fn compress(&self, entry: GistEntry) -> GistResult<GistEntry> {
        Ok(entry)
    }

    fn has_decompress(&self) -> bool {
        false
    }

    fn decompress(&self, entry: GistEntry) -> GistResult<GistEntry> {
        Ok(entry)
    }

    /// Cost of widening `orig` so that it also covers `new`.
    fn penalty(&self, orig: &GistEntry, new: &GistEntry) -> GistResult<f32>;

    /// Partitions `entries` into two non-empty sides and fills in their unions.
    fn picksplit(&self, entries: &[GistEntry], split: &mut SplitVec) -> GistResult<()>;

    fn same(&self, a: &Datum, b: &Datum) -> GistResult<bool>;

    fn has_distance(&self) -> bool {
        false
    }

    fn distance(
        &self,
        _entry: &GistEntry,
        _query: &Datum,
        _strategy: StrategyNumber,
        _subtype: Option<SubtypeId>,
    ) -> GistResult<Distance> {
        Err(crate::error::GistError::NotSupported(format!(
            "operator class \"{}\" has no distance function",
            self.name()
        )))
    }

    fn has_fetch(&self) -> bool {
        false
    }

    /// Reconstructs the original column value from a leaf key.
    fn fetch(&self, entry: GistEntry) -> GistResult<GistEntry> {
        Ok(entry)
    }
}

/// Column layout of an index: one opclass per key column, followed by
/// `n_include` non-key columns stored on leaf tuples only.
#[derive(Clone)]
pub struct IndexDescriptor {
    pub opclasses: Vec<Arc<dyn GistOpclass>>,
    pub n_include: usize,
}

impl IndexDescriptor {
    pub fn new(opclasses: Vec<Arc<dyn GistOpclass>>) -> Self {
        Self {
            opclasses,
            n_include: 0,
        }
    }

    pub fn with_include(mut self, n_include: usize) -> Self {
        self.n_include = n_include;
        self
    }

    pub fn key_columns(&self) -> usize {
        self.opclasses.len()
    }

    pub fn leaf_columns(&self) -> usize {
        self.opclasses.len() + self.n_include
    }
}

impl fmt::Debug for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.opclasses.iter().map(|o| o.name()).collect();
        f.debug_struct("IndexDescriptor")
            .field("opclasses", &names)
            .field("n_include", &self.n_include)
            .finish()
    }
}
