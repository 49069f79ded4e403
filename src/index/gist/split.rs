//! Page split planning: decides which tuples of an overflowing page go left
//! and which go right, column by column, and computes both downlinks.
//!
//! The first column is split by the opclass `picksplit`. Tuples that could
//! sit on either side with zero penalty ("don't cares") are redistributed by
//! the following columns. Null keys never share a page with non-null keys of
//! the same column.

use log::debug;

use crate::error::{GistError, GistResult};
use crate::index::gist::opclass::{Datum, GistEntry, SplitVec};
use crate::index::gist::page::GIST_PAGE_SIZE;
use crate::index::gist::state::GistState;
use crate::index::gist::tuple::IndexTuple;
use crate::storage::page::{OffsetNumber, INVALID_BLOCK_NUMBER, ITEM_ID_SIZE};

/// One page worth of tuples produced by a split, with the downlink that
/// will point at it. The downlink's block is filled in by the caller.
#[derive(Debug, Clone)]
pub struct SplitPage {
    pub tuples: Vec<IndexTuple>,
    pub downlink: IndexTuple,
}

/// Working state of a split. Indices in `split.left`/`split.right` and in
/// `dontcare` refer to the tuple slice being split.
#[derive(Debug)]
struct GistSplitVector {
    split: SplitVec,
    lattr: Vec<Option<Datum>>,
    rattr: Vec<Option<Datum>>,
    dontcare: Option<Vec<bool>>,
    left_invalid: bool,
    right_invalid: bool,
}

impl GistSplitVector {
    fn new(nkeys: usize) -> Self {
        Self {
            split: SplitVec::default(),
            lattr: vec![None; nkeys],
            rattr: vec![None; nkeys],
            dontcare: None,
            left_invalid: false,
            right_invalid: false,
        }
    }
}

/// Whether `itvec` fits on one empty page.
pub fn fit_page(itvec: &[IndexTuple]) -> bool {
    itvec.iter().map(|t| t.size() + ITEM_ID_SIZE).sum::<usize>() <= GIST_PAGE_SIZE
}

/// Splits `itup` into as many pages as needed, left pages first.
pub fn gist_split(
    state: &GistState,
    is_leaf: bool,
    itup: &[IndexTuple],
) -> GistResult<Vec<SplitPage>> {
    match itup.len() {
        0 => {
            return Err(GistError::Internal(format!(
                "cannot split an empty page of index \"{}\"",
                state.name()
            )))
        }
        1 => {
            return Err(GistError::StructuralLimit(format!(
                "index row size {} exceeds maximum {} for index \"{}\"",
                itup[0].size(),
                GIST_PAGE_SIZE,
                state.name()
            )))
        }
        _ => {}
    }

    let mut v = GistSplitVector::new(state.nkeys());
    split_by_key(state, is_leaf, itup, &mut v, 0)?;

    let left: Vec<IndexTuple> = v.split.left.iter().map(|&i| itup[i].clone()).collect();
    let right: Vec<IndexTuple> = v.split.right.iter().map(|&i| itup[i].clone()).collect();

    let mut pages = Vec::new();
    if fit_page(&left) {
        let downlink = side_downlink(state, &v.lattr, v.left_invalid)?;
        pages.push(SplitPage {
            tuples: left,
            downlink,
        });
    } else {
        pages.extend(gist_split(state, is_leaf, &left)?);
    }
    if fit_page(&right) {
        let downlink = side_downlink(state, &v.rattr, v.right_invalid)?;
        pages.push(SplitPage {
            tuples: right,
            downlink,
        });
    } else {
        pages.extend(gist_split(state, is_leaf, &right)?);
    }
    Ok(pages)
}

fn side_downlink(
    state: &GistState,
    attr: &[Option<Datum>],
    invalid: bool,
) -> GistResult<IndexTuple> {
    if invalid {
        IndexTuple::invalid(INVALID_BLOCK_NUMBER, state.nkeys())
    } else {
        state.form_tuple(attr, false)
    }
}

fn split_by_key(
    state: &GistState,
    is_leaf: bool,
    itup: &[IndexTuple],
    v: &mut GistSplitVector,
    attno: usize,
) -> GistResult<()> {
    let len = itup.len();
    if attno == 0 && !is_leaf && itup.iter().any(|t| t.is_invalid()) {
        return split_invalid(state, itup, v);
    }

    let mut entries = Vec::with_capacity(len);
    let mut null_offs = Vec::new();
    for (i, tuple) in itup.iter().enumerate() {
        let key = tuple.attr(attno, state.nkeys())?;
        let entry = state.dentry_init(
            attno,
            key,
            INVALID_BLOCK_NUMBER,
            (i + 1) as OffsetNumber,
            false,
        )?;
        if entry.is_none() {
            null_offs.push(i);
        }
        entries.push(entry);
    }

    if null_offs.len() == len {
        // nothing to split on here; try the next column
        v.lattr[attno] = None;
        v.rattr[attno] = None;
        if attno + 1 < state.nkeys() {
            split_by_key(state, is_leaf, itup, v, attno + 1)?;
        } else {
            split_half(&mut v.split, len);
        }
    } else if !null_offs.is_empty() {
        let mut is_null = vec![false; len];
        for &i in &null_offs {
            is_null[i] = true;
        }
        v.split.left = (0..len).filter(|&i| !is_null[i]).collect();
        v.split.right = null_offs;
        v.rattr[attno] = None;
        if attno == 0 && state.nkeys() == 1 {
            v.dontcare = None;
            union_subkey(state, itup, v)?;
        }
    } else {
        let entries: Vec<GistEntry> = entries.into_iter().flatten().collect();
        if user_picksplit(state, &entries, attno, v, itup)? {
            match v.dontcare.take() {
                None => split_by_key(state, is_leaf, itup, v, attno + 1)?,
                Some(dontcare) => {
                    let map: Vec<usize> = (0..len).filter(|&i| dontcare[i]).collect();
                    let subset: Vec<IndexTuple> = map.iter().map(|&i| itup[i].clone()).collect();
                    let mut left = v.split.left.clone();
                    let mut right = v.split.right.clone();

                    split_by_key(state, is_leaf, &subset, v, attno + 1)?;

                    left.extend(v.split.left.iter().map(|&i| map[i]));
                    right.extend(v.split.right.iter().map(|&i| map[i]));
                    v.split.left = left;
                    v.split.right = right;
                }
            }
        }
    }

    // Later columns may have moved tuples between sides; recompute every
    // union once at the outermost level.
    if attno == 0 && state.nkeys() > 1 {
        v.dontcare = None;
        union_subkey(state, itup, v)?;
    }
    Ok(())
}

/// Internal pages written by an old format may hold keyless downlinks. They
/// all go right under a keyless downlink of their own.
fn split_invalid(
    state: &GistState,
    itup: &[IndexTuple],
    v: &mut GistSplitVector,
) -> GistResult<()> {
    let (invalid, valid): (Vec<usize>, Vec<usize>) =
        (0..itup.len()).partition(|&i| itup[i].is_invalid());
    if valid.is_empty() {
        split_half(&mut v.split, itup.len());
        v.lattr = vec![None; state.nkeys()];
        v.rattr = vec![None; state.nkeys()];
        v.left_invalid = true;
        v.right_invalid = true;
        return Ok(());
    }
    let left: Vec<&IndexTuple> = valid.iter().map(|&i| &itup[i]).collect();
    v.lattr = state.make_union_itvec(&left)?;
    v.rattr = vec![None; state.nkeys()];
    v.split.left = valid;
    v.split.right = invalid;
    v.left_invalid = false;
    v.right_invalid = true;
    Ok(())
}

/// Sends the first `len / 2` tuples right and the rest left. Union keys are
/// the caller's business.
fn split_half(sv: &mut SplitVec, len: usize) {
    sv.right = (0..len / 2).collect();
    sv.left = (len / 2..len).collect();
}

/// Recomputes the unions of both sides over every key column, leaving out
/// don't-care tuples.
fn union_subkey(state: &GistState, itup: &[IndexTuple], v: &mut GistSplitVector) -> GistResult<()> {
    let keep = |i: &usize| v.dontcare.as_ref().map_or(true, |d| !d[*i]);
    let left: Vec<&IndexTuple> = v.split.left.iter().filter(|i| keep(i)).map(|&i| &itup[i]).collect();
    let right: Vec<&IndexTuple> = v
        .split
        .right
        .iter()
        .filter(|i| keep(i))
        .map(|&i| &itup[i])
        .collect();
    let lattr = state.make_union_itvec(&left)?;
    let rattr = state.make_union_itvec(&right)?;
    v.lattr = lattr;
    v.rattr = rattr;
    Ok(())
}

/// Marks tuples that could move to the other side with zero penalty on
/// column `attno`. Returns how many were found.
fn find_dont_cares(
    state: &GistState,
    entries: &[GistEntry],
    sv: &SplitVec,
    dontcare: &mut [bool],
    attno: usize,
) -> GistResult<usize> {
    let mut found = 0;
    let right = GistEntry::detached(sv.rdatum.clone(), false);
    for &j in &sv.left {
        if state.penalty(attno, Some(&right), Some(&entries[j]))? == 0.0 {
            dontcare[j] = true;
            found += 1;
        }
    }
    let left = GistEntry::detached(sv.ldatum.clone(), false);
    for &j in &sv.right {
        if state.penalty(attno, Some(&left), Some(&entries[j]))? == 0.0 {
            dontcare[j] = true;
            found += 1;
        }
    }
    Ok(found)
}

/// Sends a single don't-care tuple to the side whose unions grow least,
/// looking at columns from `attno` on.
fn place_one(
    state: &GistState,
    v: &mut GistSplitVector,
    tuple: &IndexTuple,
    off: usize,
    attno: usize,
) -> GistResult<()> {
    let identry = state.decompress_att(tuple)?;
    let mut to_left = true;
    for a in attno..state.nkeys() {
        let left = v.lattr[a].clone().map(|k| GistEntry::detached(k, false));
        let right = v.rattr[a].clone().map(|k| GistEntry::detached(k, false));
        let lpenalty = state.penalty(a, left.as_ref(), identry[a].as_ref())?;
        let rpenalty = state.penalty(a, right.as_ref(), identry[a].as_ref())?;
        if lpenalty != rpenalty {
            if lpenalty > rpenalty {
                to_left = false;
            }
            break;
        }
    }
    if to_left {
        v.split.left.push(off);
    } else {
        v.split.right.push(off);
    }
    Ok(())
}

fn previous_union(datum: Option<&Datum>, attno: usize, state: &GistState) -> GistResult<GistEntry> {
    datum
        .map(|d| GistEntry::detached(d.clone(), false))
        .ok_or_else(|| {
            GistError::OpclassContractViolation(format!(
                "picksplit method for column {} of index \"{}\" claimed a union it was not given",
                attno + 1,
                state.name()
            ))
        })
}

/// Finishes a secondary split the opclass did not merge itself: orients the
/// new halves against the unions chosen by earlier columns and folds those
/// unions in.
fn support_secondary_split(
    state: &GistState,
    attno: usize,
    sv: &mut SplitVec,
    old_l: Option<&Datum>,
    old_r: Option<&Datum>,
) -> GistResult<()> {
    let entry_sl = GistEntry::detached(sv.ldatum.clone(), false);
    let entry_sr = GistEntry::detached(sv.rdatum.clone(), false);

    let leave_on_left = if sv.ldatum_exists && sv.rdatum_exists {
        let entry_l = previous_union(old_l, attno, state)?;
        let entry_r = previous_union(old_r, attno, state)?;
        let straight = state.penalty(attno, Some(&entry_l), Some(&entry_sl))?
            + state.penalty(attno, Some(&entry_r), Some(&entry_sr))?;
        let crossed = state.penalty(attno, Some(&entry_l), Some(&entry_sr))?
            + state.penalty(attno, Some(&entry_r), Some(&entry_sl))?;
        straight <= crossed
    } else {
        let previous = if sv.ldatum_exists { old_l } else { old_r };
        let entry = previous_union(previous, attno, state)?;
        let to_sl = state.penalty(attno, Some(&entry), Some(&entry_sl))?;
        let to_sr = state.penalty(attno, Some(&entry), Some(&entry_sr))?;
        if to_sl < to_sr {
            sv.ldatum_exists
        } else {
            sv.rdatum_exists
        }
    };

    if !leave_on_left {
        std::mem::swap(&mut sv.left, &mut sv.right);
        std::mem::swap(&mut sv.ldatum, &mut sv.rdatum);
    }
    let entry_sl = GistEntry::detached(sv.ldatum.clone(), false);
    let entry_sr = GistEntry::detached(sv.rdatum.clone(), false);

    if sv.ldatum_exists {
        let entry_l = previous_union(old_l, attno, state)?;
        if let Some(union) = state.make_union_key(attno, Some(&entry_l), Some(&entry_sl))? {
            sv.ldatum = union;
        }
    }
    if sv.rdatum_exists {
        let entry_r = previous_union(old_r, attno, state)?;
        if let Some(union) = state.make_union_key(attno, Some(&entry_r), Some(&entry_sr))? {
            sv.rdatum = union;
        }
    }
    sv.ldatum_exists = false;
    sv.rdatum_exists = false;
    Ok(())
}

/// Half-and-half split used when the opclass put everything on one side.
fn generic_picksplit(
    state: &GistState,
    entries: &[GistEntry],
    sv: &mut SplitVec,
    attno: usize,
) -> GistResult<()> {
    let half = entries.len() / 2;
    sv.left = (0..half).collect();
    sv.right = (half..entries.len()).collect();
    let opclass = state.opclass(attno);
    sv.ldatum = opclass.union(&entries[..half])?;
    sv.rdatum = opclass.union(&entries[half..])?;
    Ok(())
}

fn check_picksplit_result(
    state: &GistState,
    attno: usize,
    len: usize,
    sv: &SplitVec,
) -> GistResult<()> {
    let mut seen = vec![false; len];
    for &i in sv.left.iter().chain(sv.right.iter()) {
        if i >= len || seen[i] {
            return Err(GistError::OpclassContractViolation(format!(
                "picksplit method for column {} of index \"{}\" returned invalid entry {}",
                attno + 1,
                state.name(),
                i
            )));
        }
        seen[i] = true;
    }
    if seen.iter().any(|s| !s) {
        return Err(GistError::OpclassContractViolation(format!(
            "picksplit method for column {} of index \"{}\" dropped entries",
            attno + 1,
            state.name()
        )));
    }
    Ok(())
}

/// Runs the opclass picksplit on column `attno`.
///
/// Returns `false` when the split is final. Returns `true` when later
/// columns should refine it: with `v.dontcare` unset the split on this
/// column was degenerate and should be ignored, otherwise the flagged
/// don't-care tuples were taken out of both sides and must be placed by the
/// next column.
fn user_picksplit(
    state: &GistState,
    entries: &[GistEntry],
    attno: usize,
    v: &mut GistSplitVector,
    itup: &[IndexTuple],
) -> GistResult<bool> {
    let seeded = |v: &GistSplitVector| SplitVec {
        left: Vec::new(),
        right: Vec::new(),
        ldatum: v.lattr[attno].clone().unwrap_or_default(),
        rdatum: v.rattr[attno].clone().unwrap_or_default(),
        ldatum_exists: v.lattr[attno].is_some(),
        rdatum_exists: v.rattr[attno].is_some(),
    };

    let mut sv = seeded(v);
    state.opclass(attno).picksplit(entries, &mut sv)?;
    if sv.left.is_empty() || sv.right.is_empty() {
        debug!(
            "picksplit method for column {} of index \"{}\" failed",
            attno + 1,
            state.name()
        );
        sv = seeded(v);
        generic_picksplit(state, entries, &mut sv, attno)?;
    } else {
        check_picksplit_result(state, attno, entries.len(), &sv)?;
    }

    if sv.ldatum_exists || sv.rdatum_exists {
        let old_l = v.lattr[attno].clone();
        let old_r = v.rattr[attno].clone();
        support_secondary_split(state, attno, &mut sv, old_l.as_ref(), old_r.as_ref())?;
    }

    v.lattr[attno] = Some(sv.ldatum.clone());
    v.rattr[attno] = Some(sv.rdatum.clone());
    v.split = sv;
    v.dontcare = None;

    if attno + 1 >= state.nkeys() {
        return Ok(false);
    }
    if state.key_is_eq(attno, &v.split.ldatum, &v.split.rdatum)? {
        return Ok(true);
    }

    let mut dontcare = vec![false; entries.len()];
    let found = find_dont_cares(state, entries, &v.split, &mut dontcare, attno)?;
    if found == 0 {
        return Ok(false);
    }
    v.split.left.retain(|&i| !dontcare[i]);
    v.split.right.retain(|&i| !dontcare[i]);
    if v.split.left.is_empty() || v.split.right.is_empty() {
        // every tuple was a don't care: ignore this column entirely
        return Ok(true);
    }

    v.dontcare = Some(dontcare);
    union_subkey(state, itup, v)?;
    if found > 1 {
        return Ok(true);
    }

    let to_move = v
        .dontcare
        .as_ref()
        .and_then(|d| d.iter().position(|&c| c))
        .ok_or_else(|| GistError::Internal("lost the don't-care tuple of a split".to_string()))?;
    place_one(state, v, &itup[to_move], to_move, attno + 1)?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::gist::opclass::IndexDescriptor;
    use crate::storage::page::ItemPointer;
    use crate::tests::opclasses::{range_datum, IntRangeOps, LazyPicksplitOps};
    use bytes::Bytes;
    use std::sync::Arc;

    fn range_state(columns: usize) -> GistState {
        let opclasses = (0..columns)
            .map(|_| Arc::new(IntRangeOps) as Arc<dyn crate::index::gist::opclass::GistOpclass>)
            .collect();
        GistState::new("split_idx", IndexDescriptor::new(opclasses)).unwrap()
    }

    fn leaf(state: &GistState, i: u32, values: &[Option<Datum>]) -> IndexTuple {
        let mut t = state.form_tuple(values, true).unwrap();
        t.set_tid(ItemPointer::new(i, 1));
        t
    }

    fn padded(i: i64) -> Option<Datum> {
        // fat keys so that a few hundred rows overflow a page
        let mut raw = range_datum(i, i).to_vec();
        raw.resize(200, 0);
        Some(Bytes::from(raw))
    }

    #[test]
    fn single_oversized_tuple_is_a_structural_error() {
        let state = range_state(1);
        let t = leaf(&state, 1, &[Some(range_datum(1, 2))]);
        let err = gist_split(&state, true, &[t]).unwrap_err();
        assert!(matches!(err, GistError::StructuralLimit(_)));
        assert!(err.to_string().contains("exceeds maximum 8152 for index \"split_idx\""));
    }

    #[test]
    fn every_tuple_lands_on_exactly_one_fitting_page() {
        let state = range_state(1);
        let tuples: Vec<IndexTuple> = (0..100).map(|i| leaf(&state, i, &[padded(i as i64)])).collect();
        assert!(!fit_page(&tuples));
        let pages = gist_split(&state, true, &tuples).unwrap();
        assert!(pages.len() >= 3);
        let mut seen: Vec<u32> = Vec::new();
        for page in &pages {
            assert!(!page.tuples.is_empty());
            assert!(fit_page(&page.tuples));
            assert!(!page.downlink.is_invalid());
            for t in &page.tuples {
                seen.push(t.tid().block);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn nulls_are_kept_apart_from_keys() {
        let state = range_state(1);
        let mut tuples = Vec::new();
        for i in 0..6 {
            let key = if i % 2 == 0 { None } else { Some(range_datum(i, i + 1)) };
            tuples.push(leaf(&state, i as u32, &[key]));
        }
        let mut v = GistSplitVector::new(1);
        split_by_key(&state, true, &tuples, &mut v, 0).unwrap();
        assert_eq!(v.split.right, vec![0, 2, 4]);
        assert_eq!(v.split.left, vec![1, 3, 5]);
        assert_eq!(v.rattr[0], None);
        assert_eq!(v.lattr[0], Some(range_datum(1, 6)));
    }

    #[test]
    fn all_null_last_column_splits_in_half() {
        let state = range_state(1);
        let tuples: Vec<IndexTuple> = (0..5).map(|i| leaf(&state, i, &[None])).collect();
        let mut v = GistSplitVector::new(1);
        split_by_key(&state, true, &tuples, &mut v, 0).unwrap();
        assert_eq!(v.split.right, vec![0, 1]);
        assert_eq!(v.split.left, vec![2, 3, 4]);
        assert!(v.lattr[0].is_none() && v.rattr[0].is_none());
    }

    #[test]
    fn one_sided_picksplit_falls_back_to_halves() {
        let state = GistState::new(
            "lazy",
            IndexDescriptor::new(vec![Arc::new(LazyPicksplitOps)]),
        )
        .unwrap();
        let tuples: Vec<IndexTuple> = (0..4)
            .map(|i| leaf(&state, i, &[Some(range_datum(i as i64 * 10, i as i64 * 10 + 1))]))
            .collect();
        let mut v = GistSplitVector::new(1);
        split_by_key(&state, true, &tuples, &mut v, 0).unwrap();
        assert_eq!(v.split.left, vec![0, 1]);
        assert_eq!(v.split.right, vec![2, 3]);
        assert_eq!(v.lattr[0], Some(range_datum(0, 11)));
        assert_eq!(v.rattr[0], Some(range_datum(20, 31)));
    }

    #[test]
    fn identical_first_column_defers_to_second() {
        let state = range_state(2);
        let same = Some(range_datum(5, 5));
        let tuples: Vec<IndexTuple> = (0..8)
            .map(|i| leaf(&state, i, &[same.clone(), Some(range_datum(i as i64 * 100, i as i64 * 100))]))
            .collect();
        let mut v = GistSplitVector::new(2);
        split_by_key(&state, true, &tuples, &mut v, 0).unwrap();
        assert!(!v.split.left.is_empty() && !v.split.right.is_empty());
        assert_eq!(v.split.left.len() + v.split.right.len(), 8);
        assert_eq!(v.lattr[0], same);
        assert_eq!(v.rattr[0], same);
        let (l, r) = (v.lattr[1].clone().unwrap(), v.rattr[1].clone().unwrap());
        assert_ne!(l, r);
    }

    #[test]
    fn invalid_downlinks_go_right_under_an_invalid_downlink() {
        let state = range_state(1);
        let mut tuples = vec![
            state.form_tuple(&[Some(range_datum(0, 10))], false).unwrap(),
            IndexTuple::invalid(7, 1).unwrap(),
            state.form_tuple(&[Some(range_datum(20, 30))], false).unwrap(),
        ];
        tuples[0].set_block(3);
        tuples[2].set_block(4);
        let pages = gist_split(&state, false, &tuples).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].tuples.len(), 2);
        assert!(!pages[0].downlink.is_invalid());
        assert_eq!(pages[1].tuples[0].tid().block, 7);
        assert!(pages[1].downlink.is_invalid());
    }
}
