//! Choose-subtree: picks the downlink whose key grows least when the new
//! tuple is added, comparing columns lexicographically.

use crate::error::GistResult;
use crate::index::gist::page::GistPage;
use crate::index::gist::relation::GistRelation;
use crate::index::gist::tuple::IndexTuple;
use crate::storage::page::{BlockNumber, OffsetNumber, FIRST_OFFSET_NUMBER};

/// Returns the offset of the best downlink on internal page `page` (block
/// `block`) for `it`.
///
/// Exact ties with the current best are settled by a coin flip; once the
/// coin says to keep the current best it is kept for every later tie on
/// this page, and a downlink with zero penalty on every column ends the
/// search.
pub fn gist_choose<B: AsRef<[u8]>>(
    rel: &GistRelation,
    block: BlockNumber,
    page: &GistPage<B>,
    it: &IndexTuple,
) -> GistResult<OffsetNumber> {
    let state = rel.state();
    let nkeys = state.nkeys();
    let identry = state.decompress_att(it)?;

    let mut result = FIRST_OFFSET_NUMBER;
    // None: not known yet, for this column and every column after it
    let mut best_penalty: Vec<Option<f32>> = vec![None; nkeys];
    let mut keep_current_best: Option<bool> = None;

    for off in FIRST_OFFSET_NUMBER..=page.tuple_count() {
        let keys = page.tuple(off).attrs(nkeys)?;
        let mut zero_penalty = true;
        let mut looked_at_all = true;

        for (attno, key) in keys.into_iter().enumerate() {
            let entry = state.dentry_init(attno, key, block, off, false)?;
            let penalty = state.penalty(attno, entry.as_ref(), identry[attno].as_ref())?;
            if penalty > 0.0 {
                zero_penalty = false;
            }

            match best_penalty[attno] {
                Some(best) if penalty == best => {}
                Some(best) if penalty > best => {
                    zero_penalty = false;
                    looked_at_all = false;
                    break;
                }
                _ => {
                    result = off;
                    best_penalty[attno] = Some(penalty);
                    if attno + 1 < nkeys {
                        best_penalty[attno + 1] = None;
                    }
                    keep_current_best = None;
                }
            }
        }

        if looked_at_all && result != off {
            let keep = *keep_current_best.get_or_insert_with(|| rel.coin_flip());
            if !keep {
                result = off;
                keep_current_best = None;
            }
        }

        if zero_penalty {
            let keep = *keep_current_best.get_or_insert_with(|| rel.coin_flip());
            if keep {
                break;
            }
        }
    }
    Ok(result)
}
