//! Human-readable dumps of raw GiST pages, for debugging and the
//! `gist_inspect` tool.

use std::collections::{HashSet, VecDeque};

use comfy_table::{Cell, Table};

use crate::error::GistResult;
use crate::index::gist::page::{
    GistPage, F_DELETED, F_FOLLOW_RIGHT, F_HAS_GARBAGE, F_LEAF, F_TUPLES_DELETED, GIST_ROOT_BLKNO,
};
use crate::storage::page::{
    BlockNumber, FIRST_OFFSET_NUMBER, INVALID_BLOCK_NUMBER, LP_DEAD, LP_NORMAL, LP_REDIRECT,
    LP_UNUSED,
};

const TABLE_PRESET: &str = "||--+-++|    ++++++";

pub fn format_flags(flags: u16) -> String {
    let names = [
        (F_LEAF, "LEAF"),
        (F_DELETED, "DELETED"),
        (F_TUPLES_DELETED, "TUPLES_DELETED"),
        (F_FOLLOW_RIGHT, "FOLLOW_RIGHT"),
        (F_HAS_GARBAGE, "HAS_GARBAGE"),
    ];
    let set: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "-".to_string()
    } else {
        set.join("|")
    }
}

fn format_block(block: BlockNumber) -> String {
    if block == INVALID_BLOCK_NUMBER {
        "-".to_string()
    } else {
        block.to_string()
    }
}

/// One row per block: LSN, NSN, right link, flags, item count and free space.
pub fn pretty_format_page_headers(pages: &[(BlockNumber, Vec<u8>)]) -> Table {
    let mut table = Table::new();
    table.load_preset(TABLE_PRESET);
    table.set_header(vec![
        "block", "lsn", "nsn", "rightlink", "flags", "items", "free",
    ]);
    for (block, data) in pages {
        let page = GistPage::new(data.as_slice());
        if page.is_new() {
            table.add_row(vec![
                Cell::new(block),
                Cell::new("new"),
                Cell::new(""),
                Cell::new(""),
                Cell::new(""),
                Cell::new(""),
                Cell::new(""),
            ]);
            continue;
        }
        table.add_row(vec![
            Cell::new(block),
            Cell::new(page.lsn()),
            Cell::new(page.nsn()),
            Cell::new(format_block(page.rightlink())),
            Cell::new(format_flags(page.flags())),
            Cell::new(page.max_offset()),
            Cell::new(page.free_space()),
        ]);
    }
    table
}

/// The line pointer array of one page. Downlinks show the child block,
/// leaf items the heap TID.
pub fn pretty_format_page_items(block: BlockNumber, data: &[u8]) -> GistResult<Table> {
    let page = GistPage::new(data);
    page.check(block)?;
    let mut table = Table::new();
    table.load_preset(TABLE_PRESET);
    table.set_header(vec!["offset", "state", "len", "target", "invalid"]);
    for off in FIRST_OFFSET_NUMBER..=page.max_offset() {
        let item = page.item_id(off);
        let state = match item.flags {
            LP_UNUSED => "unused",
            LP_NORMAL => "normal",
            LP_REDIRECT => "redirect",
            LP_DEAD => "dead",
            _ => "?",
        };
        if !item.has_storage() {
            table.add_row(vec![
                Cell::new(off),
                Cell::new(state),
                Cell::new(0),
                Cell::new(""),
                Cell::new(""),
            ]);
            continue;
        }
        let tuple = page.tuple(off);
        let target = if page.is_leaf() {
            tuple.tid().to_string()
        } else {
            format!("-> {}", tuple.tid().block)
        };
        table.add_row(vec![
            Cell::new(off),
            Cell::new(state),
            Cell::new(item.len),
            Cell::new(target),
            Cell::new(if !page.is_leaf() && tuple.is_invalid() { "yes" } else { "" }),
        ]);
    }
    Ok(table)
}

/// Level-order dump of every page reachable from the root, including the
/// right siblings of unfinished splits.
pub fn pretty_format_tree<F>(mut read_block: F) -> GistResult<String>
where
    F: FnMut(BlockNumber) -> GistResult<Vec<u8>>,
{
    let mut display = String::new();
    let mut seen = HashSet::new();
    let mut current = VecDeque::from([GIST_ROOT_BLKNO]);
    let mut level = 0;
    while !current.is_empty() {
        let mut next = VecDeque::new();
        let mut pages = Vec::new();
        while let Some(block) = current.pop_front() {
            if block == INVALID_BLOCK_NUMBER || !seen.insert(block) {
                continue;
            }
            let data = read_block(block)?;
            let page = GistPage::new(data.as_slice());
            page.check(block)?;
            if page.follow_right() {
                current.push_back(page.rightlink());
            }
            if !page.is_leaf() && !page.is_deleted() {
                for off in FIRST_OFFSET_NUMBER..=page.tuple_count() {
                    next.push_back(page.downlink_block(off));
                }
            }
            pages.push((block, data));
        }
        if pages.is_empty() {
            break;
        }
        display.push_str(&format!("Level {}:\n", level));
        display.push_str(&format!("{}\n", pretty_format_page_headers(&pages)));
        level += 1;
        current = next;
    }
    Ok(display)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::gist::insert::gist_insert;
    use crate::storage::page::ItemPointer;
    use crate::tests::harness::range_relation;
    use crate::tests::opclasses::range_datum;

    #[test]
    fn flags_are_spelled_out() {
        assert_eq!(format_flags(0), "-");
        assert_eq!(format_flags(F_LEAF | F_HAS_GARBAGE), "LEAF|HAS_GARBAGE");
    }

    #[test]
    fn tree_dump_lists_every_level() {
        let (_dir, rel) = range_relation(1, Some(1));
        for i in 0..600u32 {
            let lo = i as i64;
            gist_insert(&rel, &[Some(range_datum(lo, lo + 1))], ItemPointer::new(i, 1)).unwrap();
        }
        let dump = pretty_format_tree(|block| Ok(rel.read_shared(block)?.data().to_vec())).unwrap();
        assert!(dump.contains("Level 0:"));
        assert!(dump.contains("Level 1:"));
        assert!(dump.contains("LEAF"));

        let root = rel.read_shared(GIST_ROOT_BLKNO).unwrap();
        let items = pretty_format_page_items(GIST_ROOT_BLKNO, root.data()).unwrap();
        assert!(items.to_string().contains("->"));
    }

    #[test]
    fn zero_page_is_reported_as_new() {
        let table = pretty_format_page_headers(&[(7, vec![0u8; crate::storage::page::BLCKSZ])]);
        assert!(table.to_string().contains("new"));
    }
}
