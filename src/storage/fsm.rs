//! Free-space map for index relations: a page is either fully free or not
//! tracked. Kept in memory and persisted to a sidecar file on `vacuum`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::GistResult;
use crate::storage::page::BlockNumber;

const FSM_FILE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct FsmData {
    version: u32,
    free_pages: BTreeSet<BlockNumber>,
}

#[derive(Debug, Default)]
struct FsmState {
    free_pages: BTreeSet<BlockNumber>,
    dirty: bool,
}

#[derive(Debug)]
pub struct FreeSpaceMap {
    path: Option<PathBuf>,
    state: Mutex<FsmState>,
}

impl FreeSpaceMap {
    /// Loads the map stored next to `relation_path`, or starts empty.
    pub fn open(relation_path: &Path) -> GistResult<Self> {
        let mut path = relation_path.as_os_str().to_owned();
        path.push(".fsm");
        let path = PathBuf::from(path);
        let free_pages = if path.exists() {
            let bytes = fs::read(&path)?;
            let data: FsmData = bincode::deserialize(&bytes)?;
            if data.version != FSM_FILE_VERSION {
                debug!(
                    "ignoring free space map {:?} with version {}",
                    path, data.version
                );
                BTreeSet::new()
            } else {
                data.free_pages
            }
        } else {
            BTreeSet::new()
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(FsmState {
                free_pages,
                dirty: false,
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(FsmState::default()),
        }
    }

    pub fn record_free_page(&self, block: BlockNumber) {
        let mut state = self.state.lock();
        if state.free_pages.insert(block) {
            state.dirty = true;
        }
    }

    /// Hands out the lowest free page and forgets it.
    pub fn get_free_page(&self) -> Option<BlockNumber> {
        let mut state = self.state.lock();
        let block = state.free_pages.pop_first()?;
        state.dirty = true;
        Some(block)
    }

    pub fn is_free(&self, block: BlockNumber) -> bool {
        self.state.lock().free_pages.contains(&block)
    }

    pub fn num_free_pages(&self) -> usize {
        self.state.lock().free_pages.len()
    }

    /// Makes recorded pages durable so allocators in later sessions find them.
    pub fn vacuum(&self) -> GistResult<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let data = FsmData {
                version: FSM_FILE_VERSION,
                free_pages: state.free_pages.clone(),
            };
            let bytes = bincode::serialize(&data)?;
            let mut tmp = path.as_os_str().to_owned();
            tmp.push(".tmp");
            let tmp = PathBuf::from(tmp);
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, path)?;
            debug!(
                "vacuumed free space map {:?}: {} free pages",
                path,
                state.free_pages.len()
            );
        }
        state.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn free_pages_survive_vacuum_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let rel = temp_dir.path().join("idx");
        let fsm = FreeSpaceMap::open(&rel).unwrap();
        fsm.record_free_page(9);
        fsm.record_free_page(4);
        fsm.vacuum().unwrap();
        drop(fsm);

        let fsm = FreeSpaceMap::open(&rel).unwrap();
        assert_eq!(fsm.num_free_pages(), 2);
        assert_eq!(fsm.get_free_page(), Some(4));
        assert_eq!(fsm.get_free_page(), Some(9));
        assert_eq!(fsm.get_free_page(), None);
    }
}
