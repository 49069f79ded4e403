use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::random;
use serde::{Deserialize, Serialize};

use crate::error::{GistError, GistResult};
use crate::recovery::Lsn;

const CONTROL_FILE_NAME: &str = "control.dat";
const CONTROL_FILE_VERSION: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ControlFileData {
    version: u32,
    system_id: u128,
    durable_lsn: Lsn,
    checkpoint_lsn: Lsn,
    last_record_start: Lsn,
    /// Shared fake-LSN counter for unlogged relations.
    unlogged_lsn: Lsn,
}

impl ControlFileData {
    fn new(system_id: u128) -> Self {
        Self {
            version: CONTROL_FILE_VERSION,
            system_id,
            durable_lsn: 0,
            checkpoint_lsn: 0,
            last_record_start: 0,
            unlogged_lsn: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlFileSnapshot {
    pub system_id: u128,
    pub durable_lsn: Lsn,
    pub checkpoint_lsn: Lsn,
    pub last_record_start: Lsn,
    pub unlogged_lsn: Lsn,
}

#[derive(Debug)]
pub struct ControlFileManager {
    path: PathBuf,
    inner: Mutex<ControlFileData>,
}

impl ControlFileManager {
    pub fn load_or_init(directory: &Path) -> GistResult<(Self, ControlFileSnapshot)> {
        fs::create_dir_all(directory)?;
        let path = directory.join(CONTROL_FILE_NAME);
        let (data, newly_created) = if path.exists() {
            let bytes = fs::read(&path)?;
            let data: ControlFileData = bincode::deserialize(&bytes)?;
            if data.version != CONTROL_FILE_VERSION {
                return Err(GistError::Internal(format!(
                    "Unsupported control file version: {}",
                    data.version
                )));
            }
            (data, false)
        } else {
            (ControlFileData::new(generate_system_id()), true)
        };

        let manager = Self {
            path,
            inner: Mutex::new(data),
        };
        if newly_created {
            manager.persist()?;
        }
        let snapshot = manager.snapshot();
        Ok((manager, snapshot))
    }

    pub fn snapshot(&self) -> ControlFileSnapshot {
        let guard = self.inner.lock();
        ControlFileSnapshot {
            system_id: guard.system_id,
            durable_lsn: guard.durable_lsn,
            checkpoint_lsn: guard.checkpoint_lsn,
            last_record_start: guard.last_record_start,
            unlogged_lsn: guard.unlogged_lsn,
        }
    }

    pub fn update_durable(&self, durable_lsn: Lsn, last_record_start: Lsn) -> GistResult<()> {
        {
            let mut guard = self.inner.lock();
            guard.durable_lsn = durable_lsn;
            guard.last_record_start = last_record_start;
        }
        self.persist()
    }

    pub fn update_checkpoint(&self, checkpoint_lsn: Lsn, unlogged_lsn: Lsn) -> GistResult<()> {
        {
            let mut guard = self.inner.lock();
            guard.checkpoint_lsn = checkpoint_lsn;
            guard.unlogged_lsn = guard.unlogged_lsn.max(unlogged_lsn);
        }
        self.persist()
    }

    fn persist(&self) -> GistResult<()> {
        let guard = self.inner.lock();
        let bytes = bincode::serialize(&*guard)?;
        drop(guard);
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}

fn generate_system_id() -> u128 {
    random::<u128>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checkpoint_state_survives_reload() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, initial) = ControlFileManager::load_or_init(temp_dir.path()).unwrap();
        assert_eq!(initial.checkpoint_lsn, 0);
        manager.update_durable(512, 400).unwrap();
        manager.update_checkpoint(256, 77).unwrap();
        manager.update_checkpoint(300, 10).unwrap();
        drop(manager);

        let (_, snapshot) = ControlFileManager::load_or_init(temp_dir.path()).unwrap();
        assert_eq!(snapshot.system_id, initial.system_id);
        assert_eq!(snapshot.durable_lsn, 512);
        assert_eq!(snapshot.last_record_start, 400);
        assert_eq!(snapshot.checkpoint_lsn, 300);
        assert_eq!(snapshot.unlogged_lsn, 77);
    }
}
