use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{GistError, GistResult};
use crate::storage::page::{BlockNumber, BLCKSZ, INVALID_BLOCK_NUMBER};

static EMPTY_BLOCK: [u8; BLCKSZ] = [0; BLCKSZ];

/// A single relation file made of `BLCKSZ` blocks numbered from zero.
#[derive(Debug)]
pub struct DiskManager {
    path: PathBuf,
    num_blocks: AtomicU32,
    // Only one thread may move the file cursor at a time.
    db_file: Mutex<File>,
    // Held by anyone who needs a stable view of the relation size.
    extension_lock: Mutex<()>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> GistResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_path)?;

        let file_len = db_file.metadata()?.len();
        if file_len % BLCKSZ as u64 != 0 {
            warn!(
                "relation file {:?} has partial trailing block ({} bytes), ignoring it",
                db_path,
                file_len % BLCKSZ as u64
            );
        }
        let num_blocks = (file_len / BLCKSZ as u64) as BlockNumber;
        debug!(
            "Initialized disk_manager for {:?} with {} blocks",
            db_path, num_blocks
        );

        Ok(Self {
            path: db_path.to_path_buf(),
            num_blocks: AtomicU32::new(num_blocks),
            db_file: Mutex::new(db_file),
            extension_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_blocks(&self) -> BlockNumber {
        self.num_blocks.load(Ordering::Acquire)
    }

    /// Serialises relation extension against size checks.
    pub fn extension_lock(&self) -> MutexGuard<'_, ()> {
        self.extension_lock.lock()
    }

    pub fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> GistResult<()> {
        if block == INVALID_BLOCK_NUMBER || block >= self.num_blocks() {
            return Err(GistError::Storage(format!(
                "could not read block {} in file {:?}: relation has {} blocks",
                block,
                self.path,
                self.num_blocks()
            )));
        }
        if buf.len() != BLCKSZ {
            return Err(GistError::Internal(format!(
                "block buffer is {} bytes, expected {}",
                buf.len(),
                BLCKSZ
            )));
        }
        let mut guard = self.db_file.lock();
        guard.seek(SeekFrom::Start(block as u64 * BLCKSZ as u64))?;
        match guard.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                // extended in memory but never written
                buf.fill(0);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn write_block(&self, block: BlockNumber, data: &[u8]) -> GistResult<()> {
        if block == INVALID_BLOCK_NUMBER {
            return Err(GistError::Storage(
                "write_block: invalid block number".to_string(),
            ));
        }
        if data.len() != BLCKSZ {
            return Err(GistError::Internal(format!("Block size is not {}", BLCKSZ)));
        }
        let mut guard = self.db_file.lock();
        Self::write_block_internal(&mut guard, block, data)?;
        self.num_blocks.fetch_max(block + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Appends a zero-filled block and returns its number. Callers hold the
    /// extension lock when they need the new size to stay stable.
    pub fn extend(&self) -> GistResult<BlockNumber> {
        let mut guard = self.db_file.lock();
        let block = self.num_blocks.load(Ordering::Acquire);
        if block == INVALID_BLOCK_NUMBER {
            return Err(GistError::StructuralLimit(format!(
                "cannot extend file {:?} beyond {} blocks",
                self.path, INVALID_BLOCK_NUMBER
            )));
        }
        Self::write_block_internal(&mut guard, block, &EMPTY_BLOCK)?;
        self.num_blocks.store(block + 1, Ordering::Release);
        Ok(block)
    }

    pub fn sync(&self) -> GistResult<()> {
        let guard = self.db_file.lock();
        guard.sync_all()?;
        Ok(())
    }

    pub fn db_file_len(&self) -> GistResult<u64> {
        let guard = self.db_file.lock();
        Ok(guard.metadata()?.len())
    }

    fn write_block_internal(file: &mut File, block: BlockNumber, data: &[u8]) -> GistResult<()> {
        file.seek(SeekFrom::Start(block as u64 * BLCKSZ as u64))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_and_extend() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rel.gist");
        let disk_manager = DiskManager::try_new(&path).unwrap();
        assert_eq!(disk_manager.num_blocks(), 0);

        let b0 = disk_manager.extend().unwrap();
        let b1 = disk_manager.extend().unwrap();
        assert_eq!((b0, b1), (0, 1));

        let mut data = vec![0u8; BLCKSZ];
        data[..4].copy_from_slice(b"gist");
        disk_manager.write_block(1, &data).unwrap();

        let mut buf = vec![0xFFu8; BLCKSZ];
        disk_manager.read_block(1, &mut buf).unwrap();
        assert_eq!(&buf[..4], b"gist");
        disk_manager.read_block(0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        assert!(disk_manager.read_block(2, &mut buf).is_err());

        drop(disk_manager);
        let reopened = DiskManager::try_new(&path).unwrap();
        assert_eq!(reopened.num_blocks(), 2);
        assert_eq!(reopened.db_file_len().unwrap(), 2 * BLCKSZ as u64);
    }
}
