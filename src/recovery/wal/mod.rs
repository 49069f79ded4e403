pub mod codec;

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::WalConfig;
use crate::error::GistResult;
use crate::recovery::control_file::{ControlFileManager, ControlFileSnapshot};
use crate::recovery::wal::codec::{build_frame, decode_frame, ResourceManagerId, WalFrame};

pub type Lsn = u64;

/// Byte position mapped to the start of the log file. Keeps every real
/// record LSN above the small constants used for unlogged builds.
pub const FIRST_LSN: Lsn = 16;

const WAL_FILE_NAME: &str = "gist.wal";

#[derive(Debug, Clone, Copy)]
pub struct WalAppendResult {
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
}

#[derive(Debug)]
struct WalState {
    file: File,
    buffer: Vec<u8>,
    next_lsn: Lsn,
    last_record_start: Lsn,
}

#[derive(Debug)]
pub struct WalManager {
    config: WalConfig,
    path: PathBuf,
    state: Mutex<WalState>,
    insert_lsn: AtomicU64,
    durable_lsn: AtomicU64,
    control_file: Arc<ControlFileManager>,
}

impl WalManager {
    /// Opens the log in `config.directory`, cutting off a torn tail left by
    /// a crash in the middle of a write.
    pub fn open(config: WalConfig) -> GistResult<Self> {
        fs::create_dir_all(&config.directory)?;
        let (control_file, snapshot) = ControlFileManager::load_or_init(&config.directory)?;
        let path = config.directory.join(WAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let (valid_len, last_record_start) = scan_valid_prefix(&contents);
        if valid_len < contents.len() {
            warn!(
                "WAL {:?}: discarding {} bytes of torn tail at offset {}",
                path,
                contents.len() - valid_len,
                valid_len
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;
        let next_lsn = FIRST_LSN + valid_len as Lsn;
        debug!("opened WAL {:?}, next lsn {}", path, next_lsn);

        Ok(Self {
            config,
            path,
            state: Mutex::new(WalState {
                file,
                buffer: Vec::new(),
                next_lsn,
                last_record_start: last_record_start.unwrap_or(snapshot.last_record_start),
            }),
            insert_lsn: AtomicU64::new(next_lsn),
            durable_lsn: AtomicU64::new(next_lsn),
            control_file: Arc::new(control_file),
        })
    }

    pub fn control_file(&self) -> Arc<ControlFileManager> {
        self.control_file.clone()
    }

    pub fn control_snapshot(&self) -> ControlFileSnapshot {
        self.control_file.snapshot()
    }

    /// Appends one record. The returned `end_lsn` is what pages touched by
    /// the record are stamped with.
    pub fn append(
        &self,
        rmid: ResourceManagerId,
        info: u8,
        body: &[u8],
    ) -> GistResult<WalAppendResult> {
        let mut state = self.state.lock();
        let start_lsn = state.next_lsn;
        let frame = build_frame(start_lsn, state.last_record_start, rmid, info, body);
        state.buffer.extend_from_slice(&frame);
        state.next_lsn += frame.len() as Lsn;
        state.last_record_start = start_lsn;
        let end_lsn = state.next_lsn;
        self.insert_lsn.store(end_lsn, Ordering::Release);
        if state.buffer.len() >= self.config.buffer_capacity {
            Self::write_buffer(&mut state)?;
        }
        Ok(WalAppendResult { start_lsn, end_lsn })
    }

    /// Makes the log durable at least up to `upto` (everything when `None`).
    pub fn flush(&self, upto: Option<Lsn>) -> GistResult<Lsn> {
        let target = upto.unwrap_or(Lsn::MAX);
        if self.durable_lsn() >= target {
            return Ok(self.durable_lsn());
        }
        let mut state = self.state.lock();
        if self.durable_lsn() >= target.min(state.next_lsn) {
            return Ok(self.durable_lsn());
        }
        Self::write_buffer(&mut state)?;
        if self.config.sync_on_flush {
            state.file.sync_data()?;
        }
        let durable = state.next_lsn;
        self.durable_lsn.store(durable, Ordering::Release);
        self.control_file
            .update_durable(durable, state.last_record_start)?;
        Ok(durable)
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    /// End of the last inserted record.
    pub fn insert_lsn(&self) -> Lsn {
        self.insert_lsn.load(Ordering::Acquire)
    }

    /// Records that every page change before `redo_lsn` is on disk, so
    /// recovery may start there.
    pub fn checkpoint(&self, redo_lsn: Lsn, unlogged_lsn: Lsn) -> GistResult<()> {
        self.flush(None)?;
        self.control_file.update_checkpoint(redo_lsn, unlogged_lsn)?;
        info!("checkpoint complete: redo lsn {}", redo_lsn);
        Ok(())
    }

    /// Every complete frame starting at or after `from`.
    pub fn read_frames(&self, from: Lsn) -> GistResult<Vec<WalFrame>> {
        self.flush(None)?;
        let bytes = fs::read(&self.path)?;
        let mut frames = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            match decode_frame(&bytes[offset..]) {
                Ok((frame, len)) => {
                    if frame.lsn >= from {
                        frames.push(frame);
                    }
                    offset += len;
                }
                Err(e) => {
                    warn!("stopping WAL read at offset {}: {}", offset, e);
                    break;
                }
            }
        }
        Ok(frames)
    }

    fn write_buffer(state: &mut WalState) -> GistResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        state.file.write_all(&state.buffer)?;
        state.file.flush()?;
        state.buffer.clear();
        Ok(())
    }
}

/// Length of the decodable prefix of the log and the start of its last record.
fn scan_valid_prefix(bytes: &[u8]) -> (usize, Option<Lsn>) {
    let mut offset = 0usize;
    let mut last = None;
    while offset < bytes.len() {
        match decode_frame(&bytes[offset..]) {
            Ok((frame, len)) if frame.lsn == FIRST_LSN + offset as Lsn => {
                last = Some(frame.lsn);
                offset += len;
            }
            _ => break,
        }
    }
    (offset, last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wal_config(dir: &TempDir) -> WalConfig {
        WalConfig::default()
            .with_directory(dir.path().join("wal"))
            .with_buffer_capacity(128usize)
    }

    #[test]
    fn append_flush_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let wal = WalManager::open(wal_config(&temp_dir)).unwrap();
        let first = wal.append(ResourceManagerId::Gist, 1, b"one").unwrap();
        let second = wal.append(ResourceManagerId::Gist, 2, b"two").unwrap();
        assert_eq!(first.start_lsn, FIRST_LSN);
        assert_eq!(second.start_lsn, first.end_lsn);
        assert!(wal.durable_lsn() < second.end_lsn);
        assert_eq!(wal.flush(Some(first.end_lsn)).unwrap(), second.end_lsn);
        drop(wal);

        let wal = WalManager::open(wal_config(&temp_dir)).unwrap();
        assert_eq!(wal.insert_lsn(), second.end_lsn);
        let frames = wal.read_frames(FIRST_LSN).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].prev_lsn, first.start_lsn);
        assert_eq!(frames[1].body, b"two");
        assert_eq!(wal.read_frames(second.start_lsn).unwrap().len(), 1);
        assert_eq!(wal.control_snapshot().durable_lsn, second.end_lsn);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let config = wal_config(&temp_dir);
        let end = {
            let wal = WalManager::open(config.clone()).unwrap();
            let rec = wal.append(ResourceManagerId::Gist, 1, b"kept").unwrap();
            wal.flush(None).unwrap();
            rec.end_lsn
        };
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(config.directory.join(WAL_FILE_NAME))
                .unwrap();
            file.write_all(&[0x4c, 0x41, 0x57, 0x51, 3, 0]).unwrap();
        }
        let wal = WalManager::open(config).unwrap();
        assert_eq!(wal.insert_lsn(), end);
        let next = wal.append(ResourceManagerId::Gist, 3, b"after").unwrap();
        assert_eq!(next.start_lsn, end);
        assert_eq!(wal.read_frames(0).unwrap().len(), 2);
    }
}
