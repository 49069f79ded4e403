use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::buffer::BufferManager;
use crate::error::GistResult;
use crate::recovery::wal::codec::{ResourceManagerId, WalFrame};
use crate::recovery::{Lsn, WalManager};

#[derive(Clone)]
pub struct RedoContext {
    pub buffer_manager: Arc<BufferManager>,
}

/// Replays the records of one resource manager.
pub trait ResourceManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies `frame`, returning the number of pages changed.
    fn redo(&self, frame: &WalFrame, ctx: &RedoContext) -> GistResult<usize>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RedoSummary {
    pub records: usize,
    pub pages_changed: usize,
    pub end_lsn: Lsn,
}

pub struct RedoExecutor {
    ctx: RedoContext,
    managers: HashMap<ResourceManagerId, Arc<dyn ResourceManager>>,
}

impl RedoExecutor {
    pub fn new(buffer_manager: Arc<BufferManager>) -> Self {
        Self {
            ctx: RedoContext { buffer_manager },
            managers: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: ResourceManagerId, manager: Arc<dyn ResourceManager>) {
        self.managers.insert(id, manager);
    }

    pub fn apply(&self, frame: &WalFrame) -> GistResult<usize> {
        match self.managers.get(&frame.rmid) {
            Some(manager) => manager.redo(frame, &self.ctx),
            None => Ok(0),
        }
    }

    /// Replays every record from `from` to the end of the log.
    pub fn replay(&self, wal: &WalManager, from: Lsn) -> GistResult<RedoSummary> {
        let mut summary = RedoSummary {
            end_lsn: from,
            ..Default::default()
        };
        for frame in wal.read_frames(from)? {
            summary.pages_changed += self.apply(&frame)?;
            summary.records += 1;
            summary.end_lsn = frame.end_lsn;
        }
        info!(
            "redo done: {} records, {} pages changed, end lsn {}",
            summary.records, summary.pages_changed, summary.end_lsn
        );
        Ok(summary)
    }
}
