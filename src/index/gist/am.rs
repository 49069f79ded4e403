//! `GistIndex`: one index relation on disk with its buffer pool, free space
//! map and write-ahead log, exposing the access method entry points.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use log::{debug, info};

use crate::buffer::BufferManager;
use crate::config::{GistConfig, RelPersistence};
use crate::error::{GistError, GistResult};
use crate::index::gist::build::{gist_build, HeapRow, IndexBuildResult};
use crate::index::gist::insert::gist_insert;
use crate::index::gist::opclass::{Datum, IndexDescriptor};
use crate::index::gist::options::GistOptions;
use crate::index::gist::relation::{FakeLsnSource, GistRelation, FIRST_NORMAL_UNLOGGED_LSN};
use crate::index::gist::scan::GistScan;
use crate::index::gist::state::GistState;
use crate::index::gist::vacuum::{
    bulk_delete, vacuum_cleanup, BulkDeleteCallback, IndexBulkDeleteResult, IndexVacuumInfo,
};
use crate::index::gist::xlog::GistResourceManager;
use crate::recovery::{Lsn, RedoExecutor, RedoSummary, ResourceManagerId, WalManager, FIRST_LSN};
use crate::storage::disk_manager::DiskManager;
use crate::storage::fsm::FreeSpaceMap;
use crate::storage::page::{BlockNumber, ItemPointer};
use crate::transaction::TransactionHorizon;

pub struct GistIndex {
    rel: GistRelation,
    options: GistOptions,
    config: GistConfig,
    path: PathBuf,
    /// Open for every relation except temporary ones; unlogged relations
    /// only use it for the control file.
    wal: Option<Arc<WalManager>>,
}

impl std::fmt::Debug for GistIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GistIndex")
            .field("rel", &self.rel)
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl GistIndex {
    /// Creates an empty index: a single leaf root.
    pub fn create(
        dir: impl AsRef<Path>,
        name: &str,
        desc: IndexDescriptor,
        horizon: Arc<dyn TransactionHorizon>,
        config: GistConfig,
        options: GistOptions,
    ) -> GistResult<Self> {
        let (index, _) = Self::build(
            dir,
            name,
            desc,
            horizon,
            config,
            options,
            std::iter::empty(),
        )?;
        Ok(index)
    }

    /// Creates the index and bulk-loads `rows` into it.
    pub fn build(
        dir: impl AsRef<Path>,
        name: &str,
        desc: IndexDescriptor,
        horizon: Arc<dyn TransactionHorizon>,
        config: GistConfig,
        options: GistOptions,
        rows: impl IntoIterator<Item = HeapRow>,
    ) -> GistResult<(Self, IndexBuildResult)> {
        let index = Self::setup(dir.as_ref(), name, desc, horizon, config, options)?;
        if index.rel.num_blocks() != 0 {
            return Err(GistError::Storage(format!(
                "relation \"{}\" already exists at {:?}",
                name, index.path
            )));
        }
        let result = gist_build(&index.rel, &index.options, &index.config.build, rows)?;
        info!(
            "built index \"{}\": {} heap tuples, {} index tuples, {} blocks",
            name,
            result.heap_tuples,
            result.index_tuples,
            index.rel.num_blocks()
        );
        // build pages carry no WAL, so they must reach disk before anything
        // is logged against them
        if index.config.persistence != RelPersistence::Temp {
            index.checkpoint()?;
        }
        Ok((index, result))
    }

    /// Opens an existing index, replaying the WAL written since the last
    /// checkpoint.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        desc: IndexDescriptor,
        horizon: Arc<dyn TransactionHorizon>,
        config: GistConfig,
        options: GistOptions,
    ) -> GistResult<Self> {
        if config.persistence == RelPersistence::Temp {
            return Err(GistError::NotSupported(format!(
                "cannot open temporary index \"{}\" from another session",
                name
            )));
        }
        let index = Self::setup(dir.as_ref(), name, desc, horizon, config, options)?;
        if index.rel.num_blocks() == 0 {
            return Err(GistError::Storage(format!(
                "index \"{}\" does not exist at {:?}",
                name, index.path
            )));
        }
        if index.rel.needs_wal() {
            let summary = index.recover()?;
            if summary.records > 0 {
                index.checkpoint()?;
            }
        }
        Ok(index)
    }

    fn setup(
        dir: &Path,
        name: &str,
        desc: IndexDescriptor,
        horizon: Arc<dyn TransactionHorizon>,
        config: GistConfig,
        options: GistOptions,
    ) -> GistResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.gist", name));
        let state = GistState::new(name, desc)?;

        let disk_manager = Arc::new(DiskManager::try_new(&path)?);
        let bpm = Arc::new(BufferManager::new_with_config(
            config.buffer_pool,
            disk_manager,
        ));
        let fsm = match config.persistence {
            RelPersistence::Temp => FreeSpaceMap::in_memory(),
            _ => FreeSpaceMap::open(&path)?,
        };

        let wal = match config.persistence {
            RelPersistence::Temp => None,
            _ => {
                let mut wal_config = config.wal.clone();
                if wal_config.directory.is_relative() {
                    wal_config.directory = dir.join(&wal_config.directory);
                }
                Some(Arc::new(WalManager::open(wal_config)?))
            }
        };

        let (rel_wal, fake_lsn) = match (config.persistence, &wal) {
            (RelPersistence::Permanent, Some(wal)) if config.wal_enabled => {
                (Some(wal.clone()), FakeLsnSource::local())
            }
            (RelPersistence::Permanent, Some(wal)) => {
                (None, FakeLsnSource::assign_lsn(wal.clone()))
            }
            (RelPersistence::Unlogged, Some(wal)) => {
                let start = wal
                    .control_snapshot()
                    .unlogged_lsn
                    .max(FIRST_NORMAL_UNLOGGED_LSN);
                (None, FakeLsnSource::shared(Arc::new(AtomicU64::new(start))))
            }
            _ => (None, FakeLsnSource::local()),
        };
        if config.persistence == RelPersistence::Permanent {
            if let Some(wal) = &wal {
                bpm.set_wal_manager(wal.clone());
            }
        }

        debug!(
            "opening index \"{}\" at {:?}, persistence {:?}, wal {}",
            name,
            path,
            config.persistence,
            rel_wal.is_some()
        );
        let rel = GistRelation::new(
            bpm,
            Arc::new(fsm),
            rel_wal,
            fake_lsn,
            horizon,
            config.persistence,
            state,
            config.choose_seed,
        );
        Ok(Self {
            rel,
            options,
            config,
            path,
            wal,
        })
    }

    fn recover(&self) -> GistResult<RedoSummary> {
        let Some(wal) = &self.wal else {
            return Ok(RedoSummary::default());
        };
        let from = wal.control_snapshot().checkpoint_lsn.max(FIRST_LSN);
        let mut redo = RedoExecutor::new(self.rel.bpm().clone());
        redo.register(ResourceManagerId::Gist, Arc::new(GistResourceManager));
        redo.replay(wal, from)
    }

    /// Inserts one row. Uniqueness is never checked.
    pub fn insert(&self, values: &[Option<Datum>], tid: ItemPointer) -> GistResult<()> {
        gist_insert(&self.rel, values, tid)
    }

    /// A scan with no keys yet; call `rescan` to start it.
    pub fn begin_scan(&self) -> GistScan<'_> {
        GistScan::new(&self.rel)
    }

    pub fn bulk_delete(
        &self,
        info: &IndexVacuumInfo,
        stats: Option<IndexBulkDeleteResult>,
        callback: BulkDeleteCallback<'_>,
    ) -> GistResult<IndexBulkDeleteResult> {
        bulk_delete(&self.rel, info, stats, callback)
    }

    pub fn vacuum_cleanup(
        &self,
        info: &IndexVacuumInfo,
        stats: Option<IndexBulkDeleteResult>,
    ) -> GistResult<Option<IndexBulkDeleteResult>> {
        let stats = vacuum_cleanup(&self.rel, info, stats)?;
        if stats.is_some_and(|s| s.pages_free > 0) {
            self.rel.fsm().vacuum()?;
        }
        Ok(stats)
    }

    /// Whether index-only scans can return column `attno`.
    pub fn can_return(&self, attno: usize) -> bool {
        self.rel.state().can_return(attno)
    }

    pub fn options(&self) -> &GistOptions {
        &self.options
    }

    pub fn parse_options<'a>(options: impl IntoIterator<Item = &'a str>) -> GistResult<GistOptions> {
        GistOptions::parse(options)
    }

    /// Writes every dirty page and records a new recovery start point.
    pub fn checkpoint(&self) -> GistResult<()> {
        let redo_lsn = self.wal.as_ref().map(|wal| wal.insert_lsn());
        self.flush()?;
        if let Some(wal) = &self.wal {
            let redo_lsn = redo_lsn.unwrap_or(FIRST_LSN);
            wal.checkpoint(redo_lsn, self.rel.unlogged_lsn().unwrap_or(0))?;
        }
        Ok(())
    }

    /// Makes every change logged so far durable, as a commit would.
    pub fn flush_wal(&self) -> GistResult<Lsn> {
        match &self.wal {
            Some(wal) => wal.flush(None),
            None => Ok(0),
        }
    }

    /// Writes every dirty page and the free space map to disk.
    pub fn flush(&self) -> GistResult<()> {
        self.rel.bpm().flush_all_pages()?;
        self.rel.bpm().disk_manager().sync()?;
        self.rel.fsm().vacuum()
    }

    pub fn num_blocks(&self) -> BlockNumber {
        self.rel.num_blocks()
    }

    pub fn relation(&self) -> &GistRelation {
        &self.rel
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clean shutdown. Temporary indexes are simply dropped.
    pub fn close(self) -> GistResult<()> {
        if self.config.persistence != RelPersistence::Temp {
            self.checkpoint()?;
        }
        Ok(())
    }
}
