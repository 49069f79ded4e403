use std::path::PathBuf;

use derive_with::With;

#[derive(Debug, Clone, Copy, With)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    pub lru_k_k: usize,
    /// Stamp and verify page checksums on every disk transfer.
    pub data_checksums: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1024,
            lru_k_k: 2,
            data_checksums: true,
        }
    }
}

#[derive(Debug, Clone, With)]
pub struct WalConfig {
    pub directory: PathBuf,
    pub sync_on_flush: bool,
    /// Bytes buffered in memory before an implicit flush.
    pub buffer_capacity: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            directory: PathBuf::from("wal"),
            sync_on_flush: true,
            buffer_capacity: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, With)]
pub struct GistBuildConfig {
    /// Planner's notion of cached pages, drives the `auto` buffering switch.
    pub effective_cache_size: usize,
    /// Memory budget for a buffered build, in KiB.
    pub maintenance_work_mem: usize,
    /// Number of heap rows formed into index tuples per parallel batch.
    pub batch_size: usize,
}

impl Default for GistBuildConfig {
    fn default() -> Self {
        GistBuildConfig {
            effective_cache_size: 524_288,
            maintenance_work_mem: 65_536,
            batch_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelPersistence {
    #[default]
    Permanent,
    Unlogged,
    Temp,
}

impl RelPersistence {
    pub fn needs_wal(&self) -> bool {
        matches!(self, RelPersistence::Permanent)
    }
}

#[derive(Debug, Clone, With)]
pub struct GistConfig {
    pub persistence: RelPersistence,
    /// Seed for the choose-subtree tie-break; `None` mixes in the process start time.
    pub choose_seed: Option<u64>,
    /// Write-ahead log every page change of a permanent relation.
    pub wal_enabled: bool,
    pub buffer_pool: BufferPoolConfig,
    pub wal: WalConfig,
    pub build: GistBuildConfig,
}

impl Default for GistConfig {
    fn default() -> Self {
        GistConfig {
            persistence: RelPersistence::Permanent,
            choose_seed: None,
            wal_enabled: true,
            buffer_pool: BufferPoolConfig::default(),
            wal: WalConfig::default(),
            build: GistBuildConfig::default(),
        }
    }
}
