//! Generalized Search Tree access method.
//!
//! A balanced tree over an arbitrary key algebra supplied by per-column
//! operator classes ([`GistOpclass`]). Inner tuples hold union keys of their
//! subtrees; leaf tuples point at heap rows.

pub mod am;
pub mod build;
pub mod build_buffers;
pub mod choose;
pub mod insert;
pub mod inspect;
pub mod opclass;
pub mod options;
pub mod page;
pub mod relation;
pub mod scan;
pub mod split;
pub mod state;
pub mod tuple;
pub mod vacuum;
pub mod xlog;

pub use am::GistIndex;
pub use build::{HeapRow, IndexBuildResult};
pub use opclass::{
    Consistent, Datum, Distance, GistEntry, GistOpclass, IndexDescriptor, SplitVec,
    StrategyNumber, SubtypeId,
};
pub use options::{BufferingMode, GistOptions};
pub use relation::{CancelToken, FakeLsnSource, GistRelation};
pub use scan::{GistScan, OrderByKey, ScanKey, ScanResult, TidBitmap};
pub use vacuum::{BulkDeleteCallback, IndexBulkDeleteResult, IndexVacuumInfo};
