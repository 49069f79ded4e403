pub mod control_file;
pub mod redo;
pub mod wal;

pub use control_file::{ControlFileManager, ControlFileSnapshot};
pub use redo::{RedoContext, RedoExecutor, RedoSummary, ResourceManager};
pub use wal::codec::{ResourceManagerId, WalFrame};
pub use wal::{Lsn, WalAppendResult, WalManager, FIRST_LSN};
