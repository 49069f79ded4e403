pub mod buffer_manager;
pub mod buffer_pool;
pub mod page;

pub use buffer_manager::BufferManager;
pub use buffer_pool::{BufferPool, FrameId};
pub use page::{ReadPageGuard, WritePageGuard};
