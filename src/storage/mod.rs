pub mod codec;
pub mod disk_manager;
pub mod fsm;
pub mod page;
