pub mod buffer;
pub mod config;
pub mod error;
pub mod index;
pub mod recovery;
pub mod storage;
pub mod transaction;
pub mod utils;

#[cfg(test)]
mod tests;
