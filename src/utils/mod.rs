pub mod cache;
pub mod integer_set;
pub mod pairing_heap;
pub mod simple8b;
