mod common;

pub use common::CommonCodec;

// data + consumed offset
pub type DecodedData<T> = (T, usize);
