//! The four file adapters (C5-C8) bound to an [`crate::file::FtlFile`].
//! Each holds a borrow of the file, the device handle, a fixed channel
//! index (0, matching the reference) and its own cursor state.

mod append;
mod random_read;
mod random_rw;
mod sequential;

pub use append::AppendWriter;
pub use random_read::{AccessPattern, RandomAccessReader};
pub use random_rw::RandomRwFile;
pub use sequential::SequentialReader;
