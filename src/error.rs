use std::io;

/// Error taxonomy for the FTL and file I/O engine.
///
/// `EraseFailure` — fatal, aborts the process — is deliberately absent
/// from this enum: a failed block erase leaves the allocator's bitmap in a
/// state no caller can safely recover from, so it surfaces as a `panic!`
/// at the call site instead of a `Result`.
#[derive(Debug, thiserror::Error)]
pub enum FtlError {
    #[error("device open failed: {0}")]
    DeviceOpen(#[source] io::Error),

    #[error("geometry query failed: {0}")]
    GeometryQuery(String),

    #[error("out of SSD space")]
    OutOfSpace,

    #[error("offset is out of bounds")]
    OutOfBounds,

    #[error("corrupt ftl file: {0}")]
    Corrupt(String),

    #[error("file has been closed")]
    ClosedHandle,

    #[error("device I/O error: {0}")]
    DeviceIo(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, FtlError>;
