//! The directory-tree layer (name lookup, directory-wide fsync) is an
//! external collaborator — only the interface a file adapter uses to
//! call back into it is modeled here.

use std::sync::Arc;

use crate::file::{FtlFile, OpenMode};

/// What an adapter needs from its owning directory: a way to report that
/// it closed (so the directory can clear `opened_for_write` / drop the
/// last reference), and the directory's own name for diagnostics.
pub trait NvmDirectory: Send + Sync {
    fn nvm_fclose(&self, file: &Arc<FtlFile>, mode: OpenMode);
    fn name(&self) -> &str;
}
