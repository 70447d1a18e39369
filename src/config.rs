//! Ambient configuration. Parsing CLI flags or config files is out of
//! scope for this crate — the embedding application constructs this
//! struct itself and hands it to [`crate::device_api::NvmApi`]'s
//! caller-supplied [`crate::geometry::DeviceGeometrySource`].

use std::path::PathBuf;

use crate::allocator::AllocPolicy;

/// What the embedding application needs to decide before opening the FTL:
/// which character device to talk to, how to allocate pages, and where
/// the FTL state file lives.
#[derive(Debug, Clone)]
pub struct FtlConfig {
    pub device_path: PathBuf,
    pub alloc_policy: AllocPolicy,
    pub ftl_state_path: PathBuf,
}

impl FtlConfig {
    pub fn new(device_path: impl Into<PathBuf>, ftl_state_path: impl Into<PathBuf>) -> Self {
        FtlConfig {
            device_path: device_path.into(),
            alloc_policy: AllocPolicy::PerPage,
            ftl_state_path: ftl_state_path.into(),
        }
    }

    pub fn with_alloc_policy(mut self, policy: AllocPolicy) -> Self {
        self.alloc_policy = policy;
        self
    }
}
