//! Test-only collaborators standing in for real hardware: a device
//! geometry source backed by a temp file, and a directory that does
//! nothing. Neither ships in a production build of this crate, but both
//! are exported unconditionally (not `#[cfg(test)]`-gated) so integration
//! tests under `tests/` can use them too.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::allocator::AllocPolicy;
use crate::device_api::NvmApi;
use crate::directory::NvmDirectory;
use crate::error::Result;
use crate::file::{FtlFile, OpenMode};
use crate::geometry::{raw_pwrite, BlockToken, ChannelGranularity, DeviceGeometrySource};

/// A whole-device stand-in: one backing temp file, sized to hold every
/// (lun, block, page) the simulated geometry can address, with a single
/// channel per LUN. Small and uniform on purpose — tests reason about
/// exact page counts and offsets.
pub struct SimulatedDevice {
    backing: NamedTempFile,
    path: PathBuf,
    nr_luns: u64,
    nr_blocks_per_lun: u64,
    nr_pages_per_block: u64,
    page_size: u32,
}

impl SimulatedDevice {
    pub fn new(nr_luns: u64, nr_blocks_per_lun: u64, nr_pages_per_block: u64, page_size: u32) -> Self {
        let backing = NamedTempFile::new().expect("failed to create backing temp file");
        let total = nr_luns * nr_blocks_per_lun * nr_pages_per_block * page_size as u64;
        backing
            .as_file()
            .set_len(total)
            .expect("failed to size backing temp file");
        let path = backing.path().to_path_buf();

        SimulatedDevice {
            backing,
            path,
            nr_luns,
            nr_blocks_per_lun,
            nr_pages_per_block,
            page_size,
        }
    }

    /// A small, deterministic default geometry: 2 LUNs, 4 blocks/LUN, 8
    /// pages/block, 8-byte pages. Big enough to exercise block-mode
    /// allocation and multi-page files without tests needing to reason
    /// about a large table.
    pub fn default_geometry() -> Self {
        SimulatedDevice::new(2, 4, 8, 8)
    }
}

impl DeviceGeometrySource for SimulatedDevice {
    fn nr_luns(&self) -> Result<u64> {
        Ok(self.nr_luns)
    }

    fn pages_per_block(&self, _lun: u64) -> Result<u64> {
        Ok(self.nr_pages_per_block)
    }

    fn nchannels(&self, _lun: u64) -> Result<u64> {
        Ok(1)
    }

    fn channel_granularity(&self, _lun: u64, _chnl: u64) -> Result<ChannelGranularity> {
        Ok(ChannelGranularity {
            gran_read: self.page_size,
            gran_write: self.page_size,
            gran_erase: self.page_size * self.nr_pages_per_block as u32,
        })
    }

    fn nr_blocks(&self, _lun: u64) -> Result<u64> {
        Ok(self.nr_blocks_per_lun)
    }

    fn block_token(&self, lun: u64, block: u64) -> Result<BlockToken> {
        Ok(BlockToken(lun * self.nr_blocks_per_lun + block))
    }

    fn erase_block(&self, _token: BlockToken) -> Result<()> {
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.backing.as_file().as_raw_fd()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Build a fully-opened [`NvmApi`] over a [`SimulatedDevice::default_geometry`],
/// using per-page allocation. Panics on failure since every test fixture
/// here is expected to succeed.
pub fn make_test_api() -> NvmApi {
    NvmApi::open(Box::new(SimulatedDevice::default_geometry()), AllocPolicy::PerPage)
        .expect("failed to open simulated NvmApi")
}

pub fn make_test_api_with_policy(policy: AllocPolicy) -> NvmApi {
    NvmApi::open(Box::new(SimulatedDevice::default_geometry()), policy)
        .expect("failed to open simulated NvmApi")
}

/// Wraps a [`SimulatedDevice`] and fails the *first* `pwrite` it sees with
/// `EINTR`, then forwards every call after that (including the retry) to
/// the real syscall. Exercises `write_page`'s stale-page retry path
/// (the "EINTR transparency" property) without needing actual signal
/// delivery.
pub struct EintrOnceDevice {
    inner: SimulatedDevice,
    fired: std::sync::atomic::AtomicBool,
}

impl EintrOnceDevice {
    pub fn new(inner: SimulatedDevice) -> Self {
        EintrOnceDevice {
            inner,
            fired: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl DeviceGeometrySource for EintrOnceDevice {
    fn nr_luns(&self) -> Result<u64> {
        self.inner.nr_luns()
    }

    fn pages_per_block(&self, lun: u64) -> Result<u64> {
        self.inner.pages_per_block(lun)
    }

    fn nchannels(&self, lun: u64) -> Result<u64> {
        self.inner.nchannels(lun)
    }

    fn channel_granularity(&self, lun: u64, chnl: u64) -> Result<ChannelGranularity> {
        self.inner.channel_granularity(lun, chnl)
    }

    fn nr_blocks(&self, lun: u64) -> Result<u64> {
        self.inner.nr_blocks(lun)
    }

    fn block_token(&self, lun: u64, block: u64) -> Result<BlockToken> {
        self.inner.block_token(lun, block)
    }

    fn erase_block(&self, token: BlockToken) -> Result<()> {
        self.inner.erase_block(token)
    }

    fn fd(&self) -> RawFd {
        self.inner.fd()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::from_raw_os_error(libc::EINTR));
        }
        raw_pwrite(fd, buf, offset)
    }
}

/// A directory collaborator that records nothing and does nothing; used
/// wherever a test needs *a* [`NvmDirectory`] but isn't exercising
/// directory behavior itself.
pub struct NullDirectory;

impl NullDirectory {
    pub fn arc() -> Arc<dyn NvmDirectory> {
        Arc::new(NullDirectory)
    }
}

impl NvmDirectory for NullDirectory {
    fn nvm_fclose(&self, _file: &Arc<FtlFile>, _mode: OpenMode) {}

    fn name(&self) -> &str {
        ""
    }
}
