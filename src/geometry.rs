//! Device geometry cache (C1).
//!
//! Enumerates LUNs, channels, blocks-per-LUN, pages-per-block and the
//! per-channel read/write/erase granularities at device open, then exposes a
//! read-only table for the rest of the FTL. The specific ioctl command codes
//! and device-discovery protocol (e.g. the lightnvm `configure` sysfs dance)
//! are external collaborators: this module only consumes the
//! [`DeviceGeometrySource`] trait, never a concrete ioctl number.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{FtlError, Result};

/// Opaque driver-owned handle for a physical block, returned by the
/// "get block by id" ioctl. The FTL never interprets its contents; it is
/// only round-tripped back to `erase_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockToken(pub u64);

/// Per-channel access granularities, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGranularity {
    pub gran_read: u32,
    pub gran_write: u32,
    pub gran_erase: u32,
}

impl ChannelGranularity {
    fn validate(&self) -> Result<()> {
        if self.gran_write > self.gran_erase {
            return Err(FtlError::GeometryQuery(format!(
                "gran_write ({}) exceeds gran_erase ({})",
                self.gran_write, self.gran_erase
            )));
        }
        if self.gran_write == 0 || self.gran_read == 0 {
            return Err(FtlError::GeometryQuery(
                "zero granularity reported by device".into(),
            ));
        }
        if self.gran_write % self.gran_read != 0 {
            return Err(FtlError::GeometryQuery(format!(
                "gran_read ({}) does not divide gran_write ({})",
                self.gran_read, self.gran_write
            )));
        }
        Ok(())
    }
}

/// South-side collaborator: the raw device/ioctl protocol used to discover
/// geometry and to erase blocks. Device discovery (materializing the
/// character device under a known path) and the exact ioctl command codes
/// live outside this crate; production code supplies a real implementation,
/// tests use [`crate::testing::SimulatedDevice`].
pub trait DeviceGeometrySource {
    fn nr_luns(&self) -> Result<u64>;
    fn pages_per_block(&self, lun: u64) -> Result<u64>;
    fn nchannels(&self, lun: u64) -> Result<u64>;
    fn channel_granularity(&self, lun: u64, chnl: u64) -> Result<ChannelGranularity>;
    fn nr_blocks(&self, lun: u64) -> Result<u64>;
    fn block_token(&self, lun: u64, block: u64) -> Result<BlockToken>;
    /// Erase a block via the driver. Failure here is fatal to the caller:
    /// the block is lost and the process aborts.
    fn erase_block(&self, token: BlockToken) -> Result<()>;

    fn fd(&self) -> RawFd;
    fn path(&self) -> &Path;

    /// Positional write through `fd` (the caller's own handle, typically a
    /// file's dup'd device descriptor) at `offset`. The default forwards to
    /// a real `pwrite` syscall; fault-injecting test doubles override this
    /// to simulate EINTR without needing real signal delivery.
    fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        raw_pwrite(fd, buf, offset)
    }
}

/// Raw positional write via `pwrite(2)`, forwarding the OS's interrupted or
/// short-write outcome unchanged. Backs [`DeviceGeometrySource::pwrite`]'s
/// default implementation, and is reusable by fault-injecting test doubles
/// that want to delegate to the real syscall once they're done simulating
/// a fault.
pub fn raw_pwrite(fd: RawFd, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    let n = unsafe {
        libc::pwrite(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub gran: ChannelGranularity,
}

/// A single physical page in the geometry table. `allocated`/`erased` are
/// the allocator's mutable bits; everything else is fixed at open time.
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    pub lun_id: u64,
    pub block_id: u64,
    pub id: u64,
    /// Per-channel write granularity, copied from the LUN's channel table.
    pub sizes: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    pub token: BlockToken,
    pub pages: Vec<PageDescriptor>,
}

#[derive(Debug, Clone)]
pub struct Lun {
    pub nr_pages_per_blk: u64,
    pub nr_blocks: u64,
    pub channels: Vec<Channel>,
    pub blocks: Vec<BlockDescriptor>,
}

/// The immutable geometry table. Built once at open; the allocator
/// layers mutable `allocated`/`erased` bits on top indexed by the same
/// (lun, block, page) triples it holds, rather than mutating this table.
pub struct Geometry {
    pub luns: Vec<Lun>,
    fd: RawFd,
    path: PathBuf,
}

/// Identifies a physical page by its (LUN, block, page) triple. This is the
/// "pointer into the geometry table" the Design Notes call for in place of
/// a raw C pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub lun: u64,
    pub block: u64,
    pub page: u64,
}

impl Geometry {
    /// Build the geometry from a device source. Any enumeration failure is
    /// fatal to open: a half-built table is never returned.
    pub fn open(source: &dyn DeviceGeometrySource) -> Result<Self> {
        let nr_luns = source.nr_luns()?;
        debug!("device reports {} luns", nr_luns);

        let mut luns = Vec::with_capacity(nr_luns as usize);

        for lun_id in 0..nr_luns {
            let nr_pages_per_blk = source.pages_per_block(lun_id)?;
            let nchannels = source.nchannels(lun_id)?;
            debug!(
                "lun {} has {} pages/block, {} channels",
                lun_id, nr_pages_per_blk, nchannels
            );

            let mut channels = Vec::with_capacity(nchannels as usize);
            for chnl_id in 0..nchannels {
                let gran = source.channel_granularity(lun_id, chnl_id)?;
                gran.validate()?;
                channels.push(Channel { gran });
            }

            let nr_blocks = source.nr_blocks(lun_id)?;
            debug!("lun {} has {} blocks", lun_id, nr_blocks);

            let mut blocks = Vec::with_capacity(nr_blocks as usize);
            for block_id in 0..nr_blocks {
                let token = source.block_token(lun_id, block_id)?;

                let mut pages = Vec::with_capacity(nr_pages_per_blk as usize);
                for page_id in 0..nr_pages_per_blk {
                    let sizes = channels.iter().map(|c| c.gran.gran_write).collect();
                    pages.push(PageDescriptor {
                        lun_id,
                        block_id,
                        id: page_id,
                        sizes,
                    });
                }

                blocks.push(BlockDescriptor { token, pages });
            }

            luns.push(Lun {
                nr_pages_per_blk,
                nr_blocks,
                channels,
                blocks,
            });
        }

        Ok(Geometry {
            luns,
            fd: source.fd(),
            path: source.path().to_path_buf(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn device_path(&self) -> &Path {
        &self.path
    }

    pub fn nr_luns(&self) -> u64 {
        self.luns.len() as u64
    }

    pub fn page(&self, id: PageId) -> &PageDescriptor {
        &self.luns[id.lun as usize].blocks[id.block as usize].pages[id.page as usize]
    }

    /// Byte offset of `page` on the device: lun-major, then block, then
    /// page, each scaled by the channel's write granularity.
    pub fn offset_of(&self, id: PageId, channel: usize) -> u64 {
        let lun = &self.luns[id.lun as usize];
        let page_size = lun.channels[channel].gran.gran_write as u64;
        let block_size = lun.nr_pages_per_blk * page_size;
        let lun_size = lun.nr_blocks * block_size;
        id.lun * lun_size + id.block * block_size + id.page * page_size
    }

    pub fn page_size(&self, lun: u64, channel: usize) -> u32 {
        self.luns[lun as usize].channels[channel].gran.gran_write
    }
}
