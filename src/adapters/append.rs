//! Append writer (C7): buffered append that respects the page write
//! granularity, flushing on page-full, explicit flush, or close.

use std::sync::Arc;

use log::debug;

use crate::device_api::NvmApi;
use crate::directory::NvmDirectory;
use crate::error::{FtlError, Result};
use crate::file::{FtlFile, OpenMode};
use crate::geometry::PageId;

pub struct AppendWriter {
    file: Arc<FtlFile>,
    dir: Arc<dyn NvmDirectory>,
    api: Arc<NvmApi>,
    channel: usize,
    buf: Vec<u8>,
    cursize: usize,
    bytes_per_sync: usize,
    last_page: Option<PageId>,
    last_page_idx: usize,
    closed: bool,
}

impl AppendWriter {
    pub fn new(file: Arc<FtlFile>, dir: Arc<dyn NvmDirectory>, api: Arc<NvmApi>) -> Result<Self> {
        let mut writer = AppendWriter {
            file,
            dir,
            api,
            channel: 0,
            buf: Vec::new(),
            cursize: 0,
            bytes_per_sync: 0,
            last_page: None,
            last_page_idx: 0,
            closed: false,
        };
        if !writer.update_last_page() {
            return Err(FtlError::OutOfSpace);
        }
        Ok(writer)
    }

    /// Arms (or re-arms) `last_page`/`bytes_per_sync`/`cursize`. If the
    /// file's logical size isn't page-aligned on first arm, recovers the
    /// unwritten tail into `buf` and rebinds the last page so the next
    /// physical write targets a fresh page.
    fn update_last_page(&mut self) -> bool {
        if self.last_page.is_some() {
            if self.file.claim_new_page(&self.api.allocator).is_err() {
                return false;
            }
            debug!("last page was set, rotated to a new one");

            let Some((idx, pg)) = self.file.get_last_page() else {
                return false;
            };
            self.last_page_idx = idx;
            self.last_page = Some(pg);
            self.bytes_per_sync = self.api.geometry.page_size(pg.lun, self.channel) as usize;
            self.cursize = 0;
        } else {
            let last = match self.file.get_last_page() {
                Some(x) => x,
                None => {
                    debug!("no pages yet, claiming one");
                    if self.file.claim_new_page(&self.api.allocator).is_err() {
                        return false;
                    }
                    match self.file.get_last_page() {
                        Some(x) => x,
                        None => return false,
                    }
                }
            };
            let (idx, pg) = last;
            self.last_page_idx = idx;
            self.last_page = Some(pg);
            self.bytes_per_sync = self.api.geometry.page_size(pg.lun, self.channel) as usize;
            self.cursize = (self.file.size() % self.bytes_per_sync as u64) as usize;
            self.buf = vec![0u8; self.bytes_per_sync];

            if self.cursize > 0 {
                // Recover the unwritten tail so we don't lose bytes already
                // accounted for in `size`, then swap in a fresh page so the
                // next physical write is to virgin NAND.
                let _ = self
                    .file
                    .read_page(&self.api.geometry, pg, self.channel, &mut self.buf);
                self.file
                    .clear_last_page(&self.api.allocator, self.api.device.as_ref());
                if let Some((idx2, pg2)) = self.file.get_last_page() {
                    self.last_page_idx = idx2;
                    self.last_page = Some(pg2);
                }
            }
        }

        debug!(
            "append writer armed: bytes_per_sync={}, cursize={}",
            self.bytes_per_sync, self.cursize
        );
        true
    }

    fn flush_buffer(&mut self, closing: bool) -> Result<()> {
        if self.cursize == 0 || self.bytes_per_sync == 0 {
            return Ok(());
        }

        let Some(mut page_ref) = self.last_page else {
            panic!(
                "last page is null, cursize={}, bytes_per_sync={}",
                self.cursize, self.bytes_per_sync
            );
        };

        if self.cursize == self.bytes_per_sync || closing {
            let wrote_before = page_ref;

            self.file.write_page(
                &self.api.geometry,
                &self.api.allocator,
                self.api.device.as_ref(),
                &mut page_ref,
                self.channel,
                &self.buf,
                self.bytes_per_sync,
                0,
                self.cursize as u64,
            )?;

            if page_ref != wrote_before {
                self.last_page = Some(page_ref);
                if !self.file.set_page(self.last_page_idx, page_ref) {
                    panic!("unable to update last page after EINTR");
                }
            }

            if self.cursize == self.bytes_per_sync && !self.update_last_page() {
                return Err(FtlError::OutOfSpace);
            }
        }

        Ok(())
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(FtlError::ClosedHandle);
        }

        if self.bytes_per_sync == 0 && !self.update_last_page() {
            return Err(FtlError::OutOfSpace);
        }

        let mut left = data.len();
        let mut offset = 0usize;

        while left > 0 {
            if self.cursize + left <= self.bytes_per_sync {
                self.buf[self.cursize..self.cursize + left].copy_from_slice(&data[offset..offset + left]);
                self.cursize += left;
                left = 0;
            } else {
                let space = self.bytes_per_sync - self.cursize;
                self.buf[self.cursize..self.cursize + space]
                    .copy_from_slice(&data[offset..offset + space]);
                left -= space;
                offset += space;
                self.cursize = self.bytes_per_sync;
            }

            self.flush_buffer(false)?;
        }

        Ok(())
    }

    /// Idempotent close: flushes with `closing=true`, then notifies the
    /// directory.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_buffer(true)?;
        self.dir.nvm_fclose(&self.file, OpenMode::Append);
        Ok(())
    }

    /// The public `Flush` always performs a closing flush; `Sync`/`Fsync`
    /// perform a non-closing one. This asymmetry is preserved from the
    /// original on purpose (see `DESIGN.md`).
    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(FtlError::ClosedHandle);
        }
        self.flush_buffer(true)
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.closed {
            return Err(FtlError::ClosedHandle);
        }
        self.flush_buffer(false)
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.sync()
    }

    pub fn file_size(&self) -> u64 {
        self.file.size() + self.cursize as u64
    }

    pub fn allocate(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    pub fn range_sync(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    pub fn unique_id(&self) -> Vec<u8> {
        crate::varint::encode_u64(Arc::as_ptr(&self.file) as u64)
    }
}

impl Drop for AppendWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
