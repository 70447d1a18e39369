//! Random read-write file (C8): read-modify-write at arbitrary offsets
//! with NAND page-copy semantics. Every write touching an existing page
//! claims a brand-new physical page, splices the update into a scratch
//! copy of the old contents, writes the new page, then reclaims the old
//! one — copy-on-write at page granularity.

use std::sync::Arc;

use crate::device_api::NvmApi;
use crate::directory::NvmDirectory;
use crate::error::{FtlError, Result};
use crate::file::{FtlFile, OpenMode};
use crate::geometry::PageId;
use crate::page_walk::read_at;

pub struct RandomRwFile {
    file: Arc<FtlFile>,
    dir: Arc<dyn NvmDirectory>,
    api: Arc<NvmApi>,
    channel: usize,
}

impl RandomRwFile {
    pub fn new(file: Arc<FtlFile>, dir: Arc<dyn NvmDirectory>, api: Arc<NvmApi>) -> Self {
        RandomRwFile {
            file,
            dir,
            api,
            channel: 0,
        }
    }

    fn page_size_of(&self, page: PageId) -> usize {
        self.api.geometry.page_size(page.lun, self.channel) as usize
    }

    fn seek_page(&self, offset: u64) -> Option<(PageId, u64, usize)> {
        let p0 = self.file.get_nvm_page(0)?;
        let page_size = self.page_size_of(p0) as u64;
        let page_idx = (offset / page_size) as usize;
        let page_pointer = offset % page_size;
        let page = self.file.get_nvm_page(page_idx)?;
        Some((page, page_pointer, page_idx))
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset > self.file.size() {
            return Err(FtlError::OutOfBounds);
        }

        let mut left = data.len();
        let mut src_off = 0usize;

        let mut page_idx: usize;
        let mut page_pointer: u64;
        let mut page: PageId;
        let mut crt_data: Vec<u8>;
        let mut have_cursor = false;

        // These get initialized on the first loop iteration.
        page_idx = 0;
        page_pointer = 0;
        page = PageId { lun: 0, block: 0, page: 0 };
        crt_data = Vec::new();

        while left > 0 {
            let mut page_just_claimed = false;

            if !have_cursor {
                match self.seek_page(offset) {
                    Some((p, pp, pi)) => {
                        page = p;
                        page_pointer = pp;
                        page_idx = pi;
                    }
                    None => {
                        self.file.claim_new_page(&self.api.allocator)?;
                        let (p, pp, pi) = self
                            .seek_page(offset)
                            .expect("page was just claimed for this offset");
                        page = p;
                        page_pointer = pp;
                        page_idx = pi;
                        page_just_claimed = true;
                    }
                }
                crt_data = vec![0u8; self.page_size_of(page)];
                have_cursor = true;
            } else {
                page_idx += 1;
                match self.file.get_nvm_page(page_idx) {
                    Some(p) => page = p,
                    None => {
                        self.file.claim_new_page(&self.api.allocator)?;
                        page = self
                            .file
                            .get_nvm_page(page_idx)
                            .ok_or(FtlError::OutOfSpace)?;
                        page_just_claimed = true;
                    }
                }
                page_pointer = 0;
            }

            let page_size = self.page_size_of(page);
            if crt_data.len() != page_size {
                crt_data = vec![0u8; page_size];
            }

            if !page_just_claimed {
                self.file
                    .read_page(&self.api.geometry, page, self.channel, &mut crt_data)?;
            }

            let i = ((page_size as u64 - page_pointer).min(left as u64)) as usize;
            crt_data[page_pointer as usize..page_pointer as usize + i]
                .copy_from_slice(&data[src_off..src_off + i]);
            left -= i;
            src_off += i;

            let new_pg = if page_just_claimed {
                page
            } else {
                let np = self
                    .file
                    .request_fresh_page(&self.api.allocator)
                    .ok_or(FtlError::OutOfSpace)?;
                self.file.set_page(page_idx, np);
                np
            };

            let mut wrote_pg = new_pg;
            self.file.write_page(
                &self.api.geometry,
                &self.api.allocator,
                self.api.device.as_ref(),
                &mut wrote_pg,
                self.channel,
                &crt_data,
                page_size,
                page_pointer,
                i as u64,
            )?;

            if wrote_pg != new_pg {
                self.file.set_page(page_idx, wrote_pg);
            }

            if !page_just_claimed {
                self.file
                    .reclaim_page(&self.api.allocator, self.api.device.as_ref(), page);
            }

            page = wrote_pg;
        }

        Ok(())
    }

    pub fn read(&self, offset: u64, n: usize, out: &mut [u8]) -> Result<usize> {
        let data = read_at(&self.file, &self.api, self.channel, offset, n)?;
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    pub fn close(&self) -> Result<()> {
        self.dir.nvm_fclose(&self.file, OpenMode::RandomWrite);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        Ok(())
    }

    pub fn allocate(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

impl Drop for RandomRwFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AppendWriter;
    use crate::testing::make_test_api;

    #[test]
    fn offset_write_overwrites_in_place() {
        let api = Arc::new(make_test_api());
        let file = Arc::new(FtlFile::new(Some("a"), api.geometry.fd()));
        let dir = crate::testing::NullDirectory::arc();

        {
            let mut w = AppendWriter::new(file.clone(), dir.clone(), api.clone()).unwrap();
            w.append(b"0123456789ABCDEF").unwrap();
            w.close().unwrap();
        }

        let before: Vec<PageId> = (0..file.page_count())
            .map(|i| file.get_nvm_page(i).unwrap())
            .collect();

        let rw = RandomRwFile::new(file.clone(), dir, api);
        rw.write(4, b"xxxx").unwrap();

        let mut out = vec![0u8; 16];
        let n = rw.read(0, 16, &mut out).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&out, b"0123xxxx89ABCDEF");

        let after: Vec<PageId> = (0..file.page_count())
            .map(|i| file.get_nvm_page(i).unwrap())
            .collect();
        assert_ne!(before, after, "pages touched by the write must be copy-on-written");
    }
}
