//! Sequential reader (C5): a streaming read cursor across a file's page
//! list.

use std::sync::Arc;

use crate::device_api::NvmApi;
use crate::directory::NvmDirectory;
use crate::error::{FtlError, Result};
use crate::file::{FtlFile, OpenMode};
use crate::page_walk::read_at;

pub struct SequentialReader {
    file: Arc<FtlFile>,
    dir: Arc<dyn NvmDirectory>,
    api: Arc<NvmApi>,
    channel: usize,
    file_pointer: u64,
}

impl SequentialReader {
    pub fn new(file: Arc<FtlFile>, dir: Arc<dyn NvmDirectory>, api: Arc<NvmApi>) -> Self {
        SequentialReader {
            file,
            dir,
            api,
            channel: 0,
            file_pointer: 0,
        }
    }

    /// Reads up to `n` bytes into `out` (which must have capacity `>= n`),
    /// advancing the internal file pointer. Returns the number of bytes
    /// actually read (clamped to the remaining file size).
    pub fn read(&mut self, n: usize, out: &mut [u8]) -> Result<usize> {
        let data = read_at(&self.file, &self.api, self.channel, self.file_pointer, n)?;
        out[..data.len()].copy_from_slice(&data);
        self.file_pointer += data.len() as u64;
        Ok(data.len())
    }

    /// Forward-only seek. Fails if it would move past the end of the file.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        if self.file_pointer + n > self.file.size() {
            return Err(FtlError::OutOfBounds);
        }
        self.file_pointer += n;
        Ok(())
    }

    pub fn invalidate_cache(&self, _offset: usize, _length: usize) -> Result<()> {
        Ok(())
    }
}

impl Drop for SequentialReader {
    fn drop(&mut self) {
        self.dir.nvm_fclose(&self.file, OpenMode::Read);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_test_api;

    #[test]
    fn read_clamps_to_size() {
        let api = Arc::new(make_test_api());
        let file = Arc::new(FtlFile::new(Some("a"), api.geometry.fd()));
        file.claim_new_page(&api.allocator).unwrap();
        let page = file.get_nvm_page(0).unwrap();
        let mut page_ref = page;
        file.write_page(
            &api.geometry,
            &api.allocator,
            api.device.as_ref(),
            &mut page_ref,
            0,
            b"HELLO   ",
            8,
            0,
            5,
        )
        .unwrap();

        let dir = crate::testing::NullDirectory::arc();
        let mut reader = SequentialReader::new(file.clone(), dir, api);
        let mut out = vec![0u8; 100];
        let n = reader.read(100, &mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out[..5], b"HELLO");
    }
}
