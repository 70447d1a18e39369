//! Random-access reader (C6): stateless with respect to position.

use std::sync::Arc;

use crate::device_api::NvmApi;
use crate::directory::NvmDirectory;
use crate::error::Result;
use crate::file::{FtlFile, OpenMode};
use crate::page_walk::read_at;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    Normal,
    Sequential,
    WillNeed,
}

pub struct RandomAccessReader {
    file: Arc<FtlFile>,
    dir: Arc<dyn NvmDirectory>,
    api: Arc<NvmApi>,
    channel: usize,
}

impl RandomAccessReader {
    pub fn new(file: Arc<FtlFile>, dir: Arc<dyn NvmDirectory>, api: Arc<NvmApi>) -> Self {
        RandomAccessReader {
            file,
            dir,
            api,
            channel: 0,
        }
    }

    pub fn read(&self, offset: u64, n: usize, out: &mut [u8]) -> Result<usize> {
        let data = read_at(&self.file, &self.api, self.channel, offset, n)?;
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// An opaque varint-encoded file identity, derived from the file's
    /// memory identity, for the host engine to use as a cache key.
    pub fn unique_id(&self) -> Vec<u8> {
        crate::varint::encode_u64(Arc::as_ptr(&self.file) as u64)
    }

    pub fn hint(&self, _pattern: AccessPattern) {}

    pub fn invalidate_cache(&self, _offset: usize, _length: usize) -> Result<()> {
        Ok(())
    }
}

impl Drop for RandomAccessReader {
    fn drop(&mut self) {
        self.dir.nvm_fclose(&self.file, OpenMode::Read);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_test_api;

    #[test]
    fn read_past_eof_is_empty() {
        let api = Arc::new(make_test_api());
        let file = Arc::new(FtlFile::new(Some("a"), -1));
        let dir = crate::testing::NullDirectory::arc();
        let reader = RandomAccessReader::new(file, dir, api);
        let mut out = vec![0u8; 10];
        let n = reader.read(0, 10, &mut out).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn unique_id_is_stable_per_file() {
        let api = Arc::new(make_test_api());
        let file = Arc::new(FtlFile::new(Some("a"), -1));
        let dir = crate::testing::NullDirectory::arc();
        let r1 = RandomAccessReader::new(file.clone(), dir.clone(), api.clone());
        let r2 = RandomAccessReader::new(file, dir, api);
        assert_eq!(r1.unique_id(), r2.unique_id());
    }
}
