//! Shared page-at-a-time gather read used by the sequential reader (C5),
//! the random-access reader (C6) and the random read-write file's read
//! path (C8) — all three walk the page list identically once an (offset,
//! n) pair has been clamped to the file's current size.

use crate::device_api::NvmApi;
use crate::error::Result;
use crate::file::FtlFile;

/// Reads up to `n` bytes starting at `offset` into `out`, clamped to the
/// file's size. Returns the number of bytes actually copied.
pub(crate) fn read_at(
    file: &FtlFile,
    api: &NvmApi,
    channel: usize,
    offset: u64,
    n: usize,
) -> Result<Vec<u8>> {
    let size = file.size();
    if offset >= size {
        return Ok(Vec::new());
    }

    let remaining = (n as u64).min(size - offset);
    if remaining == 0 {
        return Ok(Vec::new());
    }

    let Some(p0) = file.get_nvm_page(0) else {
        return Ok(Vec::new());
    };
    let page_size = api.geometry.page_size(p0.lun, channel) as u64;

    let mut page_idx = (offset / page_size) as usize;
    let mut page_pointer = offset % page_size;

    let mut out = Vec::with_capacity(remaining as usize);
    let mut left = remaining;
    let mut scratch = vec![0u8; page_size as usize];

    while left > 0 {
        let Some(pid) = file.get_nvm_page(page_idx) else {
            break;
        };
        let l = file.read_page(&api.geometry, pid, channel, &mut scratch)? as u64;
        let avail = l - page_pointer;
        let to_copy = avail.min(left) as usize;
        out.extend_from_slice(&scratch[page_pointer as usize..page_pointer as usize + to_copy]);
        left -= to_copy as u64;
        page_idx += 1;
        page_pointer = 0;
    }

    Ok(out)
}
