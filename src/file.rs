//! FTL page list per file (C3) and the I/O primitives that read/write a
//! physical page through it (C4). The original keeps `ReadPage`/`WritePage`
//! as methods on `nvm_file` since they need the file's own fd and its page
//! list to detect "last page" and grow `size`; this crate keeps that
//! pairing for the same reason.

use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::allocator::{log_retry, warn_out_of_space, AllocPolicy, Allocator, RetryReason};
use crate::error::{FtlError, Result};
use crate::geometry::{DeviceGeometrySource, Geometry, PageId};

/// `r`/`l` (read, lock) never fail to open and never touch `opened_for_write`.
/// Any other mode is an exclusive writer (append or random read-write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Lock,
    Append,
    RandomWrite,
}

impl OpenMode {
    fn is_exempt(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::Lock)
    }
}

struct FileMeta {
    /// Most-recently-added name at the head, matching the original's
    /// head-insertion linked list (`EnumerateNames` order is preserved).
    names: Vec<String>,
    last_modified: i64,
    opened_for_write: bool,
}

struct PageList {
    pages: Vec<PageId>,
    /// Pages pre-reserved from whole blocks, not yet handed to `pages`.
    /// Only populated under [`AllocPolicy::PerBlock`].
    block_pages: Vec<PageId>,
    size: u64,
}

/// A file's FTL state: its names, its ordered physical page list, and its
/// logical size. Owned by at most one directory; may be named by multiple
/// directory entries (hard links).
///
/// Lock order is always `meta` before `pages`, never the reverse. Both
/// locks are plain (non-recursive) `Mutex`es: the one place the original
/// re-enters `meta_mtx` (`Delete` calling `DeleteAllLinks`) is
/// restructured here so the lock is released first.
pub struct FtlFile {
    meta: Mutex<FileMeta>,
    pages: Mutex<PageList>,
    /// Coarse lock for directory-level `Lock`/`Unlock` semantics. No
    /// internal operation here takes it.
    pub file_lock: Mutex<()>,
    fd: RawFd,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl FtlFile {
    pub fn new(name: Option<&str>, fd: RawFd) -> Self {
        let names = match name {
            Some(n) if !n.is_empty() => vec![n.to_string()],
            _ => Vec::new(),
        };

        FtlFile {
            meta: Mutex::new(FileMeta {
                names,
                last_modified: now_secs(),
                opened_for_write: false,
            }),
            pages: Mutex::new(PageList {
                pages: Vec::new(),
                block_pages: Vec::new(),
                size: 0,
            }),
            file_lock: Mutex::new(()),
            fd,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    // ---- name operations -------------------------------------------------

    pub fn add_name(&self, name: &str) -> Result<()> {
        if name.contains(':') || name.contains(',') {
            return Err(FtlError::Corrupt(format!(
                "name {name:?} contains a reserved separator"
            )));
        }
        let mut meta = self.meta.lock().unwrap();
        meta.names.insert(0, name.to_string());
        Ok(())
    }

    pub fn has_name(&self, name: &str) -> bool {
        let meta = self.meta.lock().unwrap();
        meta.names.iter().any(|n| n == name)
    }

    pub fn change_name(&self, crt_name: &str, new_name: &str) {
        let mut meta = self.meta.lock().unwrap();
        if let Some(slot) = meta.names.iter_mut().find(|n| n.as_str() == crt_name) {
            *slot = new_name.to_string();
        }
    }

    pub fn enumerate_names(&self) -> Vec<String> {
        let meta = self.meta.lock().unwrap();
        meta.names.clone()
    }

    /// Remove one name. If it was the last, reclaim every page, zero the
    /// size, and report the file can be destroyed.
    pub fn delete(
        &self,
        name: &str,
        allocator: &Allocator,
        device: &dyn DeviceGeometrySource,
    ) -> bool {
        let last_name_removed = {
            let mut meta = self.meta.lock().unwrap();
            if let Some(pos) = meta.names.iter().position(|n| n == name) {
                meta.names.remove(pos);
            }
            meta.names.is_empty()
        };

        if !last_name_removed {
            return false;
        }

        self.delete_all_links(allocator, device);
        true
    }

    /// Reclaim every page this file owns and zero its size. Called once a
    /// file has no names left referencing it.
    ///
    /// Pages are popped one at a time, *then* reclaimed, rather than
    /// snapshotting the whole list up front: [`FtlFile::reclaim_page`]'s
    /// block-mode path decides whether to erase a block by checking
    /// whether any *other* entry in this file's current page list still
    /// references it, so the list must actually shrink as we go, or the
    /// last page of a block never looks like the last page.
    pub fn delete_all_links(&self, allocator: &Allocator, device: &dyn DeviceGeometrySource) {
        debug!("reclaiming all links for file");

        loop {
            let next = {
                let mut pl = self.pages.lock().unwrap();
                pl.pages.pop().or_else(|| pl.block_pages.pop())
            };
            let Some(pg) = next else { break };
            self.reclaim_page(allocator, device, pg);
        }

        self.pages.lock().unwrap().size = 0;
        self.touch();
    }

    // ---- open/close discipline --------------------------------------------

    pub fn can_open(&self, mode: OpenMode) -> bool {
        if mode.is_exempt() {
            return true;
        }
        let mut meta = self.meta.lock().unwrap();
        if meta.opened_for_write {
            false
        } else {
            meta.opened_for_write = true;
            true
        }
    }

    pub fn close(&self, mode: OpenMode) {
        if mode.is_exempt() {
            return;
        }
        let mut meta = self.meta.lock().unwrap();
        meta.opened_for_write = false;
    }

    // ---- metadata -----------------------------------------------------

    pub fn size(&self) -> u64 {
        self.pages.lock().unwrap().size
    }

    pub fn last_modified(&self) -> i64 {
        self.meta.lock().unwrap().last_modified
    }

    pub fn touch(&self) {
        self.meta.lock().unwrap().last_modified = now_secs();
    }

    /// Overwrite `size` and `last_modified` directly. Used only by FTL
    /// persistence load (C9), where both values come from the on-disk
    /// record rather than from an actual page write.
    pub fn restore_state(&self, size: u64, last_modified: i64) {
        self.pages.lock().unwrap().size = size;
        self.meta.lock().unwrap().last_modified = last_modified;
    }

    // ---- page list ------------------------------------------------------

    pub fn get_nvm_page(&self, idx: usize) -> Option<PageId> {
        self.pages.lock().unwrap().pages.get(idx).copied()
    }

    pub fn get_last_page(&self) -> Option<(usize, PageId)> {
        let pl = self.pages.lock().unwrap();
        pl.pages.last().copied().map(|p| (pl.pages.len() - 1, p))
    }

    pub fn set_page(&self, idx: usize, page: PageId) -> bool {
        let mut pl = self.pages.lock().unwrap();
        if idx < pl.pages.len() {
            pl.pages[idx] = page;
            true
        } else {
            false
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().unwrap().pages.len()
    }

    /// Request a page from the allocator, honoring the file's allocation
    /// policy (single page, or drawn from a pre-reserved block pool).
    fn request_page(&self, allocator: &Allocator) -> Option<PageId> {
        match allocator.policy() {
            AllocPolicy::PerPage => allocator.request_page(),
            AllocPolicy::PerBlock => {
                let mut pl = self.pages.lock().unwrap();
                if pl.block_pages.is_empty() {
                    log_retry(RetryReason::BlockRefill, "block pool empty, reserving a new block");
                    if !allocator.request_block(&mut pl.block_pages) {
                        return None;
                    }
                }
                pl.block_pages.pop()
            }
        }
    }

    /// Replay variant: claim a specific (lun, block, page) triple. Under
    /// block-mode, first scans the pre-reserved pool, then reserves a whole
    /// (named) block and retries once.
    fn request_page_at(&self, allocator: &Allocator, id: PageId) -> Option<PageId> {
        match allocator.policy() {
            AllocPolicy::PerPage => allocator.request_page_at(id),
            AllocPolicy::PerBlock => {
                let mut pl = self.pages.lock().unwrap();
                if let Some(pos) = pl.block_pages.iter().position(|p| *p == id) {
                    return Some(pl.block_pages.remove(pos));
                }
                if !allocator.request_block_at(&mut pl.block_pages, id.lun, id.block) {
                    return None;
                }
                pl.block_pages
                    .iter()
                    .position(|p| *p == id)
                    .map(|pos| pl.block_pages.remove(pos))
            }
        }
    }

    /// Request a fresh page without appending it to the page list — the
    /// caller (the random read-write adapter) substitutes it into the list
    /// itself via [`FtlFile::set_page`] once the write succeeds, to honor
    /// NAND's copy-on-write-at-page-granularity semantics.
    pub fn request_fresh_page(&self, allocator: &Allocator) -> Option<PageId> {
        self.request_page(allocator)
    }

    pub fn claim_new_page(&self, allocator: &Allocator) -> Result<()> {
        let page = self.request_page(allocator).ok_or_else(|| {
            warn_out_of_space("claim_new_page");
            FtlError::OutOfSpace
        })?;
        self.pages.lock().unwrap().pages.push(page);
        Ok(())
    }

    pub fn claim_new_page_at(&self, allocator: &Allocator, id: PageId) -> Result<()> {
        let page = self
            .request_page_at(allocator, id)
            .ok_or_else(|| FtlError::Corrupt(format!("page {id:?} already allocated")))?;
        self.pages.lock().unwrap().pages.push(page);
        Ok(())
    }

    /// Reclaim the last page and replace it with a fresh one (used by the
    /// append writer when it must rewrite the tail).
    pub fn clear_last_page(&self, allocator: &Allocator, device: &dyn DeviceGeometrySource) -> bool {
        let last = {
            let pl = self.pages.lock().unwrap();
            pl.pages.last().copied()
        };
        let Some(pg) = last else { return true };

        self.reclaim_page(allocator, device, pg);

        let Some(fresh) = self.request_page(allocator) else {
            return false;
        };

        let mut pl = self.pages.lock().unwrap();
        let last_idx = pl.pages.len() - 1;
        pl.pages[last_idx] = fresh;
        true
    }

    /// Reclaim a page. Under block-mode allocation, only erases the whole
    /// block once no *other* entry in this file's page list still
    /// references it.
    pub fn reclaim_page(&self, allocator: &Allocator, device: &dyn DeviceGeometrySource, page: PageId) {
        match allocator.policy() {
            AllocPolicy::PerPage => allocator.reclaim_page(page),
            AllocPolicy::PerBlock => {
                let other_live = {
                    let pl = self.pages.lock().unwrap();
                    pl.pages
                        .iter()
                        .chain(pl.block_pages.iter())
                        .any(|p| *p != page && p.lun == page.lun && p.block == page.block)
                };
                if !other_live {
                    debug!("block {}-{} has no more pages allocated", page.lun, page.block);
                    allocator.reclaim_block(device, page.lun, page.block);
                }
            }
        }
    }

    // ---- I/O primitives (C4) --------------------------------------------

    /// Positional read of one page's worth of bytes. Retries from the
    /// start of the page on EINTR; any other error (including a short
    /// read) is surfaced.
    pub fn read_page(
        &self,
        geometry: &Geometry,
        page: PageId,
        channel: usize,
        out: &mut [u8],
    ) -> std::io::Result<usize> {
        let page_size = geometry.page_size(page.lun, channel) as usize;
        let offset = geometry.offset_of(page, channel);

        loop {
            match pread_exact(self.fd, &mut out[..page_size], offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Positional write of exactly `data_len` bytes. On EINTR the current
    /// page is treated as stale: it is reclaimed, a fresh page is
    /// requested, `page_ref` is rebound, and the write retried at the
    /// fresh page's own offset.
    ///
    /// If `page_ref` names the file's last page, `size` grows by
    /// `max(0, new_data_offset + new_data_len - (size % page_size))`.
    pub fn write_page(
        &self,
        geometry: &Geometry,
        allocator: &Allocator,
        device: &dyn DeviceGeometrySource,
        page_ref: &mut PageId,
        channel: usize,
        data: &[u8],
        data_len: usize,
        new_data_offset: u64,
        new_data_len: u64,
    ) -> Result<usize> {
        let page_size = geometry.page_size(page_ref.lun, channel) as usize;
        if data_len > page_size {
            panic!("write of {data_len} bytes exceeds page size {page_size}");
        }

        // Captured before the EINTR retry loop can rebind `page_ref` to a
        // fresh page: the "did this write land on the file's last page"
        // test below must still fire against the page the caller entered
        // with, since `pages.last()` isn't patched to the replacement until
        // the caller calls `set_page` after we return.
        let entry_page = *page_ref;

        loop {
            let offset = geometry.offset_of(*page_ref, channel);
            match pwrite_exact(device, self.fd, &data[..data_len], offset) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    log_retry(RetryReason::StalePage, "pwrite interrupted, abandoning page");
                    self.reclaim_page(allocator, device, *page_ref);
                    *page_ref = self.request_page(allocator).ok_or_else(|| {
                        warn_out_of_space("write_page stale-page replacement");
                        FtlError::OutOfSpace
                    })?;
                    continue;
                }
                Err(e) => return Err(FtlError::DeviceIo(e)),
            }
        }

        let mut pl = self.pages.lock().unwrap();
        if pl.pages.last() == Some(&entry_page) {
            let page_size_u64 = page_size as u64;
            let crt_size_offset = pl.size % page_size_u64;
            if new_data_len + new_data_offset > crt_size_offset {
                pl.size += new_data_len + new_data_offset - crt_size_offset;
                debug!("file now has size {}", pl.size);
            }
        }
        drop(pl);

        self.touch();
        Ok(data_len)
    }
}

fn pread_exact(fd: RawFd, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let n = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if n as usize != buf.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read",
        ));
    }
    Ok(n as usize)
}

fn pwrite_exact(
    device: &dyn DeviceGeometrySource,
    fd: RawFd,
    buf: &[u8],
    offset: u64,
) -> std::io::Result<()> {
    let n = device.pwrite(fd, buf, offset)?;
    if n != buf.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short write",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_api::NvmApi;
    use crate::testing::{make_test_api_with_policy, EintrOnceDevice, SimulatedDevice};

    /// Property 7 (EINTR transparency): a `pwrite` that reports `EINTR`
    /// once must not lose or miscount the committed bytes. Under block
    /// allocation the stale-page replacement always lands on a different
    /// physical page (drawn from the pre-reserved block pool, never the
    /// page just reclaimed), which is exactly the case that exposed the
    /// `entry_page` bug: the size-growth check must still key off the page
    /// the call *entered* with, not the replacement `write_page` hands
    /// back.
    #[test]
    fn write_page_eintr_retry_commits_to_fresh_page_and_grows_size() {
        let device = EintrOnceDevice::new(SimulatedDevice::default_geometry());
        let api = NvmApi::open(Box::new(device), AllocPolicy::PerBlock).unwrap();
        let file = FtlFile::new(Some("a"), api.geometry.fd());

        file.claim_new_page(&api.allocator).unwrap();
        let original = file.get_nvm_page(0).unwrap();
        let mut page_ref = original;

        let n = file
            .write_page(
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
        assert_eq!(n, 8);

        // The interrupted write's page was abandoned for a fresh one...
        assert_ne!(page_ref, original);
        // ...but size still grew, because the "is this the file's last
        // page" check fired against the page this call entered with.
        assert_eq!(file.size(), 5);

        // The caller (not `write_page` itself) is responsible for patching
        // the file's page list with the replacement, same as every other
        // `write_page` call site does.
        file.set_page(0, page_ref);
        let mut out = [0u8; 8];
        file.read_page(&api.geometry, page_ref, 0, &mut out).unwrap();
        assert_eq!(&out[..5], b"HELLO");
    }

    #[test]
    fn block_mode_draws_from_a_pre_reserved_pool() {
        let api = make_test_api_with_policy(AllocPolicy::PerBlock);
        let file = FtlFile::new(Some("a"), -1);

        // The geometry's default test layout is 8 pages/block; claiming
        // one page should reserve the whole block behind the scenes.
        file.claim_new_page(&api.allocator).unwrap();
        let first = file.get_nvm_page(0).unwrap();
        assert!(api.allocator.is_allocated(first));

        for _ in 0..7 {
            file.claim_new_page(&api.allocator).unwrap();
        }
        assert_eq!(file.page_count(), 8);

        // All 8 pages come from the same block, drawn from the
        // pre-reserved pool rather than triggering a second block grab.
        let block = first.block;
        for i in 0..8 {
            assert_eq!(file.get_nvm_page(i).unwrap().block, block);
        }
    }

    #[test]
    fn block_mode_erases_block_once_every_owning_file_releases_it() {
        let api = make_test_api_with_policy(AllocPolicy::PerBlock);
        let file = FtlFile::new(Some("a"), -1);

        for _ in 0..8 {
            file.claim_new_page(&api.allocator).unwrap();
        }
        let pages: Vec<PageId> = (0..8).map(|i| file.get_nvm_page(i).unwrap()).collect();
        let block = pages[0].block;

        file.delete_all_links(&api.allocator, api.device.as_ref());

        assert!(pages.iter().all(|p| !api.allocator.is_allocated(*p)));
        assert!(api.allocator.is_erased(pages[0].lun, block));
    }

    #[test]
    fn can_open_enforces_single_writer() {
        let file = FtlFile::new(Some("a"), -1);
        assert!(file.can_open(OpenMode::Append));
        assert!(!file.can_open(OpenMode::RandomWrite));
        file.close(OpenMode::Append);
        assert!(file.can_open(OpenMode::RandomWrite));
    }

    #[test]
    fn read_and_lock_modes_never_block() {
        let file = FtlFile::new(Some("a"), -1);
        assert!(file.can_open(OpenMode::Append));
        // Readers/lockers are exempt even while a writer holds the file.
        assert!(file.can_open(OpenMode::Read));
        assert!(file.can_open(OpenMode::Lock));
    }

    #[test]
    fn delete_keeps_pages_while_another_name_remains() {
        let api = make_test_api_with_policy(AllocPolicy::PerPage);
        let file = FtlFile::new(None, -1);
        file.add_name("a").unwrap();
        file.add_name("b").unwrap();
        file.claim_new_page(&api.allocator).unwrap();
        let page = file.get_nvm_page(0).unwrap();

        assert!(!file.delete("a", &api.allocator, api.device.as_ref()));
        assert!(api.allocator.is_allocated(page));
        assert_eq!(file.enumerate_names(), vec!["b"]);

        assert!(file.delete("b", &api.allocator, api.device.as_ref()));
        assert!(!api.allocator.is_allocated(page));
        assert_eq!(file.size(), 0);
    }
}
