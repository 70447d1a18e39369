//! FTL persistence (C9): serialize a file's names, size, modification
//! time and page list as a single textual record so state survives a
//! restart, and reconstruct a file from that record on load.
//!
//! Record format, one per line:
//!
//! ```text
//! f:<name1>,<name2>,...:<size>:<last_modified>:<L1-B1-P1>,<L2-B2-P2>,...\n
//! ```

use std::io::{self, BufRead, Write};

use crate::allocator::Allocator;
use crate::error::{FtlError, Result};
use crate::file::FtlFile;
use crate::geometry::PageId;

fn write_step<W: Write>(w: &mut W, buf: &[u8], step: u32) -> Result<()> {
    w.write_all(buf)
        .map_err(|_| FtlError::DeviceIo(io::Error::new(io::ErrorKind::Other, format!("fError writing {step}"))))
}

/// Append one file's FTL record to `w`.
pub fn save_file<W: Write>(file: &FtlFile, w: &mut W) -> Result<()> {
    write_step(w, b"f:", 2)?;

    let names = file.enumerate_names();
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            write_step(w, b",", 3)?;
        }
        write_step(w, name.as_bytes(), 4)?;
    }

    write_step(w, b":", 5)?;
    write_step(w, file.size().to_string().as_bytes(), 6)?;
    write_step(w, b":", 7)?;
    write_step(w, file.last_modified().to_string().as_bytes(), 8)?;
    write_step(w, b":", 9)?;

    for i in 0..file.page_count() {
        if i > 0 {
            write_step(w, b",", 10)?;
        }
        let p = file
            .get_nvm_page(i)
            .expect("page_count() is consistent with get_nvm_page()");
        write_step(w, format!("{}-{}-{}", p.lun, p.block, p.page).as_bytes(), 11)?;
    }

    write_step(w, b"\n", 12)
}

/// Save every file in `files` as consecutive records.
pub fn save_all<'a, W: Write>(files: impl IntoIterator<Item = &'a FtlFile>, w: &mut W) -> Result<()> {
    for file in files {
        save_file(file, w)?;
    }
    Ok(())
}

fn corrupt(msg: impl Into<String>) -> FtlError {
    FtlError::Corrupt(msg.into())
}

/// Parse one FTL record from `r` (up to and including its trailing `\n`)
/// and populate `file` from it: names, size, last-modified time, and the
/// page list — each page is claimed at its exact (lun, block, page)
/// triple via [`FtlFile::claim_new_page_at`], so an already-allocated or
/// otherwise unavailable page fails the whole load. Returns `Ok(false)`
/// at a clean end of input (no more records).
pub fn load_file<R: BufRead>(file: &FtlFile, allocator: &Allocator, r: &mut R) -> Result<bool> {
    let mut line = String::new();
    let n = r.read_line(&mut line).map_err(FtlError::DeviceIo)?;
    if n == 0 {
        return Ok(false);
    }

    let line = line.strip_suffix('\n').unwrap_or(&line);
    let rest = line
        .strip_prefix("f:")
        .ok_or_else(|| corrupt("ftl record missing 'f:' prefix"))?;

    let mut fields = rest.splitn(4, ':');
    let names_field = fields.next().ok_or_else(|| corrupt("ftl record missing names field"))?;
    let size_field = fields.next().ok_or_else(|| corrupt("ftl record missing size field"))?;
    let mtime_field = fields
        .next()
        .ok_or_else(|| corrupt("ftl record missing last_modified field"))?;
    let pages_field = fields.next().unwrap_or("");

    if !names_field.is_empty() {
        for name in names_field.split(',') {
            file.add_name(name)?;
        }
    }

    let size: u64 = size_field
        .parse()
        .map_err(|_| corrupt(format!("bad size {size_field:?}")))?;
    let last_modified: i64 = mtime_field
        .parse()
        .map_err(|_| corrupt(format!("bad last_modified {mtime_field:?}")))?;

    if !pages_field.is_empty() {
        for triple in pages_field.split(',') {
            let mut parts = triple.splitn(3, '-');
            let bad = || corrupt(format!("bad page triple {triple:?}"));
            let lun: u64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let block: u64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let page: u64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            file.claim_new_page_at(allocator, PageId { lun, block, page })?;
        }
    }

    file.restore_state(size, last_modified);
    Ok(true)
}

/// Load every record from `r`, constructing one fresh [`FtlFile`] per
/// record via `make_file`. Stops at clean end of input.
pub fn load_all<R: BufRead>(
    r: &mut R,
    allocator: &Allocator,
    mut make_file: impl FnMut() -> FtlFile,
) -> Result<Vec<FtlFile>> {
    let mut out = Vec::new();
    loop {
        let file = make_file();
        if load_file(&file, allocator, r)? {
            out.push(file);
        } else {
            break;
        }
    }
    Ok(out)
}
