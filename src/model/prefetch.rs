// =============================================================================
// model/prefetch.rs — Page-in hints for mapped layer payload
// =============================================================================
//
// mmap loads pages on first touch, so the first token through a layer pays
// for every page fault in it. During warm-up the engine asks the kernel to
// read each layer ahead:
//
//   - unix: madvise(MADV_SEQUENTIAL) + madvise(MADV_WILLNEED)
//   - elsewhere: touch one byte per page
//
// Hints are advisory. A failed hint is reported to the caller, which logs it
// and carries on.
// =============================================================================

use std::io;
use std::ops::Range;

use memmap2::Mmap;

const FALLBACK_PAGE: usize = 4096;

fn check_range(mmap: &Mmap, range: &Range<usize>) -> io::Result<()> {
    if range.start > range.end || range.end > mmap.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("prefetch range {range:?} exceeds mapping of {} bytes", mmap.len()),
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let p = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if p > 0 {
        p as usize
    } else {
        FALLBACK_PAGE
    }
}

#[cfg(unix)]
fn advise(mmap: &Mmap, range: Range<usize>, advice: libc::c_int) -> io::Result<()> {
    check_range(mmap, &range)?;
    if range.is_empty() {
        return Ok(());
    }
    // madvise wants a page-aligned start; the mapping itself is page-aligned.
    let page = page_size();
    let start = range.start - range.start % page;
    let len = range.end - start;
    // SAFETY: [start, start+len) lies inside the live mapping and madvise
    // does not change its contents for these advice values.
    let rc = unsafe {
        let ptr = mmap.as_ptr().add(start) as *mut libc::c_void;
        libc::madvise(ptr, len, advice)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Ask the kernel to read `range` ahead, sequentially.
#[cfg(unix)]
pub fn prefetch_range(mmap: &Mmap, range: Range<usize>) -> io::Result<()> {
    advise(mmap, range.clone(), libc::MADV_SEQUENTIAL)?;
    advise(mmap, range, libc::MADV_WILLNEED)
}

#[cfg(not(unix))]
pub fn prefetch_range(mmap: &Mmap, range: Range<usize>) -> io::Result<()> {
    check_range(mmap, &range)?;
    let mut sink = 0u8;
    for off in range.step_by(FALLBACK_PAGE) {
        sink ^= mmap[off];
    }
    std::hint::black_box(sink);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mapped(len: usize) -> (tempfile::NamedTempFile, Mmap) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![7u8; len]).unwrap();
        f.flush().unwrap();
        let mmap = unsafe { Mmap::map(f.as_file()).unwrap() };
        (f, mmap)
    }

    #[test]
    fn test_prefetch_unaligned_range() {
        let (_f, mmap) = mapped(3 * 4096 + 100);
        prefetch_range(&mmap, 1000..9000).unwrap();
        prefetch_range(&mmap, 0..mmap.len()).unwrap();
        assert_eq!(mmap[5000], 7);
    }

    #[test]
    fn test_prefetch_out_of_range() {
        let (_f, mmap) = mapped(100);
        let err = prefetch_range(&mmap, 50..200).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_empty_range_is_noop() {
        let (_f, mmap) = mapped(100);
        prefetch_range(&mmap, 10..10).unwrap();
    }
}
