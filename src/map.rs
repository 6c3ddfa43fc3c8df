//! Thin wrappers around the mmap family: reserve address space without
//! backing pages, commit subranges on demand, and unmap whole regions.
use std::ffi::c_void;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

/// Large pages are 2 MiB on the platforms we target.
pub const LARGE_PAGE_SIZE: usize = 2 << 20;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    let size = ret as usize;
    assert!(
        size.is_power_of_two(),
        "Page size must be a power of two: {}",
        size
    );
    size
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Returns the large (huge) page size.
#[inline]
pub fn large_page_size() -> usize {
    LARGE_PAGE_SIZE
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn reserve_impl(size: usize, extra_flags: libc::c_int) -> Result<NonNull<c_void>, i32> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        Err(errno())
    } else {
        NonNull::new(base).ok_or(0)
    }
}

/// Attempts to reserve an *address space* region of `size` bytes.  The
/// pages in the returned range have no backing and no access until
/// they are committed.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    reserve_impl(size, libc::MAP_NORESERVE)
}

/// Attempts to reserve a `size`-byte region backed by huge pages.
///
/// Huge pages are reserved from the kernel pool eagerly: an empty
/// pool fails here with `ENOMEM` instead of faulting on first touch.
///
/// The `size` argument must be a multiple of the large page size.
pub fn reserve_region_large(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % large_page_size()) == 0,
        "Bad region size={} large_page_size={}",
        size,
        large_page_size()
    );

    reserve_impl(size, libc::MAP_HUGETLB)
}

/// Commits a region of `size` bytes starting at `base`: the range
/// becomes readable and writable, with pages demand-faulted in (and
/// thus zero-filled on first touch).  Committing already-committed
/// pages is a no-op.
///
/// Both arguments must be multiples of the page size.
pub fn commit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );
    assert!(
        (base.as_ptr() as usize % page_size()) == 0,
        "Bad region base={:?} page_size={}",
        base,
        page_size()
    );

    let ret = unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_READ | libc::PROT_WRITE) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Commits `[base, base + size)` by mapping `file` over it with
/// `MAP_FIXED`.  The file is grown to `size` bytes first, so the
/// fresh pages read as zero, same as anonymous commits.
pub fn commit_file_region(file: File, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    file.set_len(size as u64)
        .map_err(|e| e.raw_os_error().unwrap_or(0))?;

    let mapped = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };

    if mapped == libc::MAP_FAILED {
        return Err(errno());
    }

    // MAP_FIXED must replace the exact range we asked for.
    assert_eq!(mapped, base.as_ptr());
    Ok(())
}

/// Releases a region of `size` bytes starting at `base`.
///
/// The size argument must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert!(page_size().is_power_of_two());

    // Large pages must be a multiple of the base granularity.
    assert_eq!(large_page_size() % page_size(), 0);
}

// Reserve a range, commit a growing prefix, scribble on it, and
// release the whole thing: the reserve/commit/release cycle an arena
// block goes through.
#[test]
fn smoke_test() {
    let region_size = 1usize << 20;
    let base = reserve_region(region_size).expect("reserve should succeed");

    // Commit the first page, then extend the committed prefix.
    commit_region(base, page_size()).expect("should commit the first page");
    commit_region(base, 4 * page_size()).expect("re-committing a superset should succeed");

    let bytes = base.as_ptr() as *mut u8;
    unsafe {
        // Fresh pages read as zero.
        assert_eq!(std::ptr::read(bytes), 0);
        assert_eq!(std::ptr::read(bytes.add(4 * page_size() - 1)), 0);

        std::ptr::write_bytes(bytes, 42, 4 * page_size());
        assert_eq!(std::ptr::read(bytes.add(page_size())), 42);
    }

    release_region(base, region_size).expect("should release everything");
}

#[test]
fn test_file_backed_commit() {
    let region_size = 1usize << 20;
    let base = reserve_region(region_size).expect("reserve should succeed");

    let file = tempfile::tempfile().expect("tempfile should open");
    commit_file_region(file, base, 2 * page_size()).expect("should commit over the file");

    let bytes = base.as_ptr() as *mut u8;
    unsafe {
        assert_eq!(std::ptr::read(bytes), 0);
        std::ptr::write_bytes(bytes, 7, 2 * page_size());
        assert_eq!(std::ptr::read(bytes.add(page_size())), 7);
    }

    release_region(base, region_size).expect("should release everything");
}
