//! A `Block` is one contiguous virtual-memory reservation.  Its
//! header lives in place at the base of the reservation, in a fixed
//! 128-byte prefix that user allocations never touch; the rest of the
//! reservation is bump-allocated, with the committed prefix growing
//! on demand.
use std::ffi::c_void;
use std::mem;
use std::ptr::NonNull;

use static_assertions::const_assert;

use crate::error::ArenaError;
use crate::Mapper;

bitflags::bitflags! {
    pub(crate) struct BlockFlags: u32 {
        /// Back reservations with huge pages.
        const LARGE_PAGES = 1 << 0;
        /// Forbid spill blocks; the root reservation is a hard limit.
        const NO_CHAIN = 1 << 1;
        /// The backing buffer was supplied by the caller and must not
        /// be released on teardown.  Root block only.
        const EXTERNAL = 1 << 2;
    }
}

/// Size of the metadata prefix at the base of every block.  A fresh
/// block's local offset starts here, and position arithmetic counts
/// it, so the constant is part of the public contract.
pub const HEADER_SIZE: usize = 128;

/// The in-place block header.  `BlockHeader::allocate` reinterprets
/// the base of a fresh reservation as this struct, so it must fit in
/// the `HEADER_SIZE` prefix.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Tail block of the chain, where allocations land.  Maintained
    /// on the root block; meaningless elsewhere.
    pub(crate) current: *mut BlockHeader,
    /// Previous block in the chain; null on the root.
    pub(crate) prev: *mut BlockHeader,
    /// The mapper that produced this reservation and will release it.
    pub(crate) mapper: &'static dyn Mapper,
    /// First free byte, measured from the block's base.
    pub(crate) local_offset: usize,
    /// Sum of `reserved_bytes` over all strictly earlier blocks.
    pub(crate) global_offset: u64,
    /// Prefix of the reservation currently backed by pages.
    pub(crate) committed_bytes: usize,
    /// Total address space reserved for this block.
    pub(crate) reserved_bytes: usize,
    /// Growth parameters spill blocks inherit, rounded to the mapping
    /// granularity.
    pub(crate) reserve_size: usize,
    pub(crate) commit_size: usize,
    pub(crate) flags: BlockFlags,
}

const_assert!(mem::size_of::<BlockHeader>() <= HEADER_SIZE);
const_assert!(HEADER_SIZE % mem::align_of::<BlockHeader>() == 0);

/// Rounds `value` up to the next multiple of `granule`.  The granule
/// does not have to be a power of two.  `None` on overflow.
pub(crate) fn align_up(value: usize, granule: usize) -> Option<usize> {
    debug_assert!(granule > 0);

    let rem = value % granule;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(granule - rem)
    }
}

/// Rounds `value` down to a multiple of `granule`.
pub(crate) fn align_down(value: usize, granule: usize) -> usize {
    debug_assert!(granule > 0);

    value - (value % granule)
}

impl BlockHeader {
    /// Reserves a fresh region, commits its initial prefix, and
    /// writes the header in place at the base.
    ///
    /// `reserve_bytes` and `commit_bytes` size this block;
    /// `reserve_size` and `commit_size` are recorded as the growth
    /// parameters future spill blocks inherit.  All four are rounded
    /// up to the mapper's granularity.  Any platform failure releases
    /// the partial reservation and reports `OutOfMemory`.
    pub(crate) fn allocate(
        mapper: &'static dyn Mapper,
        flags: BlockFlags,
        reserve_bytes: usize,
        commit_bytes: usize,
        reserve_size: usize,
        commit_size: usize,
        global_offset: u64,
        prev: *mut BlockHeader,
    ) -> Result<NonNull<BlockHeader>, ArenaError> {
        let granule = granule_for(mapper, flags);
        let oom = |requested| ArenaError::OutOfMemory {
            requested,
            errno: 0,
        };

        let reserved =
            align_up(reserve_bytes.max(HEADER_SIZE), granule).ok_or_else(|| oom(reserve_bytes))?;
        let committed = align_up(commit_bytes, granule)
            .ok_or_else(|| oom(commit_bytes))?
            .max(granule)
            .min(reserved);
        let reserve_param =
            align_up(reserve_size.max(HEADER_SIZE), granule).ok_or_else(|| oom(reserve_size))?;
        let commit_param =
            align_up(commit_size.max(1), granule).ok_or_else(|| oom(commit_size))?;

        let large = flags.contains(BlockFlags::LARGE_PAGES);
        let base = if large {
            mapper.reserve_large(reserved)
        } else {
            mapper.reserve(reserved)
        }
        .map_err(|errno| {
            log::warn!(
                "block reserve failed: size=0x{:x} errno={}",
                reserved,
                errno
            );
            ArenaError::OutOfMemory {
                requested: reserved,
                errno,
            }
        })?;

        let commit_result = if large {
            mapper.commit_large(base, committed)
        } else {
            mapper.commit(base, committed)
        };
        if let Err(errno) = commit_result {
            log::warn!(
                "block initial commit failed: size=0x{:x} errno={}",
                committed,
                errno
            );
            let _ = mapper.release(base, reserved);
            return Err(ArenaError::OutOfMemory {
                requested: committed,
                errno,
            });
        }

        let header = base.cast::<BlockHeader>();
        unsafe {
            header.as_ptr().write(BlockHeader {
                current: header.as_ptr(),
                prev,
                mapper,
                local_offset: HEADER_SIZE,
                global_offset,
                committed_bytes: committed,
                reserved_bytes: reserved,
                reserve_size: reserve_param,
                commit_size: commit_param,
                flags,
            });
        }

        Ok(header)
    }

    /// Adopts a caller-supplied buffer of `reserve_size` bytes as a
    /// fully committed root reservation.  The buffer must be aligned
    /// to the mapping granularity; whether teardown releases it is
    /// governed by the `EXTERNAL` flag.
    pub(crate) fn adopt(
        mapper: &'static dyn Mapper,
        flags: BlockFlags,
        buffer: NonNull<u8>,
        reserve_size: usize,
        commit_size: usize,
    ) -> Result<NonNull<BlockHeader>, ArenaError> {
        let granule = granule_for(mapper, flags);

        assert_eq!(
            buffer.as_ptr() as usize % granule,
            0,
            "backing buffers must be aligned to the mapping granularity"
        );

        // Never exceed the buffer: round its usable size down.
        let reserved = align_down(reserve_size, granule);
        if reserved < granule {
            return Err(ArenaError::Failure(
                "backing buffer is smaller than one page",
            ));
        }

        let oom = |requested| ArenaError::OutOfMemory {
            requested,
            errno: 0,
        };
        let reserve_param =
            align_up(reserve_size.max(HEADER_SIZE), granule).ok_or_else(|| oom(reserve_size))?;
        let commit_param =
            align_up(commit_size.max(1), granule).ok_or_else(|| oom(commit_size))?;

        let header = buffer.cast::<BlockHeader>();
        unsafe {
            header.as_ptr().write(BlockHeader {
                current: header.as_ptr(),
                prev: std::ptr::null_mut(),
                mapper,
                local_offset: HEADER_SIZE,
                global_offset: 0,
                committed_bytes: reserved,
                reserved_bytes: reserved,
                reserve_size: reserve_param,
                commit_size: commit_param,
                flags,
            });
        }

        Ok(header)
    }

    /// Releases `block`'s reservation, unless the backing was
    /// supplied externally.  The header itself lives inside the
    /// reservation: `block` is dangling once this returns.
    pub(crate) unsafe fn release(block: *mut BlockHeader) {
        let mapper = (*block).mapper;
        let flags = (*block).flags;
        let reserved = (*block).reserved_bytes;

        if flags.contains(BlockFlags::EXTERNAL) {
            return;
        }

        let base = NonNull::new(block as *mut c_void).expect("block bases are never null");
        if let Err(errno) = mapper.release(base, reserved) {
            log::warn!(
                "block release failed: base={:?} size=0x{:x} errno={}",
                base,
                reserved,
                errno
            );
        }
    }

    /// The block's base address; the header sits at the first
    /// `HEADER_SIZE` bytes, user data after.
    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self as *const BlockHeader as *mut u8
    }

    #[inline]
    pub(crate) fn granule(&self) -> usize {
        granule_for(self.mapper, self.flags)
    }

    /// Asserts the per-block invariants.
    pub(crate) fn check_rep(&self) {
        let granule = self.granule();

        assert!(
            self.local_offset >= HEADER_SIZE,
            "the header prefix is never allocated from: local_offset={}",
            self.local_offset
        );
        assert!(
            self.local_offset <= self.committed_bytes,
            "allocations stop at the committed prefix: local_offset={} committed={}",
            self.local_offset,
            self.committed_bytes
        );
        assert!(
            self.committed_bytes <= self.reserved_bytes,
            "the committed prefix fits the reservation: committed={} reserved={}",
            self.committed_bytes,
            self.reserved_bytes
        );
        assert_eq!(
            self.reserved_bytes % granule,
            0,
            "reservations are granule-aligned"
        );
        assert_eq!(
            self.committed_bytes % granule,
            0,
            "commits are granule-aligned"
        );
        assert_eq!(
            self.base() as usize % self.mapper.page_size(),
            0,
            "block bases are page-aligned"
        );
    }
}

fn granule_for(mapper: &'static dyn Mapper, flags: BlockFlags) -> usize {
    if flags.contains(BlockFlags::LARGE_PAGES) {
        mapper.large_page_size()
    } else {
        mapper.page_size()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::get_mapper;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(1, 4096), Some(4096));
        assert_eq!(align_up(4096, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(usize::MAX, 4096), None);

        // Non-power-of-two granules are allowed.
        assert_eq!(align_up(100, 24), Some(120));

        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4095, 4096), 0);
    }

    #[test]
    fn test_allocate_and_release() {
        let mapper = get_mapper(None).expect("default mapper always exists");
        let page = mapper.page_size();

        let block = BlockHeader::allocate(
            mapper,
            BlockFlags::empty(),
            1 << 20,
            page,
            1 << 20,
            page,
            0,
            std::ptr::null_mut(),
        )
        .expect("allocate should succeed");

        unsafe {
            let header = &*block.as_ptr();
            header.check_rep();

            assert_eq!(header.local_offset, HEADER_SIZE);
            assert_eq!(header.global_offset, 0);
            assert_eq!(header.reserved_bytes, 1 << 20);
            assert_eq!(header.committed_bytes, page);
            assert!(header.prev.is_null());

            // The committed prefix past the header is writable and
            // reads as zero.
            let user = header.base().add(HEADER_SIZE);
            assert_eq!(std::ptr::read(user), 0);
            std::ptr::write(user, 42);
            assert_eq!(std::ptr::read(user), 42);

            BlockHeader::release(block.as_ptr());
        }
    }

    #[test]
    fn test_commit_clamped_to_reservation() {
        let mapper = get_mapper(None).expect("default mapper always exists");
        let page = mapper.page_size();

        // Ask for a commit prefix larger than the reservation.
        let block = BlockHeader::allocate(
            mapper,
            BlockFlags::empty(),
            2 * page,
            16 * page,
            2 * page,
            16 * page,
            0,
            std::ptr::null_mut(),
        )
        .expect("allocate should succeed");

        unsafe {
            let header = &*block.as_ptr();
            header.check_rep();
            assert_eq!(header.committed_bytes, header.reserved_bytes);

            BlockHeader::release(block.as_ptr());
        }
    }

    #[test]
    fn test_adopt_external_buffer() {
        let mapper = get_mapper(None).expect("default mapper always exists");
        let page = mapper.page_size();
        let size = 16 * page;

        // A committed mapping stands in for the caller's buffer.
        let buffer = mapper.reserve(size).expect("reserve should succeed");
        mapper.commit(buffer, size).expect("commit should succeed");

        let block = BlockHeader::adopt(
            mapper,
            BlockFlags::EXTERNAL,
            buffer.cast(),
            size,
            page,
        )
        .expect("adopt should succeed");

        unsafe {
            let header = &*block.as_ptr();
            header.check_rep();
            assert_eq!(header.reserved_bytes, size);
            assert_eq!(header.committed_bytes, size);

            // EXTERNAL blocks survive release untouched.
            BlockHeader::release(block.as_ptr());
            assert_eq!((*block.as_ptr()).reserved_bytes, size);
        }

        mapper.release(buffer, size).expect("release should succeed");
    }
}
