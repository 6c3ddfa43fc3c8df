//! The arena core: bump allocation over a chain of reserve/commit
//! blocks, with positional rollback.
//!
//! An `Arena` hands out pointers by bumping an offset in its tail
//! block.  Committed memory grows lazily in `commit_size` granules;
//! when the tail reservation runs out, a fresh block is reserved and
//! chained (unless `no_chain` forbids it).  `position` captures a
//! rollback token; `pop_to` rewinds to it, releasing any block whose
//! base lies past the target.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::block::{align_up, BlockFlags, BlockHeader, HEADER_SIZE};
use crate::error::ArenaError;
use crate::mapper::get_mapper;
use crate::Mapper;

/// Address space reserved per block unless overridden.
pub const DEFAULT_RESERVE_SIZE: usize = 64 << 20;

/// Commit granule unless overridden.
pub const DEFAULT_COMMIT_SIZE: usize = 64 << 10;

/// Creation-time configuration for an [`Arena`].
pub struct ArenaConfig {
    /// Back reservations with huge pages.
    pub large_pages: bool,
    /// Forbid spill blocks: the root reservation is a hard limit and
    /// overflowing requests fail with `CapacityExceeded`.
    pub no_chain: bool,
    /// Address space reserved per block.
    pub reserve_size: usize,
    /// Granule committed memory grows in.
    pub commit_size: usize,
    /// Optional pre-existing buffer, `reserve_size` bytes long and
    /// aligned to the mapping granularity, to adopt as the root
    /// reservation.  The buffer must be readable and writable and is
    /// treated as fully committed.
    pub backing: Option<NonNull<u8>>,
    /// Whether `deinit` releases the `backing` buffer through the
    /// mapper.  Only set this when ownership transfers to the arena
    /// and the buffer came from that same mapper; by default the
    /// caller keeps the buffer.
    pub release_backing: bool,
    /// Name of a registered mapper to acquire memory through, or
    /// `None` for the default anonymous mapper.
    pub mapper_name: Option<String>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            large_pages: false,
            no_chain: false,
            reserve_size: DEFAULT_RESERVE_SIZE,
            commit_size: DEFAULT_COMMIT_SIZE,
            backing: None,
            release_backing: false,
            mapper_name: None,
        }
    }
}

/// Per-call options for the typed push operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocOptions {
    /// Overrides the natural alignment of the pushed type.
    pub alignment: Option<usize>,
    /// Zero the returned range.
    pub zero: bool,
}

/// A growable bump arena backed by virtual-memory reserve/commit.
///
/// Allocation is a pointer bump; reclamation is positional (`pop`,
/// `pop_to`, `clear`, [`ScopedRestore`]) or wholesale (`deinit`).
/// There is no individual deallocation.
///
/// Returned pointers stay valid until a pop whose target position is
/// at or below the allocation's position, or until teardown.  The
/// arena owns its blocks exclusively and holds no synchronization;
/// the raw root pointer keeps it `!Send` and `!Sync`.
pub struct Arena {
    /// Base block of the chain; null once the handle is torn down.
    root: *mut BlockHeader,
}

impl Arena {
    /// Attempts to create an arena from `config`.
    ///
    /// Reserves `reserve_size` bytes (rounded up to the mapping
    /// granularity) and commits the first `commit_size` of them; on
    /// any platform failure the partial reservation is released and
    /// the error is `OutOfMemory`.
    pub fn init(config: ArenaConfig) -> Result<Arena, ArenaError> {
        let mapper = get_mapper(config.mapper_name.as_deref())
            .map_err(|_| ArenaError::Failure("no such mapper"))?;

        let mut flags = BlockFlags::empty();
        if config.large_pages {
            flags |= BlockFlags::LARGE_PAGES;
        }
        if config.no_chain {
            flags |= BlockFlags::NO_CHAIN;
        }

        let root = match config.backing {
            Some(buffer) => {
                let mut root_flags = flags;
                if !config.release_backing {
                    root_flags |= BlockFlags::EXTERNAL;
                }

                BlockHeader::adopt(
                    mapper,
                    root_flags,
                    buffer,
                    config.reserve_size,
                    config.commit_size,
                )?
            }
            None => BlockHeader::allocate(
                mapper,
                flags,
                config.reserve_size,
                config.commit_size,
                config.reserve_size,
                config.commit_size,
                0,
                std::ptr::null_mut(),
            )?,
        };

        Ok(Arena {
            root: root.as_ptr(),
        })
    }

    /// Returns true until `deinit` tears the handle down.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.root.is_null()
    }

    /// Returns the arena's position: the tail block's global offset
    /// plus its local offset.  Monotonically non-decreasing between
    /// pops, and usable as a rollback token for [`Arena::pop_to`].
    pub fn position(&self) -> u64 {
        assert!(self.is_initialized(), "position() on a torn-down arena");

        unsafe {
            let cur = (*self.root).current;
            (*cur).global_offset + (*cur).local_offset as u64
        }
    }

    /// Number of blocks currently chained.
    pub fn block_count(&self) -> usize {
        assert!(self.is_initialized(), "block_count() on a torn-down arena");

        let mut count = 0;
        unsafe {
            let mut cur = (*self.root).current;
            while !cur.is_null() {
                count += 1;
                cur = (*cur).prev;
            }
        }
        count
    }

    /// Committed bytes in the tail block.
    pub fn committed_bytes(&self) -> usize {
        assert!(self.is_initialized(), "committed_bytes() on a torn-down arena");

        unsafe { (*(*self.root).current).committed_bytes }
    }

    /// Reserved bytes in the tail block.
    pub fn reserved_bytes(&self) -> usize {
        assert!(self.is_initialized(), "reserved_bytes() on a torn-down arena");

        unsafe { (*(*self.root).current).reserved_bytes }
    }

    /// Allocates `size` bytes aligned to `alignment`, committing more
    /// pages, or chaining a fresh block, as needed.
    ///
    /// The returned range lies entirely within the committed prefix
    /// of a single block.  With `zero`, the range reads as zero
    /// bytes.  A failed push leaves the arena at its pre-call
    /// position.
    ///
    /// `alignment` must be a power of two no larger than the mapper's
    /// page size: block bases are only page-aligned, so a larger
    /// alignment could not be honored.
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % alignment == 0,
              "returned pointers satisfy the requested alignment")]
    pub fn push_raw(
        &mut self,
        size: usize,
        alignment: usize,
        zero: bool,
    ) -> Result<NonNull<u8>, ArenaError> {
        if !self.is_initialized() {
            return Err(ArenaError::NotInitialized);
        }

        unsafe {
            let root = self.root;
            let mapper: &'static dyn Mapper = (*root).mapper;

            if !alignment.is_power_of_two() || alignment > mapper.page_size() {
                return Err(ArenaError::InvalidAlignment(alignment));
            }

            let current = (*root).current;
            let local_offset = (*current).local_offset;
            let reserved_bytes = (*current).reserved_bytes;
            let fit = align_up(local_offset, alignment)
                .and_then(|start| start.checked_add(size).map(|end| (start, end)))
                .filter(|&(_, end)| end <= reserved_bytes);

            let (block, start, end, spilled) = match fit {
                Some((start, end)) => (current, start, end, false),
                None => {
                    if (*current).flags.contains(BlockFlags::NO_CHAIN) {
                        return Err(ArenaError::CapacityExceeded {
                            requested: size,
                            reserved: (*current).reserved_bytes,
                        });
                    }

                    let granule = (*current).granule();
                    let fresh_start =
                        align_up(HEADER_SIZE, alignment).expect("alignment is at most a page");
                    let needed =
                        fresh_start
                            .checked_add(size)
                            .ok_or(ArenaError::OutOfMemory {
                                requested: size,
                                errno: 0,
                            })?;

                    // A single oversized request gets a block sized
                    // to fit it; ordinary spills reuse the inherited
                    // growth parameters.
                    let (reserve, commit) = if needed > (*current).reserve_size {
                        let enlarged = align_up(needed, alignment.max(granule)).ok_or(
                            ArenaError::OutOfMemory {
                                requested: needed,
                                errno: 0,
                            },
                        )?;
                        (enlarged, enlarged)
                    } else {
                        ((*current).reserve_size, (*current).commit_size)
                    };

                    let fresh = BlockHeader::allocate(
                        mapper,
                        (*current).flags - BlockFlags::EXTERNAL,
                        reserve,
                        commit,
                        (*current).reserve_size,
                        (*current).commit_size,
                        (*current).global_offset + (*current).reserved_bytes as u64,
                        current,
                    )?;

                    log::debug!(
                        "arena spilled into a new block: reserve=0x{:x} global_offset=0x{:x}",
                        reserve,
                        (*fresh.as_ptr()).global_offset
                    );

                    (*root).current = fresh.as_ptr();
                    (fresh.as_ptr(), fresh_start, needed, true)
                }
            };

            let large = (*block).flags.contains(BlockFlags::LARGE_PAGES);
            let committed_before = (*block).committed_bytes;
            if end > committed_before {
                let target = align_up(end, (*block).commit_size)
                    .unwrap_or((*block).reserved_bytes)
                    .min((*block).reserved_bytes);
                let delta = target - committed_before;
                let base = NonNull::new((*block).base().add(committed_before) as *mut c_void)
                    .expect("committed prefixes stay in the reservation");

                let committed = if large {
                    mapper.commit_large(base, delta)
                } else {
                    mapper.commit(base, delta)
                };
                if let Err(errno) = committed {
                    log::warn!("arena commit failed: requested=0x{:x} errno={}", delta, errno);
                    if spilled {
                        // Unlink the fresh block so a failed push
                        // leaves the position untouched.
                        (*root).current = (*block).prev;
                        BlockHeader::release(block);
                    }
                    return Err(ArenaError::OutOfMemory {
                        requested: delta,
                        errno,
                    });
                }
                (*block).committed_bytes = target;
            }

            if zero {
                // Pages committed by this very call come zeroed from
                // the platform; only scrub the prefix that predates
                // it.
                let prior = if spilled { 0 } else { committed_before };
                let zero_end = end.min(prior);
                if start < zero_end {
                    std::ptr::write_bytes((*block).base().add(start), 0, zero_end - start);
                }
            }

            (*block).local_offset = end;
            if spilled {
                self.check_rep();
            }

            Ok(NonNull::new_unchecked((*block).base().add(start)))
        }
    }

    /// Allocates one `T` and returns its pointer.  The pointee is
    /// uninitialized unless `zero` was requested; the caller writes
    /// it before reading.
    pub fn push<T>(&mut self, options: AllocOptions) -> Result<NonNull<T>, ArenaError> {
        let alignment = options.alignment.unwrap_or(mem::align_of::<T>());
        let raw = self.push_raw(mem::size_of::<T>(), alignment, options.zero)?;

        Ok(raw.cast())
    }

    /// Allocates a contiguous run of `count` `T`s.
    pub fn push_array<T>(
        &mut self,
        count: usize,
        options: AllocOptions,
    ) -> Result<NonNull<[T]>, ArenaError> {
        let alignment = options.alignment.unwrap_or(mem::align_of::<T>());
        let bytes = mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(ArenaError::Failure("array byte size overflows usize"))?;
        let raw = self.push_raw(bytes, alignment, options.zero)?;

        Ok(NonNull::slice_from_raw_parts(raw.cast::<T>(), count))
    }

    /// Rolls the arena back to `target`, releasing every block whose
    /// base lies at or past it.  The target is clamped to the root's
    /// first allocatable offset; popping to a position above the
    /// current one is a contract violation.
    #[ensures(self.position() >= HEADER_SIZE as u64,
              "the position never drops below the root base")]
    pub fn pop_to(&mut self, target: u64) {
        assert!(self.is_initialized(), "pop_to() on a torn-down arena");

        let target = target.max(HEADER_SIZE as u64);
        unsafe {
            let root = self.root;
            let mut cur = (*root).current;
            while (*cur).global_offset >= target {
                let prev = (*cur).prev;
                assert!(!prev.is_null(), "cannot pop below the base block");
                BlockHeader::release(cur);
                cur = prev;
            }

            // A target inside this block's header prefix clamps up to
            // the first allocatable byte.
            let local = ((target - (*cur).global_offset) as usize).max(HEADER_SIZE);
            assert!(
                local <= (*cur).local_offset,
                "pop cannot advance the position"
            );
            (*cur).local_offset = local;
            (*root).current = cur;
        }

        self.check_rep();
    }

    /// Pops `amount` bytes off the arena, clamping at the root's
    /// base.
    pub fn pop(&mut self, amount: u64) {
        let target = self.position().saturating_sub(amount);

        self.pop_to(target);
    }

    /// Releases every spill block and rewinds the root block.  The
    /// root's committed pages are retained for reuse.
    #[ensures(self.position() == HEADER_SIZE as u64)]
    pub fn clear(&mut self) {
        self.pop_to(0);
    }

    /// Captures the current position and returns a guard that
    /// restores it on drop.
    pub fn scope(&mut self) -> ScopedRestore<'_> {
        ScopedRestore::new(self)
    }

    /// Releases every block in the chain and poisons the handle.
    /// Calling `deinit` on an already-torn-down handle warns and
    /// no-ops.
    pub fn deinit(&mut self) {
        if !self.is_initialized() {
            log::warn!("deinit on an uninitialized arena handle");
            return;
        }

        unsafe {
            let mut cur = (*self.root).current;
            while !cur.is_null() {
                let prev = (*cur).prev;
                BlockHeader::release(cur);
                cur = prev;
            }
        }
        self.root = std::ptr::null_mut();
    }

    /// Asserts the chain invariants: per-block bounds, prefix-sum
    /// global offsets, and tail reachability.
    pub(crate) fn check_rep(&self) {
        if !self.is_initialized() {
            return;
        }

        unsafe {
            let root = self.root;
            assert_eq!((*root).global_offset, 0, "the root starts the address line");
            assert!((*root).prev.is_null(), "the root has no predecessor");

            let mut cur = (*root).current;
            let mut reached_root = false;
            while !cur.is_null() {
                (*cur).check_rep();

                let prev = (*cur).prev;
                if prev.is_null() {
                    assert!(std::ptr::eq(cur, root), "the chain bottoms out at the root");
                    reached_root = true;
                } else {
                    assert_eq!(
                        (*cur).global_offset,
                        (*prev).global_offset + (*prev).reserved_bytes as u64,
                        "global offsets are prefix sums of reserved sizes"
                    );
                }
                cur = prev;
            }
            assert!(reached_root, "the tail must be reachable from the root");
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.deinit();
        }
    }
}

/// Captures an arena position at construction and restores it when
/// the guard goes out of scope, releasing any blocks chained in the
/// meantime.  Guards nest arbitrarily and deref to the arena, so
/// allocation continues through them.
pub struct ScopedRestore<'a> {
    arena: &'a mut Arena,
    saved_position: u64,
}

impl<'a> ScopedRestore<'a> {
    pub fn new(arena: &'a mut Arena) -> ScopedRestore<'a> {
        let saved_position = arena.position();

        ScopedRestore {
            arena,
            saved_position,
        }
    }

    /// The position the guard restores on drop.
    pub fn saved_position(&self) -> u64 {
        self.saved_position
    }
}

impl Deref for ScopedRestore<'_> {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        self.arena
    }
}

impl DerefMut for ScopedRestore<'_> {
    fn deref_mut(&mut self) -> &mut Arena {
        self.arena
    }
}

impl Drop for ScopedRestore<'_> {
    fn drop(&mut self) {
        if self.arena.is_initialized() {
            self.arena.pop_to(self.saved_position);
        }
    }
}
