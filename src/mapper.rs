//! A `Mapper` is responsible for acquiring address space and backing
//! memory from the operating system.  Each arena block is reserved,
//! committed, and released through such a `Mapper`.
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

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this mapper.  All calls
    /// into the mapper align addresses and sizes to that page size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Returns the granularity used for large-page reservations.
    #[ensures(ret > 0 && ret % self.page_size() == 0,
              "large pages are a multiple of the regular granularity")]
    fn large_page_size(&self) -> usize;

    /// Attempts to reserve a range of address space of `size` bytes.
    /// On success, returns the address of the first byte in the
    /// reserved range; the range's page mappings are absent until
    /// committed.
    #[requires(size > 0)]
    #[requires(size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % self.page_size() == 0,
              "The mapped range is aligned to the page size")]
    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32>;

    /// Same as `reserve`, with the range backed by large pages.
    #[requires(size > 0)]
    #[requires(size % self.large_page_size() == 0)]
    fn reserve_large(&self, size: usize) -> Result<NonNull<c_void>, i32>;

    /// Makes `[base, base + size)` readable and writable, with backing
    /// storage.  The range is always a subset of a range that was
    /// returned by a single `reserve` call.  Committing pages that are
    /// already committed must be idempotent, and freshly committed
    /// pages must read as zero.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Same as `commit`, for ranges obtained with `reserve_large`.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.large_page_size() == 0)]
    fn commit_large(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Unmaps a range that was previously obtained with a single call
    /// to `reserve` or `reserve_large`, committed or not.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;
}

#[derive(Debug)]
struct DefaultMapper {}

lazy_static::lazy_static! {
    static ref NAMED_MAPPERS: Mutex<HashMap<String, &'static dyn Mapper>> = {
        let mut map: HashMap<String, &'static dyn Mapper> = HashMap::new();

        map.insert("file".to_string(), Box::leak(Box::new(crate::file_backed_mapper::FileBackedMapper{})));
        Mutex::new(map)
    };
}

/// Upserts the mapper associated with `name`.
pub fn register_mapper(name: String, mapper: &'static dyn Mapper) {
    let mut mappers = NAMED_MAPPERS.lock().unwrap();

    mappers.insert(name, mapper);
}

/// Returns the mapper for the given `name`, if one exists, or the
/// default mapper if `name` is `None`.
///
/// # Errors
///
/// Returns `Err` if no such mapper is defined.
pub fn get_mapper(name: Option<&str>) -> Result<&'static dyn Mapper, &'static str> {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: DefaultMapper = DefaultMapper{};
    }

    match name {
        Some(key) => {
            let mappers = NAMED_MAPPERS.lock().unwrap();

            Ok(*mappers.get(key).ok_or("Mapper not found")?)
        }
        None => Ok(&*DEFAULT_MAPPER),
    }
}

#[contract_trait]
impl Mapper for DefaultMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn large_page_size(&self) -> usize {
        crate::map::large_page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region(size)
    }

    fn reserve_large(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region_large(size)
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::commit_region(base, size)
    }

    fn commit_large(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::commit_region(base, size)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::release_region(base, size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_mapper() {
        let mapper = get_mapper(None).expect("default mapper always exists");

        assert!(mapper.page_size().is_power_of_two());

        let size = 4 * mapper.page_size();
        let base = mapper.reserve(size).expect("reserve should succeed");
        mapper
            .commit(base, mapper.page_size())
            .expect("commit should succeed");
        mapper.release(base, size).expect("release should succeed");
    }

    #[test]
    fn test_named_mappers() {
        assert!(get_mapper(Some("file")).is_ok());
        assert!(get_mapper(Some("no such mapper")).is_err());
    }

    #[test]
    fn test_register_mapper() {
        #[derive(Debug)]
        struct Wrapper {}

        #[contract_trait]
        impl Mapper for Wrapper {
            fn page_size(&self) -> usize {
                crate::map::page_size()
            }

            fn large_page_size(&self) -> usize {
                crate::map::large_page_size()
            }

            fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
                crate::map::reserve_region(size)
            }

            fn reserve_large(&self, size: usize) -> Result<NonNull<c_void>, i32> {
                crate::map::reserve_region_large(size)
            }

            fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
                crate::map::commit_region(base, size)
            }

            fn commit_large(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
                crate::map::commit_region(base, size)
            }

            fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
                crate::map::release_region(base, size)
            }
        }

        register_mapper("wrapper".to_string(), Box::leak(Box::new(Wrapper {})));
        assert!(get_mapper(Some("wrapper")).is_ok());
    }
}
