//! The file-backed mapper commits arena memory as shared mappings of
//! private temporary files.  This lets the operating system eagerly
//! swap out cold arena pages when under memory pressure.
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
use std::fs::File;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::Mapper;

#[derive(Debug)]
pub struct FileBackedMapper {}

lazy_static::lazy_static! {
    static ref FILE_BACKED_PATH: Mutex<Option<PathBuf>> = Default::default();
}

/// Updates the parent directory for the file-backed mapper's
/// temporary files to `path`.
pub fn set_file_backed_arena_directory(path: Option<PathBuf>) {
    let mut global_path = FILE_BACKED_PATH.lock().unwrap();

    *global_path = path;
}

/// Returns a temporary File in `FILE_BACKED_PATH`, or in the global
/// `TMPDIR`.
fn get_temp_file() -> Result<File, i32> {
    let path = FILE_BACKED_PATH.lock().unwrap();

    match &*path {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    }
    .map_err(|e| e.raw_os_error().unwrap_or(0))
}

#[contract_trait]
impl Mapper for FileBackedMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    // File mappings use the regular page granularity.
    fn large_page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region(size)
    }

    fn reserve_large(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region(size)
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        let tempfile = get_temp_file()?;

        crate::map::commit_file_region(tempfile, base, size)
    }

    fn commit_large(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        self.commit(base, size)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::release_region(base, size)
    }
}
