//! A growable bump arena backed by virtual-memory reserve/commit.
//!
//! Address space is reserved up front and committed lazily; when a
//! reservation runs out, the arena chains a fresh block.  Allocation
//! is one pointer bump, and reclamation is positional: `pop` back to
//! an earlier `position`, `clear` the whole arena, or let a
//! [`ScopedRestore`] guard rewind on scope exit.
mod arena;
mod block;
mod error;
mod file_backed_mapper;
mod map;
mod mapper;

pub use arena::Arena;
pub use arena::ArenaConfig;
pub use arena::AllocOptions;
pub use arena::ScopedRestore;
pub use arena::DEFAULT_COMMIT_SIZE;
pub use arena::DEFAULT_RESERVE_SIZE;
pub use block::HEADER_SIZE;
pub use error::ArenaError;
pub use file_backed_mapper::set_file_backed_arena_directory;
pub use mapper::get_mapper;
pub use mapper::register_mapper;
pub use mapper::Mapper;
