use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArenaError {
    /// The platform layer refused to reserve or commit memory.
    #[error("Out of memory: the platform refused 0x{requested:x} bytes (errno {errno})")]
    OutOfMemory { requested: usize, errno: i32 },
    /// The requested alignment is zero, not a power of two, or larger
    /// than the mapper's page size.
    #[error("Invalid alignment 0x{0:x}: must be a power of two no larger than the page size")]
    InvalidAlignment(usize),
    /// Chaining is disabled and the tail block cannot fit the request.
    #[error("Capacity exceeded: 0x{requested:x} bytes do not fit in the 0x{reserved:x}-byte block")]
    CapacityExceeded { requested: usize, reserved: usize },
    /// The handle never completed `init`, or has been torn down.
    #[error("Arena handle is not initialized")]
    NotInitialized,
    /// Catch-all for states that are unreachable while the arena
    /// invariants hold.
    #[error("Internal failure: {0}")]
    Failure(&'static str),
}
