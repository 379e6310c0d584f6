//! Error types for the arena manager.

/// Result type alias for arena operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the arena manager.
///
/// Allocation and reservation failures come back as `Err`; free-path
/// problems are logged by [`Manager::free`](crate::Manager::free) and
/// never propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No arena could satisfy the request and the OS fallback was
    /// disabled or refused.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// The arena registry already holds the maximum number of arenas.
    #[error("arena registry full")]
    RegistryFull,

    /// A memid decoded to a nonexistent arena or an out-of-range block.
    #[error("invalid free of {ptr:#x} (memid {memid:#x})")]
    InvalidFree {
        /// Address being freed.
        ptr: usize,
        /// Raw memid the caller passed.
        memid: usize,
    },

    /// Part of the freed run was already free.
    #[error("double free of {ptr:#x} ({size} bytes)")]
    DoubleFree {
        /// Address being freed.
        ptr: usize,
        /// Size of the freed run in bytes.
        size: usize,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }
}
