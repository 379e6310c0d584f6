//! Convenient re-exports for common strata types.
//!
//! This module provides a single import for most use cases:
//! ```
//! use strata_rs::prelude::*;
//! ```

pub use crate::arena::{AllocRequest, Allocation, Manager};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::memid::{ArenaId, MemId};
pub use crate::os::{MockMemory, OsMemory};

#[cfg(unix)]
pub use crate::os::SystemMemory;
