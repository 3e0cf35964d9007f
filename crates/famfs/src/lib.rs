#![forbid(unsafe_code)]
//! famfs public API facade.
//!
//! Re-exports the control plane from `famfs-core` through a stable
//! external interface. This is the crate downstream consumers (CLI,
//! test harnesses) depend on.

pub use famfs_core::*;
