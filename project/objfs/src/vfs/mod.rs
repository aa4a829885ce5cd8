//! VFS layer (virtual filesystem)
//!
//! Responsibilities:
//! - Map inode numbers to the fixed directories and to resolved objects.
//! - Turn reads into aligned range fetches and cut the reply back to the
//!   caller's window.
//! - Track in-flight requests so the kernel can interrupt them.
//!
//! Submodules:
//! - `fs`: the inode table and the read path (`ObjectFs`)
//! - `inflight`: per-request cancellation tokens
pub mod fs;
pub mod inflight;

pub use fs::{DirEntry, FileAttr, FileType, ObjectFs};
pub use inflight::{InFlight, InFlightGuard};
