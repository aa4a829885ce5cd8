//! Byte-range access to backing objects
//!
//! - `align`: pure mapping from a read window to an aligned backend range
//! - `reader`: admission-controlled ranged fetches over a [`RangeBackend`]
//!
//! [`RangeBackend`]: crate::cadapter::RangeBackend

pub mod align;
pub mod reader;

pub use align::{DEFAULT_BLOCK_SIZE, DEFAULT_PREFETCH_SIZE, RangeLayout, align_range};
pub use reader::{RangeReader, ReaderStats};
