// Library crate for objfs: the binary and the integration tests build on these modules.

pub mod cache;
pub mod cadapter;
pub mod cli;
pub mod config;
pub mod error;
pub mod fuse;
pub mod meta;
pub mod metrics;
pub mod range;
pub mod util;
pub mod vfs;

pub use error::{ObjfsError, Result};
