//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we mount unprivileged via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::cadapter::RangeBackend;
use crate::vfs::ObjectFs;

/// Mount options for objfs: named, read-only, no allow_other.
fn read_only_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("objfs").read_only(true);
    mo
}

/// Mount `fs` read-only on the given empty directory.
#[cfg(target_os = "linux")]
pub async fn mount_read_only<B>(
    fs: ObjectFs<B>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    B: RangeBackend + 'static,
{
    let session = rfuse3::raw::Session::new(read_only_mount_options());
    // Requires fusermount3 in PATH.
    session.mount_with_unprivileged(fs, mount_point).await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_read_only<B>(
    _fs: ObjectFs<B>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    B: RangeBackend + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
