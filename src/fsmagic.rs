//! Filesystem type detection.

use std::path::Path;

use rustix::fs::statfs;

use crate::error::{DriverError, Result};

/// `BTRFS_SUPER_MAGIC` from `linux/magic.h`.
pub const BTRFS_SUPER_MAGIC: u32 = 0x9123_683E;

/// Whether `path` lives on a btrfs filesystem.
pub fn is_btrfs(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let buf = statfs(path).map_err(|errno| DriverError::path(path)(errno.into()))?;
    Ok(buf.f_type as u32 == BTRFS_SUPER_MAGIC)
}
