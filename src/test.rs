//! Test utilities.
//!
//! Tests that need a real btrfs filesystem are gated on `$BTRFS_TEST_DIR`,
//! which must name a writable directory on btrfs.  Most of them also need
//! root for the subvolume and quota ioctls.

use std::ffi::OsString;

use once_cell::sync::Lazy;
use tempfile::TempDir;

static TMPDIR: Lazy<OsString> = Lazy::new(|| {
    if let Some(path) = std::env::var_os("BTRFS_TEST_DIR") {
        eprintln!("temporary directory from $BTRFS_TEST_DIR: {path:?}");
        path
    } else {
        std::env::temp_dir().into()
    }
});

/// Allocate a temporary directory, on btrfs when `$BTRFS_TEST_DIR` is set.
pub fn tempdir() -> TempDir {
    TempDir::with_prefix_in("btrfs-test-", TMPDIR.as_os_str()).unwrap()
}
