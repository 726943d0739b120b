//! SELinux labelling of new layers.

use std::path::Path;

use log::debug;
use rustix::{
    fs::{lsetxattr, XattrFlags},
    io::Errno,
};
use walkdir::WalkDir;

use crate::error::{vanished_during_walk, DriverError, Result};

const SELINUX_FS: &str = "/sys/fs/selinux";
const SELINUX_XATTR: &str = "security.selinux";

/// Whether SELinux is mounted on this host.
pub fn selinux_enabled() -> bool {
    Path::new(SELINUX_FS).join("enforce").exists()
}

/// Applies `mount_label` to `path` and everything below it, without following symlinks.
///
/// Does nothing for an empty label or on hosts without SELinux.
pub fn relabel(path: impl AsRef<Path>, mount_label: &str) -> Result<()> {
    if mount_label.is_empty() || !selinux_enabled() {
        return Ok(());
    }
    relabel_tree(path.as_ref(), mount_label)
}

fn relabel_tree(path: &Path, label: &str) -> Result<()> {
    for entry in WalkDir::new(path) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if vanished_during_walk(&err) => continue,
            Err(err) => return Err(DriverError::walk(path)(err)),
        };
        let target = entry.path();
        match lsetxattr(target, SELINUX_XATTR, label.as_bytes(), XattrFlags::empty()) {
            Ok(()) => {}
            Err(Errno::NOENT) if entry.depth() > 0 => {
                debug!("{target:?} vanished during relabel")
            }
            Err(errno) => return Err(DriverError::path(target)(errno.into())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_label_is_noop() {
        // would fail with NotFound if anything were attempted
        relabel("/nonexistent/layer", "").unwrap();
    }

    #[test]
    fn test_relabel_missing_root() {
        let label = "system_u:object_r:container_file_t:s0";
        let err = relabel_tree(Path::new("/nonexistent/layer"), label).unwrap_err();
        assert!(err.is_not_found());
    }
}
