//! Disk usage of a layer directory.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{vanished_during_walk, DriverError, Result};

/// Space and inodes used by a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    /// Sum of apparent file sizes, counting each inode once.
    pub size: u64,
    pub inode_count: u64,
}

/// Walks `dir` and totals its usage.  Entries that disappear during the walk are skipped.
pub fn usage(dir: impl AsRef<Path>) -> Result<DiskUsage> {
    let dir = dir.as_ref();
    let mut seen = HashSet::new();
    let mut total = DiskUsage::default();

    for entry in WalkDir::new(dir) {
        let metadata = match entry.and_then(|entry| entry.metadata()) {
            Ok(metadata) => metadata,
            Err(err) if vanished_during_walk(&err) => continue,
            Err(err) => return Err(DriverError::walk(dir)(err)),
        };
        if seen.insert((metadata.dev(), metadata.ino())) {
            total.size += metadata.len();
            total.inode_count += 1;
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::fs::{self, create_dir, hard_link, write};
    use std::os::unix::fs::symlink;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_usage_counts_hardlinks_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("layer");
        create_dir(&root).unwrap();
        create_dir(root.join("sub")).unwrap();
        write(root.join("a"), vec![0u8; 1000]).unwrap();
        write(root.join("sub/b"), vec![0u8; 24]).unwrap();
        hard_link(root.join("a"), root.join("sub/a-link")).unwrap();

        let dirs = [root.clone(), root.join("sub")]
            .iter()
            .map(|d| fs::metadata(d).unwrap().len())
            .sum::<u64>();
        let total = usage(&root).unwrap();
        assert_eq!(total.inode_count, 4);
        assert_eq!(total.size, dirs + 1024);
    }

    #[test]
    fn test_usage_does_not_follow_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("layer");
        create_dir(&root).unwrap();
        write(dir.path().join("big"), vec![0u8; 4096]).unwrap();
        symlink(dir.path().join("big"), root.join("link")).unwrap();

        let link_len = fs::symlink_metadata(root.join("link")).unwrap().len();
        let total = usage(&root).unwrap();
        assert_eq!(total.inode_count, 2);
        assert_eq!(total.size, fs::metadata(&root).unwrap().len() + link_len);
    }

    #[test]
    fn test_usage_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(usage(dir.path().join("missing")).unwrap_err().is_not_found());
    }
}
