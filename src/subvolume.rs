//! Subvolume primitives: create, snapshot, test and recursive delete.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::{debug, error};
use walkdir::WalkDir;

use crate::{
    error::{vanished_during_walk, DriverError, Result},
    ioctl::{self, open_dir, QgroupCreateArgs, VolArgs, VolArgsV2, BTRFS_FIRST_FREE_OBJECTID},
    quota::lookup_qgroup,
};

/// Creates an empty subvolume `name` inside `parent`.
pub fn subvolume_create(parent: impl AsRef<Path>, name: impl AsRef<OsStr>) -> Result<()> {
    let parent = parent.as_ref();
    let name = name.as_ref();
    let dir = open_dir(parent)?;
    ioctl::subvol_create(&dir, VolArgs::with_name(name)?)
        .map_err(DriverError::ioctl("create btrfs subvolume", parent.join(name)))
}

/// Creates `name` inside `dest` as a writable copy-on-write snapshot of the subvolume at `src`.
pub fn subvolume_snapshot(
    src: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    name: impl AsRef<OsStr>,
) -> Result<()> {
    let dest = dest.as_ref();
    let name = name.as_ref();
    let src_dir = open_dir(src)?;
    let dest_dir = open_dir(dest)?;
    ioctl::snap_create_v2(&dest_dir, VolArgsV2::snapshot_of(&src_dir, name)?)
        .map_err(DriverError::ioctl("create btrfs snapshot", dest.join(name)))
}

/// Whether `path` is the root of a subvolume rather than an ordinary directory.
pub fn is_subvolume(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let metadata = fs::symlink_metadata(path).map_err(DriverError::path(path))?;
    Ok(metadata.ino() == BTRFS_FIRST_FREE_OBJECTID)
}

/// Destroys the subvolume `name` inside `dirpath`, including every subvolume nested in it.
///
/// Nested subvolumes are found by walking the tree and destroyed depth first, since the kernel
/// refuses to destroy a subvolume that still contains others.  When `quota_enabled` is set the
/// qgroup of the subvolume is destroyed too, on a best-effort basis.
pub fn subvolume_delete(
    dirpath: impl AsRef<Path>,
    name: impl AsRef<OsStr>,
    quota_enabled: bool,
) -> Result<()> {
    let dirpath = dirpath.as_ref();
    let name = name.as_ref();
    let dir = open_dir(dirpath)?;
    let full_path = dirpath.join(name);

    delete_nested_subvolumes(&full_path, quota_enabled)?;

    if quota_enabled {
        match lookup_qgroup(&full_path) {
            Ok(qgroupid) => {
                let args = QgroupCreateArgs {
                    create: 0,
                    qgroupid,
                };
                if let Err(errno) = ioctl::qgroup_create(&dir, args) {
                    error!("Failed to delete btrfs qgroup {qgroupid} for {full_path:?}: {errno}");
                }
            }
            Err(e) => error!("Failed to lookup btrfs qgroup for {full_path:?}: {e}"),
        }
    }

    debug!("destroying subvolume {full_path:?}");
    ioctl::snap_destroy(&dir, VolArgs::with_name(name)?)
        .map_err(DriverError::ioctl("destroy btrfs snapshot", &full_path))
}

/// Walks `root` looking for nested subvolumes and deletes them.
///
/// Entries that vanish mid-walk are skipped: destroying a nested subvolume removes its whole
/// subtree.  Only `root` itself going missing is an error.
fn delete_nested_subvolumes(root: &Path, quota_enabled: bool) -> Result<()> {
    let walk_error = |err: walkdir::Error| DriverError::SubvolumeWalk {
        path: err.path().unwrap_or(root).to_path_buf(),
        source: err.into(),
    };

    let mut entries = WalkDir::new(root).min_depth(1).into_iter();
    while let Some(entry) = entries.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if vanished_during_walk(&err) => continue,
            Err(err) => return Err(walk_error(err)),
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        // readdir reports the subvolume's tree id here, only stat gives the root inode
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) if vanished_during_walk(&err) => continue,
            Err(err) => return Err(walk_error(err)),
        };
        if metadata.ino() != BTRFS_FIRST_FREE_OBJECTID {
            continue;
        }

        let child = entry.path();
        let parent = child.parent().unwrap_or(root);
        subvolume_delete(parent, entry.file_name(), quota_enabled).map_err(|e| {
            DriverError::ChildSubvolume {
                child: child.to_path_buf(),
                parent: root.to_path_buf(),
                source: Box::new(e),
            }
        })?;
        entries.skip_current_dir();
    }

    Ok(())
}
