//! UID/GID mappings and ownership-aware directory creation.

use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::{chown, DirBuilderExt, PermissionsExt};
use std::path::Path;

use crate::error::{DriverError, Result};

/// A contiguous range of container IDs mapped onto host IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    /// Parses a comma-separated list of `container:host:size` triples, e.g. `"0:100000:65536"`.
    pub fn parse_list(list: &str) -> Result<Vec<IdMap>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|triple| {
                let invalid = || DriverError::InvalidOption(triple.to_string());
                let mut parts = triple.split(':').map(|n| n.parse::<u32>());
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(Ok(container_id)), Some(Ok(host_id)), Some(Ok(size)), None) => {
                        Ok(IdMap {
                            container_id,
                            host_id,
                            size,
                        })
                    }
                    _ => Err(invalid()),
                }
            })
            .collect()
    }

    fn to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

fn to_host(id: u32, maps: &[IdMap]) -> Result<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    maps.iter()
        .find_map(|m| m.to_host(id))
        .ok_or(DriverError::UnmappedRoot)
}

/// Host UID and GID that container root maps to.  Empty maps mean no remapping.
pub fn root_pair(uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Result<(u32, u32)> {
    Ok((to_host(0, uid_maps)?, to_host(0, gid_maps)?))
}

/// Creates `path` and any missing parents with `mode`, owned by `uid`:`gid`.
///
/// Parents that already exist are left alone; the final directory is re-owned even if it
/// already existed.
pub fn mkdir_all_as(path: impl AsRef<Path>, mode: u32, uid: u32, gid: u32) -> Result<()> {
    let path = path.as_ref();

    let mut missing = Vec::new();
    for ancestor in path.ancestors() {
        match fs::symlink_metadata(ancestor) {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => return Err(DriverError::NotADirectory(ancestor.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::NotFound => missing.push(ancestor),
            Err(e) => return Err(DriverError::path(ancestor)(e)),
        }
    }

    for dir in missing.into_iter().rev() {
        match DirBuilder::new().mode(mode).create(dir) {
            Ok(()) => {
                // the umask applies to DirBuilder
                fs::set_permissions(dir, fs::Permissions::from_mode(mode))
                    .map_err(DriverError::path(dir))?;
                chown(dir, Some(uid), Some(gid)).map_err(DriverError::path(dir))?;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(DriverError::path(dir)(e)),
        }
    }

    chown(path, Some(uid), Some(gid)).map_err(DriverError::path(path))
}
