//! Mount table queries and the few mount operations the driver needs.
//!
//! The storage root is made a private mount at init so that layer mounts made
//! below it by other tools do not propagate back to the host, and teardown
//! detaches anything still mounted inside a layer before removing it.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use rustix::{
    io::Errno,
    mount::{mount_bind, mount_change, unmount as unmount_raw, MountPropagationFlags, UnmountFlags},
};

use crate::error::{DriverError, Result};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub id: u32,
    pub parent: u32,
    /// Root of the mount within its filesystem.
    pub root: PathBuf,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub source: String,
}

/// Lists the mounts visible to this process.
pub fn mountpoints() -> Result<Vec<MountInfo>> {
    let content = fs::read_to_string(MOUNTINFO).map_err(DriverError::path(MOUNTINFO))?;
    Ok(parse_mountinfo(&content))
}

/// Parses mountinfo content; malformed lines are skipped.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content.lines().filter_map(parse_line).collect()
}

// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
fn parse_line(line: &str) -> Option<MountInfo> {
    let (head, tail) = line.split_once(" - ")?;
    let mut fields = head.split(' ');
    let id = fields.next()?.parse().ok()?;
    let parent = fields.next()?.parse().ok()?;
    let _devno = fields.next()?;
    let root = unescape(fields.next()?);
    let mountpoint = unescape(fields.next()?);

    let mut fields = tail.split(' ');
    let fstype = fields.next()?.to_string();
    let source = fields.next().map(unescape).unwrap_or_default();

    Some(MountInfo {
        id,
        parent,
        root: root.into(),
        mountpoint: mountpoint.into(),
        fstype,
        source,
    })
}

/// Decodes the `\NNN` octal escapes the kernel uses for space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = i + 3 < bytes.len()
            && bytes[i + 1..i + 4]
                .iter()
                .all(|b| (b'0'..=b'7').contains(b));
        if bytes[i] == b'\\' && octal {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(code) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `path` is itself a mount point.
pub fn is_mountpoint(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    Ok(mountpoints()?.iter().any(|m| m.mountpoint == path))
}

/// Ensures `path` is a mount point with private propagation.
///
/// A directory that is not yet a mount point is bind-mounted onto itself first.
pub fn make_private(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !is_mountpoint(path)? {
        mount_bind(path, path).map_err(DriverError::mount("bind mount", path))?;
    }
    mount_change(path, MountPropagationFlags::PRIVATE)
        .map_err(DriverError::mount("make private", path))
}

/// Lazily detaches the mount at `path`.  A path that is not mounted is not an error.
pub fn unmount(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match unmount_raw(path, UnmountFlags::DETACH) {
        Ok(()) | Err(Errno::INVAL) => Ok(()),
        Err(errno) => Err(DriverError::mount("unmount", path)(errno)),
    }
}

/// Unmounts every mount at or below `dir`, deepest first.
///
/// Failures below `dir` are logged and skipped; only a failure to unmount `dir` itself is
/// returned.
pub fn recursive_unmount(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    let mut targets: Vec<PathBuf> = mountpoints()?
        .into_iter()
        .map(|m| m.mountpoint)
        .filter(|mountpoint| mountpoint.starts_with(dir))
        .collect();
    sort_deepest_first(&mut targets);

    for target in &targets {
        match unmount(target) {
            Ok(()) => debug!("unmounted {target:?}"),
            Err(e) if target == dir => return Err(e),
            Err(e) => debug!("failed to unmount {target:?}: {e}"),
        }
    }
    Ok(())
}

fn sort_deepest_first(paths: &mut [PathBuf]) {
    paths.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
}
