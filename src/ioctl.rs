//! Low-level btrfs ioctl interfaces.
//!
//! The request structures here mirror `/usr/include/linux/btrfs.h` byte for
//! byte.  They are built zeroed in ordinary memory, handed to the kernel for a
//! single call and dropped; no pointer into them outlives the ioctl.
//!
//! Kernel unions are flattened to their largest member where this crate only
//! ever uses one arm of them (subvolume names in `btrfs_ioctl_vol_args_v2`,
//! the unused qgroup-inherit arm).

#![allow(unsafe_code)]

use std::ffi::OsStr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rustix::fs::{open, Mode, OFlags};
use rustix::ioctl::{ioctl, opcode, NoArg, Opcode, Setter, Updater};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::{DriverError, Result};

const BTRFS_IOCTL_MAGIC: u8 = 0x94;

/// Object id of the root directory of every subvolume; also the inode number
/// a subvolume root reports through `stat`.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

/// Tree holding qgroup items.
pub const BTRFS_QUOTA_TREE_OBJECTID: u64 = 8;

/// Key type of the single qgroup status item present while quotas are enabled.
pub const BTRFS_QGROUP_STATUS_KEY: u32 = 240;

/// `btrfs_ioctl_quota_ctl_args.cmd` value that turns quotas on.
pub const BTRFS_QUOTA_CTL_ENABLE: u64 = 1;

/// `btrfs_qgroup_limit.flags` bit: `max_rfer` is valid.
pub const BTRFS_QGROUP_LIMIT_MAX_RFER: u64 = 1 << 0;

const BTRFS_PATH_NAME_MAX: usize = 4087;
const BTRFS_SUBVOL_NAME_MAX: usize = 4039;
const BTRFS_INO_LOOKUP_PATH_MAX: usize = 4080;
const BTRFS_SEARCH_ARGS_BUFSIZE: usize = 4096 - size_of::<SearchKey>();

/// Number of items requested by the qgroup status probe.
const QGROUP_STATUS_NR_ITEMS: u32 = 4096;

/// `struct btrfs_ioctl_vol_args`: subvolume create and destroy.
#[derive(FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct VolArgs {
    pub fd: i64,
    pub name: [u8; BTRFS_PATH_NAME_MAX + 1],
}

impl VolArgs {
    /// Zeroed arguments carrying `name`.
    pub fn with_name(name: impl AsRef<OsStr>) -> Result<Self> {
        let mut args = Self::new_zeroed();
        copy_name(&mut args.name, name.as_ref())?;
        Ok(args)
    }
}

/// `struct btrfs_ioctl_vol_args_v2`: snapshot creation.
#[derive(FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct VolArgsV2 {
    pub fd: i64,
    pub transid: u64,
    pub flags: u64,
    pub unused: [u64; 4],
    pub name: [u8; BTRFS_SUBVOL_NAME_MAX + 1],
}

impl VolArgsV2 {
    /// Arguments asking for a writable snapshot of `source` named `name`.
    pub fn snapshot_of(source: impl AsFd, name: impl AsRef<OsStr>) -> Result<Self> {
        let mut args = Self::new_zeroed();
        args.fd = source.as_fd().as_raw_fd().into();
        copy_name(&mut args.name, name.as_ref())?;
        Ok(args)
    }
}

/// `struct btrfs_ioctl_quota_ctl_args`
#[derive(Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct QuotaCtlArgs {
    pub cmd: u64,
    pub status: u64,
}

/// `struct btrfs_ioctl_qgroup_create_args`; `create == 0` destroys the qgroup.
#[derive(Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct QgroupCreateArgs {
    pub create: u64,
    pub qgroupid: u64,
}

/// `struct btrfs_qgroup_limit`
#[derive(Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct QgroupLimit {
    pub flags: u64,
    pub max_rfer: u64,
    pub max_excl: u64,
    pub rsv_rfer: u64,
    pub rsv_excl: u64,
}

/// `struct btrfs_ioctl_qgroup_limit_args`; `qgroupid == 0` targets the subvolume of the fd.
#[derive(Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct QgroupLimitArgs {
    pub qgroupid: u64,
    pub lim: QgroupLimit,
}

impl QgroupLimitArgs {
    /// Limit the referenced bytes of the fd's own subvolume to `size`.
    pub fn max_referenced(size: u64) -> Self {
        let mut args = Self::new_zeroed();
        args.lim.flags = BTRFS_QGROUP_LIMIT_MAX_RFER;
        args.lim.max_rfer = size;
        args
    }
}

/// `struct btrfs_ioctl_search_key`
#[derive(Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    pub unused: u32,
    pub unused1: u64,
    pub unused2: u64,
    pub unused3: u64,
    pub unused4: u64,
}

/// `struct btrfs_ioctl_search_args`: a key followed by the result buffer.
#[derive(FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SearchArgs {
    pub key: SearchKey,
    pub buf: [u8; BTRFS_SEARCH_ARGS_BUFSIZE],
}

impl SearchArgs {
    /// A search of the quota tree restricted to the qgroup status item.
    pub fn qgroup_status() -> Self {
        let mut args = Self::new_zeroed();
        args.key.tree_id = BTRFS_QUOTA_TREE_OBJECTID;
        args.key.min_type = BTRFS_QGROUP_STATUS_KEY;
        args.key.max_type = BTRFS_QGROUP_STATUS_KEY;
        args.key.max_objectid = u64::MAX;
        args.key.max_offset = u64::MAX;
        args.key.max_transid = u64::MAX;
        args.key.nr_items = QGROUP_STATUS_NR_ITEMS;
        args
    }

    /// The header of the first item the kernel placed in the result buffer.
    pub fn first_header(&self) -> SearchHeader {
        // buf is always larger than a header, so this cannot fail
        SearchHeader::read_from_prefix(&self.buf)
            .map(|(header, _)| header)
            .unwrap_or_else(|_| SearchHeader::new_zeroed())
    }
}

/// `struct btrfs_ioctl_search_header`, as laid out at the start of `SearchArgs::buf`.
#[derive(Debug, Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub key_type: u32,
    pub len: u32,
}

/// `struct btrfs_ioctl_ino_lookup_args`
#[derive(FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct InoLookupArgs {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; BTRFS_INO_LOOKUP_PATH_MAX],
}

impl InoLookupArgs {
    /// Look up the subvolume root of the fd, which yields its tree id.
    pub fn subvolume_root() -> Self {
        let mut args = Self::new_zeroed();
        args.objectid = BTRFS_FIRST_FREE_OBJECTID;
        args
    }
}

/// Opens `path` as a directory to issue ioctls against.  The descriptor closes on drop.
pub fn open_dir(path: impl AsRef<Path>) -> Result<OwnedFd> {
    let path = path.as_ref();
    open(
        path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|errno| DriverError::path(path)(errno.into()))
}

/// Copy `name` into a fixed kernel buffer, keeping the final byte as NUL.
fn copy_name(buf: &mut [u8], name: &OsStr) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= buf.len() || bytes.contains(&0) || bytes.contains(&b'/')
    {
        return Err(DriverError::InvalidName(name.to_string_lossy().into_owned()));
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

// #define BTRFS_IOC_SUBVOL_CREATE _IOW(BTRFS_IOCTL_MAGIC, 14, struct btrfs_ioctl_vol_args)
const BTRFS_IOC_SUBVOL_CREATE: Opcode = opcode::write::<VolArgs>(BTRFS_IOCTL_MAGIC, 14);
// #define BTRFS_IOC_SNAP_DESTROY _IOW(BTRFS_IOCTL_MAGIC, 15, struct btrfs_ioctl_vol_args)
const BTRFS_IOC_SNAP_DESTROY: Opcode = opcode::write::<VolArgs>(BTRFS_IOCTL_MAGIC, 15);
// #define BTRFS_IOC_TREE_SEARCH _IOWR(BTRFS_IOCTL_MAGIC, 17, struct btrfs_ioctl_search_args)
const BTRFS_IOC_TREE_SEARCH: Opcode = opcode::read_write::<SearchArgs>(BTRFS_IOCTL_MAGIC, 17);
// #define BTRFS_IOC_INO_LOOKUP _IOWR(BTRFS_IOCTL_MAGIC, 18, struct btrfs_ioctl_ino_lookup_args)
const BTRFS_IOC_INO_LOOKUP: Opcode = opcode::read_write::<InoLookupArgs>(BTRFS_IOCTL_MAGIC, 18);
// #define BTRFS_IOC_SNAP_CREATE_V2 _IOW(BTRFS_IOCTL_MAGIC, 23, struct btrfs_ioctl_vol_args_v2)
const BTRFS_IOC_SNAP_CREATE_V2: Opcode = opcode::write::<VolArgsV2>(BTRFS_IOCTL_MAGIC, 23);
// #define BTRFS_IOC_QUOTA_CTL _IOWR(BTRFS_IOCTL_MAGIC, 40, struct btrfs_ioctl_quota_ctl_args)
const BTRFS_IOC_QUOTA_CTL: Opcode = opcode::read_write::<QuotaCtlArgs>(BTRFS_IOCTL_MAGIC, 40);
// #define BTRFS_IOC_QGROUP_CREATE _IOW(BTRFS_IOCTL_MAGIC, 42, struct btrfs_ioctl_qgroup_create_args)
const BTRFS_IOC_QGROUP_CREATE: Opcode = opcode::write::<QgroupCreateArgs>(BTRFS_IOCTL_MAGIC, 42);
// #define BTRFS_IOC_QGROUP_LIMIT _IOR(BTRFS_IOCTL_MAGIC, 43, struct btrfs_ioctl_qgroup_limit_args)
const BTRFS_IOC_QGROUP_LIMIT: Opcode = opcode::read::<QgroupLimitArgs>(BTRFS_IOCTL_MAGIC, 43);
// #define BTRFS_IOC_QUOTA_RESCAN_WAIT _IO(BTRFS_IOCTL_MAGIC, 46)
const BTRFS_IOC_QUOTA_RESCAN_WAIT: Opcode = opcode::none(BTRFS_IOCTL_MAGIC, 46);

/// `BTRFS_IOC_SUBVOL_CREATE` against the parent directory `fd`.
pub fn subvol_create(fd: impl AsFd, args: VolArgs) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, Setter::<{ BTRFS_IOC_SUBVOL_CREATE }, VolArgs>::new(args)) }
}

/// `BTRFS_IOC_SNAP_CREATE_V2` against the destination directory `fd`.
pub fn snap_create_v2(fd: impl AsFd, args: VolArgsV2) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, Setter::<{ BTRFS_IOC_SNAP_CREATE_V2 }, VolArgsV2>::new(args)) }
}

/// `BTRFS_IOC_SNAP_DESTROY` against the parent directory `fd`.
pub fn snap_destroy(fd: impl AsFd, args: VolArgs) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, Setter::<{ BTRFS_IOC_SNAP_DESTROY }, VolArgs>::new(args)) }
}

/// `BTRFS_IOC_QUOTA_CTL`
pub fn quota_ctl(fd: impl AsFd, args: &mut QuotaCtlArgs) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, Updater::<{ BTRFS_IOC_QUOTA_CTL }, QuotaCtlArgs>::new(args)) }
}

/// `BTRFS_IOC_QUOTA_RESCAN_WAIT`: blocks until any running rescan finishes.
pub fn quota_rescan_wait(fd: impl AsFd) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, NoArg::<{ BTRFS_IOC_QUOTA_RESCAN_WAIT }>::new()) }
}

/// `BTRFS_IOC_QGROUP_CREATE`
pub fn qgroup_create(fd: impl AsFd, args: QgroupCreateArgs) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, Setter::<{ BTRFS_IOC_QGROUP_CREATE }, QgroupCreateArgs>::new(args)) }
}

/// `BTRFS_IOC_QGROUP_LIMIT`
///
/// Declared `_IOR` by the kernel even though it only reads the argument.
pub fn qgroup_limit(fd: impl AsFd, args: &mut QgroupLimitArgs) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, Updater::<{ BTRFS_IOC_QGROUP_LIMIT }, QgroupLimitArgs>::new(args)) }
}

/// `BTRFS_IOC_TREE_SEARCH`; results land in `args.buf` and `args.key.nr_items`.
pub fn tree_search(fd: impl AsFd, args: &mut SearchArgs) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, Updater::<{ BTRFS_IOC_TREE_SEARCH }, SearchArgs>::new(args)) }
}

/// `BTRFS_IOC_INO_LOOKUP`; fills `args.treeid`.
pub fn ino_lookup(fd: impl AsFd, args: &mut InoLookupArgs) -> rustix::io::Result<()> {
    unsafe { ioctl(fd, Updater::<{ BTRFS_IOC_INO_LOOKUP }, InoLookupArgs>::new(args)) }
}

#[cfg(test)]
mod tests {
    use rustix::io::Errno;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<VolArgs>(), 4096);
        assert_eq!(size_of::<VolArgsV2>(), 4096);
        assert_eq!(size_of::<InoLookupArgs>(), 4096);
        assert_eq!(size_of::<SearchArgs>(), 4096);
        assert_eq!(size_of::<SearchKey>(), 104);
        assert_eq!(size_of::<SearchHeader>(), 32);
        assert_eq!(size_of::<QuotaCtlArgs>(), 16);
        assert_eq!(size_of::<QgroupCreateArgs>(), 16);
        assert_eq!(size_of::<QgroupLimitArgs>(), 48);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_opcodes() {
        assert_eq!(BTRFS_IOC_SUBVOL_CREATE as u32, 0x5000940e);
        assert_eq!(BTRFS_IOC_SNAP_DESTROY as u32, 0x5000940f);
        assert_eq!(BTRFS_IOC_SNAP_CREATE_V2 as u32, 0x50009417);
        assert_eq!(BTRFS_IOC_QUOTA_CTL as u32, 0xc0109428);
        assert_eq!(BTRFS_IOC_QUOTA_RESCAN_WAIT as u32, 0x942e);
    }

    #[test]
    fn test_name_copy() {
        let args = VolArgs::with_name("layer").unwrap();
        assert_eq!(&args.name[..6], b"layer\0");
        assert_eq!(args.fd, 0);

        let long = "x".repeat(BTRFS_PATH_NAME_MAX + 1);
        assert!(matches!(VolArgs::with_name(&long), Err(DriverError::InvalidName(_))));
        assert!(VolArgs::with_name("x".repeat(BTRFS_PATH_NAME_MAX)).is_ok());
        assert!(matches!(VolArgs::with_name(""), Err(DriverError::InvalidName(_))));
        assert!(matches!(VolArgs::with_name("a/b"), Err(DriverError::InvalidName(_))));
    }

    #[test]
    fn test_snapshot_args_carry_source_fd() {
        let dir = tempfile::tempdir().unwrap();
        let src = std::fs::File::open(dir.path()).unwrap();
        let args = VolArgsV2::snapshot_of(&src, "child").unwrap();
        assert_eq!(args.fd, i64::from(src.as_raw_fd()));
        assert_eq!(&args.name[..6], b"child\0");
        assert!(matches!(
            VolArgsV2::snapshot_of(&src, "y".repeat(BTRFS_SUBVOL_NAME_MAX + 1)),
            Err(DriverError::InvalidName(_))
        ));
    }

    #[test]
    fn test_qgroup_status_search_key() {
        let args = SearchArgs::qgroup_status();
        assert_eq!(args.key.tree_id, BTRFS_QUOTA_TREE_OBJECTID);
        assert_eq!(args.key.min_type, BTRFS_QGROUP_STATUS_KEY);
        assert_eq!(args.key.max_type, BTRFS_QGROUP_STATUS_KEY);
        assert_eq!(args.key.min_objectid, 0);
        assert_eq!(args.key.max_objectid, u64::MAX);
        assert_eq!(args.key.nr_items, 4096);
        assert_eq!(args.first_header().key_type, 0);
    }

    #[test]
    fn test_first_header_parses_buffer() {
        let mut args = SearchArgs::qgroup_status();
        let header = SearchHeader {
            transid: 7,
            objectid: 0,
            offset: 0,
            key_type: BTRFS_QGROUP_STATUS_KEY,
            len: 40,
        };
        args.buf[..size_of::<SearchHeader>()].copy_from_slice(header.as_bytes());
        let parsed = args.first_header();
        assert_eq!(parsed.key_type, BTRFS_QGROUP_STATUS_KEY);
        assert_eq!(parsed.transid, 7);
        assert_eq!(parsed.len, 40);
    }

    #[test]
    fn test_limit_args() {
        let args = QgroupLimitArgs::max_referenced(104857600);
        assert_eq!(args.qgroupid, 0);
        assert_eq!(args.lim.flags, BTRFS_QGROUP_LIMIT_MAX_RFER);
        assert_eq!(args.lim.max_rfer, 104857600);
        assert_eq!(args.lim.max_excl, 0);
    }

    #[test_with::path(/dev/shm)]
    #[test]
    fn test_subvol_create_wrong_fs() {
        let dir = tempfile::tempdir_in("/dev/shm").unwrap();
        let fd = std::fs::File::open(dir.path()).unwrap();
        let err = subvol_create(&fd, VolArgs::with_name("layer").unwrap()).unwrap_err();
        assert_eq!(err, Errno::NOTTY);
    }
}
