//! Error types for the btrfs layer driver.
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias for
//! `Result<T, DriverError>`.
//!
//! # Error Categories
//!
//! - **Prerequisites**: [`NotBtrfs`], [`UnknownOption`], [`InvalidOption`],
//!   [`MountOptionsUnsupported`]
//! - **Validation**: [`InvalidSize`], [`ZeroSize`], [`SizeBelowMinimum`],
//!   [`InvalidName`], [`NotADirectory`], [`UnmappedRoot`]
//! - **Kernel calls**: [`Ioctl`], [`Mount`], [`InvalidQgroupId`], [`QgroupStatus`]
//! - **Tree walking and teardown**: [`SubvolumeWalk`], [`ChildSubvolume`],
//!   [`Teardown`]
//! - **System errors**: [`Path`], [`Io`], [`Config`]
//!
//! [`NotBtrfs`]: DriverError::NotBtrfs
//! [`UnknownOption`]: DriverError::UnknownOption
//! [`InvalidOption`]: DriverError::InvalidOption
//! [`MountOptionsUnsupported`]: DriverError::MountOptionsUnsupported
//! [`InvalidSize`]: DriverError::InvalidSize
//! [`ZeroSize`]: DriverError::ZeroSize
//! [`SizeBelowMinimum`]: DriverError::SizeBelowMinimum
//! [`InvalidName`]: DriverError::InvalidName
//! [`NotADirectory`]: DriverError::NotADirectory
//! [`UnmappedRoot`]: DriverError::UnmappedRoot
//! [`Ioctl`]: DriverError::Ioctl
//! [`Mount`]: DriverError::Mount
//! [`InvalidQgroupId`]: DriverError::InvalidQgroupId
//! [`QgroupStatus`]: DriverError::QgroupStatus
//! [`SubvolumeWalk`]: DriverError::SubvolumeWalk
//! [`ChildSubvolume`]: DriverError::ChildSubvolume
//! [`Teardown`]: DriverError::Teardown
//! [`Path`]: DriverError::Path
//! [`Io`]: DriverError::Io
//! [`Config`]: DriverError::Config

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rustix::io::Errno;

use crate::units::human_size;

/// Result type alias for operations that may return a DriverError.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Error types for driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The storage root does not live on a btrfs filesystem.
    #[error("prerequisites for driver not satisfied: {0:?} is not on a btrfs filesystem")]
    NotBtrfs(PathBuf),

    /// A driver or storage option key is not recognized.
    #[error("unknown option {0}")]
    UnknownOption(String),

    /// A driver option was not of the form `key=value`.
    #[error("unable to parse key/value option: {0}")]
    InvalidOption(String),

    /// Mount options were requested; this driver takes none.
    #[error("btrfs driver does not support mount options")]
    MountOptionsUnsupported,

    /// A size string could not be parsed.
    #[error("invalid size: {0:?}")]
    InvalidSize(String),

    /// A zero size was requested for a layer quota.
    #[error("btrfs: invalid storage size: {}", human_size(0.0))]
    ZeroSize,

    /// The requested layer size is below the configured minimum.
    #[error("btrfs: storage size cannot be less than {}", human_size(*min as f64))]
    SizeBelowMinimum {
        /// Configured minimum in bytes.
        min: u64,
    },

    /// A subvolume name does not fit the kernel name buffer.
    #[error("invalid subvolume name {0:?}")]
    InvalidName(String),

    /// A layer path exists but is not a directory.
    #[error("{0:?}: not a directory")]
    NotADirectory(PathBuf),

    /// The UID/GID maps do not cover container root.
    #[error("container ID 0 cannot be mapped to a host ID")]
    UnmappedRoot,

    /// A btrfs ioctl returned an error number.
    #[error("failed to {op} for {path:?}: {errno}")]
    Ioctl {
        /// The operation that was attempted.
        op: &'static str,
        /// The path the operation targeted.
        path: PathBuf,
        /// Raw error number returned by the kernel.
        #[source]
        errno: Errno,
    },

    /// A mount, unmount or propagation change failed.
    #[error("failed to {op} {path:?}: {errno}")]
    Mount {
        /// The operation that was attempted.
        op: &'static str,
        /// The mount point.
        path: PathBuf,
        /// Raw error number returned by the kernel.
        #[source]
        errno: Errno,
    },

    /// Inode lookup returned tree id 0.
    #[error("invalid qgroup id for {0:?}: 0")]
    InvalidQgroupId(PathBuf),

    /// The quota tree search did not return a status item.
    #[error("invalid qgroup search header type for {path:?}: {key_type}")]
    QgroupStatus {
        /// Storage root that was probed.
        path: PathBuf,
        /// Key type found in the first search header.
        key_type: u32,
    },

    /// Walking a subvolume for nested subvolumes failed.
    #[error("error walking subvolumes at {path:?}")]
    SubvolumeWalk {
        /// Path whose listing or stat failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A nested subvolume could not be destroyed.
    #[error("failed to destroy btrfs child subvolume ({child:?}) of parent ({parent:?})")]
    ChildSubvolume {
        /// The nested subvolume.
        child: PathBuf,
        /// The subvolume being deleted.
        parent: PathBuf,
        /// Why the nested deletion failed.
        #[source]
        source: Box<DriverError>,
    },

    /// Recursive removal of a layer directory failed.
    #[error("error while removing {path:?}")]
    Teardown {
        /// The directory being removed.
        path: PathBuf,
        /// Underlying error, carrying the offending path.
        #[source]
        source: std::io::Error,
    },

    /// I/O error on a specific path.
    #[error("{path:?}: {source}")]
    Path {
        /// The path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// storage.conf could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl DriverError {
    /// Returns a closure wrapping an errno into [`DriverError::Ioctl`], for use with `map_err`.
    pub(crate) fn ioctl(op: &'static str, path: impl AsRef<Path>) -> impl FnOnce(Errno) -> Self {
        let path = path.as_ref().to_path_buf();
        move |errno| DriverError::Ioctl { op, path, errno }
    }

    /// Returns a closure wrapping an errno into [`DriverError::Mount`], for use with `map_err`.
    pub(crate) fn mount(op: &'static str, path: impl AsRef<Path>) -> impl FnOnce(Errno) -> Self {
        let path = path.as_ref().to_path_buf();
        move |errno| DriverError::Mount { op, path, errno }
    }

    /// Returns a closure attaching `path` to an I/O error, for use with `map_err`.
    pub(crate) fn path(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| DriverError::Path { path, source }
    }

    /// Converts a directory walk error into [`DriverError::Path`], naming the entry that failed
    /// or `root` when the walk error carries no path.
    pub(crate) fn walk(root: &Path) -> impl FnOnce(walkdir::Error) -> Self + '_ {
        move |err| DriverError::Path {
            path: err.path().unwrap_or(root).to_path_buf(),
            source: err.into(),
        }
    }

    /// Whether this error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            DriverError::Path { source, .. }
            | DriverError::Io(source)
            | DriverError::SubvolumeWalk { source, .. }
            | DriverError::Teardown { source, .. } => source.kind() == ErrorKind::NotFound,
            DriverError::Ioctl { errno, .. } | DriverError::Mount { errno, .. } => {
                *errno == Errno::NOENT
            }
            _ => false,
        }
    }
}

/// Whether a walk error is an entry below the walk root that disappeared mid-walk.
pub(crate) fn vanished_during_walk(err: &walkdir::Error) -> bool {
    err.depth() > 0 && err.io_error().map(std::io::Error::kind) == Some(ErrorKind::NotFound)
}
