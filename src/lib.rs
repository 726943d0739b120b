//! Copy-on-write container layer storage on btrfs.
//!
//! Layers are btrfs subvolumes; a child layer is a writable snapshot of its
//! parent, and per-layer size limits are enforced with quota groups.  The
//! entry point is [`BtrfsDriver`], which implements the [`Driver`] interface
//! a layer store consumes.
//!
//! Unsafe code is confined to [`ioctl`].

#![deny(unsafe_code)]

pub mod btrfs;
pub mod config;
pub mod driver;
pub mod error;
pub mod fsmagic;
pub mod idtools;
pub mod ioctl;
pub mod label;
pub mod mount;
pub mod quota;
pub mod subvolume;
pub mod teardown;
pub mod units;
pub mod usage;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use btrfs::BtrfsDriver;
pub use driver::{CreateOpts, Driver, InitOptions, MountOpts};
pub use error::{DriverError, Result};
pub use usage::DiskUsage;
