//! The layer-driver interface consumed by a layer store.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::{error::Result, idtools::IdMap, usage::DiskUsage};

/// Options for creating a layer.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    /// SELinux label applied to the new layer; empty for none.
    pub mount_label: String,
    /// Per-layer options such as `size`.
    pub storage_opt: HashMap<String, String>,
}

/// Options for resolving a layer's path.
#[derive(Debug, Clone, Default)]
pub struct MountOpts {
    pub mount_label: String,
    pub options: Vec<String>,
}

/// Options for initializing a driver over a storage root.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    /// `key=value` driver options, see [`crate::config::BtrfsOptions`].
    pub driver_options: Vec<String>,
}

/// A copy-on-write layer storage backend.
///
/// Layers are identified by opaque string ids.  A layer created with a parent starts as a
/// copy of that parent; lineage is not tracked afterwards.
pub trait Driver {
    /// Short driver name, e.g. `btrfs`.
    fn name(&self) -> &'static str;

    /// Creates layer `id`, empty when `parent` is `None`, otherwise a copy of `parent`.
    fn create(&self, id: &str, parent: Option<&str>, opts: &CreateOpts) -> Result<()>;

    /// Creates a layer intended as a container's writable top layer.
    fn create_read_write(&self, id: &str, parent: Option<&str>, opts: &CreateOpts) -> Result<()>;

    /// Creates a layer with the same contents as `template`.
    fn create_from_template(
        &self,
        id: &str,
        template: &str,
        parent: Option<&str>,
        opts: &CreateOpts,
    ) -> Result<()>;

    /// Destroys layer `id` and everything inside it.
    fn remove(&self, id: &str) -> Result<()>;

    /// Returns the directory holding layer `id`'s contents.
    fn get(&self, id: &str, opts: &MountOpts) -> Result<PathBuf>;

    /// Releases whatever [`Driver::get`] acquired.
    fn put(&self, id: &str) -> Result<()>;

    fn exists(&self, id: &str) -> bool;

    /// Driver-specific key/value metadata for layer `id`.
    fn metadata(&self, id: &str) -> Result<HashMap<String, String>>;

    /// Space used by layer `id`'s writable contents.
    fn read_write_disk_usage(&self, id: &str) -> Result<DiskUsage>;

    /// Read-only stores searched for images besides the primary one.
    fn additional_image_stores(&self) -> Vec<PathBuf>;

    /// Human-readable key/value pairs describing the driver state.
    fn status(&self) -> Vec<(String, String)>;

    /// Releases driver-wide resources.
    fn cleanup(&self) -> Result<()>;
}
