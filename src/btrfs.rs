//! The btrfs layer driver.
//!
//! Each layer is a subvolume at `<home>/subvolumes/<id>`; a layer with a parent
//! is a writable snapshot of the parent's subvolume.  A per-layer size limit is
//! enforced with a qgroup and persisted as a decimal byte count in
//! `<home>/quotas/<id>`, so it can be reapplied when quotas were switched off
//! and on again.
//!
//! ```text
//! <home>/
//!   subvolumes/
//!     <id>/          subvolume, mode 0555 when created empty
//!   quotas/
//!     <id>           "104857600"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{chown, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::{
    config::{parse_storage_opt, BtrfsOptions},
    driver::{CreateOpts, Driver, InitOptions, MountOpts},
    error::{DriverError, Result},
    fsmagic::is_btrfs,
    idtools::{mkdir_all_as, root_pair, IdMap},
    label::relabel,
    mount::{make_private, unmount},
    quota::{limit_qgroup, QuotaState},
    subvolume::{subvolume_create, subvolume_delete, subvolume_snapshot},
    teardown::ensure_remove_all,
    units::human_size,
    usage::{usage, DiskUsage},
};

const DEFAULT_PERMS: u32 = 0o555;
const SUBVOLUMES: &str = "subvolumes";
const QUOTAS: &str = "quotas";

/// Layer storage on btrfs subvolumes rooted at one directory.
#[derive(Debug)]
pub struct BtrfsDriver {
    home: PathBuf,
    uid_maps: Vec<IdMap>,
    gid_maps: Vec<IdMap>,
    options: BtrfsOptions,
    quota: QuotaState,
}

impl BtrfsDriver {
    /// Opens the driver over `home`, which must be on btrfs.
    ///
    /// `home` is created owned by the remapped root if missing, and made a private mount.
    /// Quotas are enabled right away when `btrfs.min_space` is configured.
    pub fn init(home: impl Into<PathBuf>, options: InitOptions) -> Result<Self> {
        let home = home.into();

        if !is_btrfs(&home)? {
            return Err(DriverError::NotBtrfs(home));
        }

        let (uid, gid) = root_pair(&options.uid_maps, &options.gid_maps)?;
        mkdir_all_as(&home, 0o700, uid, gid)?;
        make_private(&home)?;

        let parsed = BtrfsOptions::parse(&options.driver_options)?;

        let driver = BtrfsDriver {
            quota: QuotaState::new(&home),
            home,
            uid_maps: options.uid_maps,
            gid_maps: options.gid_maps,
            options: parsed,
        };

        if parsed.user_disk_quota {
            driver.quota.enable()?;
        }

        info!("btrfs driver initialized at {:?}", driver.home);
        Ok(driver)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Whether quotas are currently known to be on.
    pub fn quota_enabled(&self) -> bool {
        self.quota.is_enabled()
    }

    fn subvolumes_dir(&self) -> PathBuf {
        self.home.join(SUBVOLUMES)
    }

    fn quotas_dir(&self) -> PathBuf {
        self.home.join(QUOTAS)
    }

    fn subvolume_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.subvolumes_dir().join(layer_name(id)?))
    }

    fn quota_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.quotas_dir().join(layer_name(id)?))
    }

    fn root_pair(&self) -> Result<(u32, u32)> {
        root_pair(&self.uid_maps, &self.gid_maps)
    }

    /// Validates `size` against the configured minimum and applies it to the subvolume at `dir`.
    fn set_storage_size(&self, dir: &Path, size: u64) -> Result<()> {
        if size == 0 {
            return Err(DriverError::ZeroSize);
        }
        if self.options.min_space > 0 && size < self.options.min_space {
            return Err(DriverError::SizeBelowMinimum {
                min: self.options.min_space,
            });
        }

        self.quota.enable()?;
        limit_qgroup(dir, size)
    }

    /// The persisted size limit for `id`, if one was recorded and is readable.
    fn recorded_size(&self, id: &str) -> Result<Option<u64>> {
        let content = match fs::read_to_string(self.quota_path(id)?) {
            Ok(content) => content,
            Err(_) => return Ok(None),
        };
        Ok(content.trim().parse().ok())
    }

    /// The recorded size limit for `id` if it still satisfies the configured minimum.
    fn size_to_reapply(&self, id: &str) -> Result<Option<u64>> {
        Ok(self
            .recorded_size(id)?
            .filter(|size| *size >= self.options.min_space))
    }

    fn write_quota_record(&self, id: &str, size: u64, uid: u32, gid: u32) -> Result<()> {
        mkdir_all_as(self.quotas_dir(), 0o700, uid, gid)?;
        let path = self.quota_path(id)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)
            .map_err(DriverError::path(&path))?;
        write!(file, "{size}").map_err(DriverError::path(&path))
    }
}

/// Checks that a layer id can be used as a single path component.
fn layer_name(id: &str) -> Result<&str> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\0']) {
        return Err(DriverError::InvalidName(id.to_string()));
    }
    Ok(id)
}

fn require_dir(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(DriverError::path(path))?;
    if !metadata.is_dir() {
        return Err(DriverError::NotADirectory(path.to_path_buf()));
    }
    Ok(())
}

impl Driver for BtrfsDriver {
    fn name(&self) -> &'static str {
        "btrfs"
    }

    fn create(&self, id: &str, parent: Option<&str>, opts: &CreateOpts) -> Result<()> {
        let subvolumes = self.subvolumes_dir();
        let name = layer_name(id)?;
        let dir = subvolumes.join(name);
        let (uid, gid) = self.root_pair()?;
        mkdir_all_as(&subvolumes, 0o700, uid, gid)?;

        match parent.filter(|p| !p.is_empty()) {
            None => {
                subvolume_create(&subvolumes, name)?;
                fs::set_permissions(&dir, fs::Permissions::from_mode(DEFAULT_PERMS))
                    .map_err(DriverError::path(&dir))?;
            }
            Some(parent) => {
                let parent_dir = self.subvolume_path(parent)?;
                require_dir(&parent_dir)?;
                subvolume_snapshot(&parent_dir, &subvolumes, name)?;
            }
        }

        if let Some(size) = parse_storage_opt(&opts.storage_opt)? {
            self.set_storage_size(&dir, size)?;
            self.write_quota_record(id, size, uid, gid)?;
        }

        if uid != 0 || gid != 0 {
            chown(&dir, Some(uid), Some(gid)).map_err(DriverError::path(&dir))?;
        }

        debug!("created layer {id} (parent {parent:?})");
        relabel(&dir, &opts.mount_label)
    }

    fn create_read_write(&self, id: &str, parent: Option<&str>, opts: &CreateOpts) -> Result<()> {
        self.create(id, parent, opts)
    }

    fn create_from_template(
        &self,
        id: &str,
        template: &str,
        _parent: Option<&str>,
        opts: &CreateOpts,
    ) -> Result<()> {
        self.create(id, Some(template), opts)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let dir = self.subvolume_path(id)?;
        fs::metadata(&dir).map_err(DriverError::path(&dir))?;

        let quota_file = self.quota_path(id)?;
        match fs::remove_file(&quota_file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DriverError::path(&quota_file)(e)),
        }

        self.quota.update_status();

        if let Err(e) = subvolume_delete(self.subvolumes_dir(), id, self.quota.is_enabled()) {
            if self.quota.is_enabled() {
                return Err(e);
            }
            // unprivileged users may still rmdir their own subvolumes
            debug!("subvolume destroy of {dir:?} failed, falling back to removal: {e}");
        }

        ensure_remove_all(&dir)?;
        self.quota.rescan()?;
        debug!("removed layer {id}");
        Ok(())
    }

    fn get(&self, id: &str, opts: &MountOpts) -> Result<PathBuf> {
        let dir = self.subvolume_path(id)?;

        match opts.options.as_slice() {
            [] => {}
            [only] if only == "ro" => {}
            _ => return Err(DriverError::MountOptionsUnsupported),
        }

        require_dir(&dir)?;

        if let Some(size) = self.size_to_reapply(id)? {
            self.quota.enable()?;
            limit_qgroup(&dir, size)?;
        }

        Ok(dir)
    }

    fn put(&self, _id: &str) -> Result<()> {
        // get() mounts nothing
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.subvolume_path(id)
            .map(|dir| fs::metadata(dir).is_ok())
            .unwrap_or(false)
    }

    fn metadata(&self, _id: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    fn read_write_disk_usage(&self, id: &str) -> Result<DiskUsage> {
        usage(self.subvolume_path(id)?)
    }

    fn additional_image_stores(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn status(&self) -> Vec<(String, String)> {
        self.quota.update_status();
        let quotas = if self.quota.is_enabled() {
            "enabled"
        } else {
            "disabled"
        };
        let mut status = vec![("Quotas".to_string(), quotas.to_string())];
        if self.options.min_space > 0 {
            status.push((
                "Minimum Space".to_string(),
                human_size(self.options.min_space as f64),
            ));
        }
        status
    }

    fn cleanup(&self) -> Result<()> {
        unmount(&self.home)
    }
}

impl fmt::Display for BtrfsDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_layer_name() {
        assert_eq!(layer_name("3f2a9c").unwrap(), "3f2a9c");
        for bad in ["", ".", "..", "a/b", "../etc", "nul\0"] {
            assert!(
                matches!(layer_name(bad), Err(DriverError::InvalidName(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn test_init_rejects_non_btrfs() {
        let dir = tempfile::tempdir().unwrap();
        if is_btrfs(dir.path()).unwrap() {
            return;
        }
        let err = BtrfsDriver::init(dir.path(), InitOptions::default()).unwrap_err();
        assert!(matches!(err, DriverError::NotBtrfs(ref p) if p == dir.path()));
        assert!(err
            .to_string()
            .starts_with("prerequisites for driver not satisfied"));
    }

    #[test]
    fn test_require_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();
        require_dir(dir.path()).unwrap();
        assert!(matches!(
            require_dir(&file),
            Err(DriverError::NotADirectory(_))
        ));
        assert!(require_dir(&dir.path().join("missing"))
            .unwrap_err()
            .is_not_found());
    }

    fn unopened_driver(home: &Path, min_space: u64) -> BtrfsDriver {
        BtrfsDriver {
            home: home.to_path_buf(),
            uid_maps: Vec::new(),
            gid_maps: Vec::new(),
            options: BtrfsOptions {
                min_space,
                user_disk_quota: min_space > 0,
            },
            quota: QuotaState::new(home),
        }
    }

    #[test]
    fn test_recorded_size() {
        let dir = tempfile::tempdir().unwrap();
        let driver = unopened_driver(dir.path(), 0);
        let quotas = dir.path().join(QUOTAS);
        fs::create_dir(&quotas).unwrap();
        fs::write(quotas.join("padded"), " 104857600\n").unwrap();
        fs::write(quotas.join("junk"), "junk").unwrap();

        assert_eq!(driver.recorded_size("padded").unwrap(), Some(104857600));
        assert_eq!(driver.recorded_size("junk").unwrap(), None);
        assert_eq!(driver.recorded_size("missing").unwrap(), None);
    }

    #[test]
    fn test_record_below_minimum_is_not_reapplied() {
        let dir = tempfile::tempdir().unwrap();
        let quotas = dir.path().join(QUOTAS);
        fs::create_dir(&quotas).unwrap();
        fs::write(quotas.join("small"), "1048576").unwrap();
        fs::write(quotas.join("large"), "104857600").unwrap();

        let driver = unopened_driver(dir.path(), 10 * 1024 * 1024);
        assert_eq!(driver.size_to_reapply("small").unwrap(), None);
        assert_eq!(driver.size_to_reapply("large").unwrap(), Some(104857600));
        assert_eq!(driver.size_to_reapply("missing").unwrap(), None);

        let driver = unopened_driver(dir.path(), 0);
        assert_eq!(driver.size_to_reapply("small").unwrap(), Some(1048576));
    }
}
