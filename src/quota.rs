//! Quota groups: status probe, enable, per-subvolume limits, lookup and rescan.
//!
//! Nothing here caches kernel state except [`QuotaState`], which remembers
//! whether quotas are on for the lifetime of a driver.  Qgroup ids are always
//! looked up again because a subvolume may be replaced between calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use once_cell::sync::OnceCell;

use crate::{
    error::{DriverError, Result},
    ioctl::{
        self, open_dir, InoLookupArgs, QgroupLimitArgs, QuotaCtlArgs, SearchArgs,
        BTRFS_QGROUP_STATUS_KEY, BTRFS_QUOTA_CTL_ENABLE,
    },
};

/// Succeeds when quotas are enabled on the filesystem holding `path`.
///
/// Searches the quota tree for the qgroup status item; the item only exists
/// while quotas are on.  See `btrfs-progs` `qgroup.c` for the same probe.
pub fn qgroup_status(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let dir = open_dir(path)?;

    let mut args = SearchArgs::qgroup_status();
    ioctl::tree_search(&dir, &mut args).map_err(DriverError::ioctl("search qgroup", path))?;

    let header = args.first_header();
    if header.key_type != BTRFS_QGROUP_STATUS_KEY {
        return Err(DriverError::QgroupStatus {
            path: path.to_path_buf(),
            key_type: header.key_type,
        });
    }
    Ok(())
}

/// Turns quotas on for the filesystem holding `path`.
pub fn quota_enable(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let dir = open_dir(path)?;
    let mut args = QuotaCtlArgs {
        cmd: BTRFS_QUOTA_CTL_ENABLE,
        status: 0,
    };
    ioctl::quota_ctl(&dir, &mut args).map_err(DriverError::ioctl("enable btrfs quota", path))
}

/// Waits for a running quota rescan on the filesystem holding `path`.
pub fn quota_rescan_wait(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let dir = open_dir(path)?;
    ioctl::quota_rescan_wait(&dir).map_err(DriverError::ioctl("rescan btrfs quota", path))
}

/// Caps the referenced bytes of the subvolume at `path` to `size`.
pub fn limit_qgroup(path: impl AsRef<Path>, size: u64) -> Result<()> {
    let path = path.as_ref();
    let dir = open_dir(path)?;
    let mut args = QgroupLimitArgs::max_referenced(size);
    ioctl::qgroup_limit(&dir, &mut args).map_err(DriverError::ioctl("limit qgroup", path))
}

/// Resolves the qgroup id of the subvolume at `path`.
pub fn lookup_qgroup(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let dir = open_dir(path)?;

    let mut args = InoLookupArgs::subvolume_root();
    ioctl::ino_lookup(&dir, &mut args).map_err(DriverError::ioctl("lookup qgroup", path))?;

    if args.treeid == 0 {
        return Err(DriverError::InvalidQgroupId(path.to_path_buf()));
    }
    Ok(args.treeid)
}

/// Whether quotas are enabled under a storage root.
///
/// The kernel is probed at most once per `QuotaState`; concurrent callers
/// during that first probe wait for it and all see its result.  Enabling
/// quotas through this type flips the flag for the rest of its lifetime.
#[derive(Debug)]
pub struct QuotaState {
    home: PathBuf,
    probed: OnceCell<()>,
    enabled: AtomicBool,
}

impl QuotaState {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            probed: OnceCell::new(),
            enabled: AtomicBool::new(false),
        }
    }

    /// Quota status as last known; does not probe.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Probes the kernel for the quota status, once.
    pub fn update_status(&self) {
        self.update_status_with(|home| qgroup_status(home))
    }

    fn update_status_with(&self, probe: impl FnOnce(&Path) -> Result<()>) {
        self.probed.get_or_init(|| {
            if self.is_enabled() {
                return;
            }
            match probe(&self.home) {
                Ok(()) => self.enabled.store(true, Ordering::Release),
                Err(e) => debug!("btrfs quotas not enabled on {:?}: {e}", self.home),
            }
        });
    }

    /// Enables quotas unless they are already known to be on.
    pub fn enable(&self) -> Result<()> {
        self.enable_with(|home| qgroup_status(home), |home| quota_enable(home))
    }

    fn enable_with(
        &self,
        probe: impl FnOnce(&Path) -> Result<()>,
        enable: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<()> {
        self.update_status_with(probe);
        if self.is_enabled() {
            return Ok(());
        }
        enable(&self.home)?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Waits for quota accounting to settle; a no-op while quotas are off.
    pub fn rescan(&self) -> Result<()> {
        self.update_status();
        if !self.is_enabled() {
            return Ok(());
        }
        quota_rescan_wait(&self.home)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    use rustix::io::Errno;
    use similar_asserts::assert_eq;

    use super::*;

    fn disabled(path: &Path) -> Result<()> {
        Err(DriverError::QgroupStatus {
            path: path.to_path_buf(),
            key_type: 0,
        })
    }

    #[test]
    fn test_probe_runs_once() {
        let state = QuotaState::new("/var/lib/btrfs");
        let probes = AtomicUsize::new(0);
        for _ in 0..3 {
            state.update_status_with(|path| {
                probes.fetch_add(1, Ordering::SeqCst);
                disabled(path)
            });
        }
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert!(!state.is_enabled());
    }

    #[test]
    fn test_concurrent_probe_runs_once() {
        let state = Arc::new(QuotaState::new("/var/lib/btrfs"));
        let probes = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                let probes = Arc::clone(&probes);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    state.update_status_with(|_| {
                        probes.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok(())
                    });
                    state.is_enabled()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enable_is_idempotent() {
        let state = QuotaState::new("/var/lib/btrfs");
        let enables = AtomicUsize::new(0);
        let enable = |_: &Path| -> Result<()> {
            enables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        state.enable_with(disabled, enable).unwrap();
        state.enable_with(disabled, enable).unwrap();
        assert_eq!(enables.load(Ordering::SeqCst), 1);
        assert!(state.is_enabled());
    }

    #[test]
    fn test_enable_skipped_when_probe_succeeds() {
        let state = QuotaState::new("/var/lib/btrfs");
        state
            .enable_with(|_| Ok(()), |_| panic!("quotas already on"))
            .unwrap();
        assert!(state.is_enabled());
    }

    #[test]
    fn test_enable_failure_leaves_disabled() {
        let state = QuotaState::new("/var/lib/btrfs");
        let err = state
            .enable_with(disabled, |path| {
                Err(DriverError::ioctl("enable btrfs quota", path)(Errno::PERM))
            })
            .unwrap_err();
        assert!(matches!(err, DriverError::Ioctl { errno: Errno::PERM, .. }));
        assert!(!state.is_enabled());
    }

    #[test]
    fn test_rescan_without_quotas_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = QuotaState::new(dir.path());
        // not btrfs: the probe fails, so no rescan ioctl is issued
        state.rescan().unwrap();
        assert!(!state.is_enabled());
    }

    #[test]
    fn test_lookup_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(lookup_qgroup(dir.path().join("missing"))
            .unwrap_err()
            .is_not_found());
    }
}
