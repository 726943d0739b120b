//! Recursive removal of a layer directory that tolerates concurrent mutation.
//!
//! Other runtimes and mount namespaces may unmount, mount or delete entries
//! inside a layer while it is being removed.  [`ensure_remove_all`] retries
//! around those races: an entry that vanished is forgiven once, and a busy
//! entry is unmounted and retried a bounded number of times.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use log::debug;
use rustix::io::Errno;

use crate::{
    error::{DriverError, Result},
    mount::{recursive_unmount, unmount},
};

const MAX_RETRY: usize = 100;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// A removal failure together with the entry that caused it.
#[derive(Debug, thiserror::Error)]
#[error("{path:?}: {source}")]
pub struct RemoveError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl RemoveError {
    fn at(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| RemoveError {
            path: path.to_path_buf(),
            source,
        }
    }

    fn into_driver_error(self) -> DriverError {
        DriverError::Teardown {
            path: self.path,
            source: self.source,
        }
    }
}

/// Removes `path` and everything below it without following symlinks.
///
/// Unlike [`fs::remove_dir_all`], the error names the entry that failed, and a missing `path`
/// is reported as `NotFound` rather than treated as success.
pub fn remove_all(path: &Path) -> std::result::Result<(), RemoveError> {
    let metadata = fs::symlink_metadata(path).map_err(RemoveError::at(path))?;
    if !metadata.is_dir() {
        return fs::remove_file(path).map_err(RemoveError::at(path));
    }

    for entry in fs::read_dir(path).map_err(RemoveError::at(path))? {
        let entry = entry.map_err(RemoveError::at(path))?;
        remove_all(&entry.path())?;
    }
    fs::remove_dir(path).map_err(RemoveError::at(path))
}

/// Removes `dir` and its contents, unmounting whatever gets in the way.
///
/// Everything mounted below `dir` is detached first on a best-effort basis.  Removal is then
/// retried as long as each failure is one of:
///
/// - an entry below `dir` vanished, the first time that entry does so;
/// - an entry is busy and can be unmounted, up to 100 times per entry, 100ms apart.
///
/// `dir` itself being absent is success.
pub fn ensure_remove_all(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if let Err(e) = recursive_unmount(dir) {
        debug!("recursive unmount of {dir:?} failed: {e}");
    }
    ensure_remove_all_with(dir, RETRY_DELAY, remove_all, |path| unmount(path))
}

fn ensure_remove_all_with(
    dir: &Path,
    delay: Duration,
    mut remove: impl FnMut(&Path) -> std::result::Result<(), RemoveError>,
    mut unmount: impl FnMut(&Path) -> Result<()>,
) -> Result<()> {
    let mut vanished: HashSet<PathBuf> = HashSet::new();
    let mut busy: HashMap<PathBuf, usize> = HashMap::new();

    loop {
        let err = match remove(dir) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if err.source.kind() == ErrorKind::NotFound {
            if vanished.contains(&err.path) {
                return Err(err.into_driver_error());
            }
            if err.path == dir {
                return Ok(());
            }
            vanished.insert(err.path);
            continue;
        }

        if Errno::from_io_error(&err.source) != Some(Errno::BUSY) {
            return Err(err.into_driver_error());
        }

        unmount(&err.path)?;
        let count = busy.entry(err.path.clone()).or_insert(0);
        if *count == MAX_RETRY {
            return Err(err.into_driver_error());
        }
        *count += 1;
        debug!("{:?} is busy, retrying removal of {dir:?}", err.path);
        sleep(delay);
    }
}
