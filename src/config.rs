//! Driver options and `storage.conf` parsing.
//!
//! The driver itself only understands `key=value` option strings, the form a
//! layer store passes through.  [`StorageConfig`] reads the TOML file used by
//! containers-storage and converts its btrfs section into those strings.
//!
//! # Configuration Structure
//!
//! ```toml
//! [storage]
//! driver = "btrfs"
//! graphroot = "/var/lib/containers/storage"
//! runroot = "/run/containers/storage"
//!
//! [storage.options]
//! remap-uids = "0:100000:65536"
//! remap-gids = "0:100000:65536"
//!
//! [storage.options.btrfs]
//! min_space = "10M"
//! size = "1G"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::{
    error::{DriverError, Result},
    idtools::IdMap,
    units::ram_in_bytes,
};

/// Options accepted at driver initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BtrfsOptions {
    /// Smallest per-layer quota accepted, in bytes; zero means no minimum.
    pub min_space: u64,
    /// Set when `btrfs.min_space` was given; quotas are enabled at init.
    pub user_disk_quota: bool,
}

impl BtrfsOptions {
    /// Parses `key=value` driver options.  Keys are case-insensitive.
    pub fn parse<S: AsRef<str>>(options: &[S]) -> Result<Self> {
        let mut parsed = BtrfsOptions::default();
        for option in options {
            let option = option.as_ref();
            let (key, value) = parse_key_value(option)?;
            let key = key.to_lowercase();
            match key.as_str() {
                "btrfs.min_space" => {
                    parsed.min_space = ram_in_bytes(value)?;
                    parsed.user_disk_quota = true;
                }
                "btrfs.mountopt" => return Err(DriverError::MountOptionsUnsupported),
                _ => return Err(DriverError::UnknownOption(key)),
            }
        }
        Ok(parsed)
    }
}

fn parse_key_value(option: &str) -> Result<(&str, &str)> {
    match option.split_once('=') {
        Some((key, value)) => Ok((key.trim(), value.trim())),
        None => Err(DriverError::InvalidOption(option.to_string())),
    }
}

/// Extracts the per-layer quota from creation options.  Only `size` is recognized.
pub fn parse_storage_opt(storage_opt: &HashMap<String, String>) -> Result<Option<u64>> {
    let mut size = None;
    for (key, value) in storage_opt {
        let key = key.to_lowercase();
        match key.as_str() {
            "size" => size = Some(ram_in_bytes(value)?),
            _ => return Err(DriverError::UnknownOption(key)),
        }
    }
    Ok(size)
}

/// A containers-storage `storage.conf`, reduced to what this driver uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub storage: StorageSection,
}

/// The `[storage]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSection {
    /// Storage driver name; must be `btrfs` or empty for this crate.
    #[serde(default)]
    pub driver: String,

    /// Primary storage root.
    #[serde(default)]
    pub graphroot: PathBuf,

    /// Runtime root for transient data.
    #[serde(default)]
    pub runroot: PathBuf,

    #[serde(default)]
    pub options: StorageOptions,
}

/// The `[storage.options]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageOptions {
    #[serde(default, rename = "remap-uids")]
    pub remap_uids: Option<String>,

    #[serde(default, rename = "remap-gids")]
    pub remap_gids: Option<String>,

    #[serde(default)]
    pub btrfs: BtrfsSection,
}

/// The `[storage.options.btrfs]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BtrfsSection {
    /// Minimum per-layer quota, e.g. `"10M"`.
    #[serde(default)]
    pub min_space: Option<String>,

    /// Default per-layer quota applied when a layer is created without one.
    #[serde(default)]
    pub size: Option<String>,
}

impl StorageConfig {
    /// Parse storage configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Driver option strings equivalent to the btrfs section.
    pub fn driver_options(&self) -> Vec<String> {
        self.storage
            .options
            .btrfs
            .min_space
            .iter()
            .map(|min| format!("btrfs.min_space={min}"))
            .collect()
    }

    /// Creation options every layer gets unless it overrides them.
    pub fn default_storage_opt(&self) -> HashMap<String, String> {
        self.storage
            .options
            .btrfs
            .size
            .iter()
            .map(|size| ("size".to_string(), size.clone()))
            .collect()
    }

    /// UID and GID maps from `remap-uids` and `remap-gids`.
    pub fn id_maps(&self) -> Result<(Vec<IdMap>, Vec<IdMap>)> {
        let parse = |list: &Option<String>| match list {
            Some(list) => IdMap::parse_list(list),
            None => Ok(Vec::new()),
        };
        Ok((
            parse(&self.storage.options.remap_uids)?,
            parse(&self.storage.options.remap_gids)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_driver_options() {
        let empty: [&str; 0] = [];
        assert_eq!(BtrfsOptions::parse(&empty).unwrap(), BtrfsOptions::default());

        let options = BtrfsOptions::parse(&["BTRFS.Min_Space = 10M"]).unwrap();
        assert_eq!(options.min_space, 10 * 1024 * 1024);
        assert!(options.user_disk_quota);
    }

    #[test]
    fn test_parse_driver_options_rejected() {
        assert!(matches!(
            BtrfsOptions::parse(&["btrfs.mountopt=nodatacow"]),
            Err(DriverError::MountOptionsUnsupported)
        ));
        assert!(matches!(
            BtrfsOptions::parse(&["Overlay.MountOpt=nodev"]),
            Err(DriverError::UnknownOption(key)) if key == "overlay.mountopt"
        ));
        assert!(matches!(
            BtrfsOptions::parse(&["btrfs.min_space"]),
            Err(DriverError::InvalidOption(_))
        ));
        assert!(matches!(
            BtrfsOptions::parse(&["btrfs.min_space=lots"]),
            Err(DriverError::InvalidSize(_))
        ));
    }

    #[test]
    fn test_parse_storage_opt() {
        let mut opts = HashMap::new();
        assert_eq!(parse_storage_opt(&opts).unwrap(), None);

        opts.insert("Size".to_string(), "100M".to_string());
        assert_eq!(parse_storage_opt(&opts).unwrap(), Some(104857600));

        opts.insert("Inodes".to_string(), "1000".to_string());
        assert!(matches!(
            parse_storage_opt(&opts),
            Err(DriverError::UnknownOption(key)) if key == "inodes"
        ));
    }

    #[test]
    fn test_parse_storage_conf() {
        let config_str = r#"
[storage]
driver = "btrfs"
graphroot = "/var/lib/containers/storage"
runroot = "/run/containers/storage"

[storage.options]
remap-uids = "0:100000:65536"
remap-gids = "0:200000:65536"

[storage.options.btrfs]
min_space = "10M"
size = "1G"
"#;
        let config = StorageConfig::from_toml(config_str).unwrap();
        assert_eq!(config.storage.driver, "btrfs");
        assert_eq!(
            config.storage.graphroot,
            PathBuf::from("/var/lib/containers/storage")
        );
        assert_eq!(config.driver_options(), vec!["btrfs.min_space=10M"]);
        assert_eq!(config.default_storage_opt()["size"], "1G");

        let (uids, gids) = config.id_maps().unwrap();
        assert_eq!(uids[0].host_id, 100000);
        assert_eq!(gids[0].host_id, 200000);
    }

    #[test]
    fn test_parse_minimal_storage_conf() {
        let config = StorageConfig::from_toml("[storage]\ndriver = \"btrfs\"\n").unwrap();
        assert!(config.driver_options().is_empty());
        assert!(config.default_storage_opt().is_empty());
        let (uids, gids) = config.id_maps().unwrap();
        assert!(uids.is_empty() && gids.is_empty());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            StorageConfig::from_toml("[storage"),
            Err(DriverError::Config(_))
        ));
    }
}
