use std::{collections::HashMap, path::PathBuf, process::ExitCode};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use cstor_btrfs::{
    config::StorageConfig, BtrfsDriver, CreateOpts, Driver, InitOptions, MountOpts,
};

const DEFAULT_HOME: &str = "/var/lib/containers/storage/btrfs";

/// btrfsctl
#[derive(Debug, Parser)]
#[clap(name = "btrfsctl", version)]
pub struct App {
    /// Storage root; defaults to `<graphroot>/btrfs` from the config file
    #[clap(long)]
    home: Option<PathBuf>,

    /// containers-storage configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Driver option, e.g. btrfs.min_space=10M (repeatable)
    #[clap(long = "storage-opt", value_name = "KEY=VALUE")]
    storage_opt: Vec<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates a layer, optionally as a snapshot of a parent layer
    Create {
        id: String,
        #[clap(long)]
        parent: Option<String>,
        /// Size limit for the layer, e.g. 100M
        #[clap(long)]
        size: Option<String>,
        /// SELinux label for the layer contents
        #[clap(long, default_value = "")]
        label: String,
    },
    /// Removes a layer and all subvolumes inside it
    Remove { id: String },
    /// Prints the directory holding a layer's contents
    Get {
        id: String,
        #[clap(long)]
        ro: bool,
    },
    Put { id: String },
    /// Exits with status 1 if the layer does not exist
    Exists { id: String },
    /// Prints the disk usage of a layer
    Usage { id: String },
    Status,
    /// Unmounts the storage root
    Cleanup,
}

fn load_config(path: Option<&PathBuf>) -> Result<StorageConfig> {
    let Some(path) = path else {
        return Ok(StorageConfig::default());
    };
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    StorageConfig::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> Result<ExitCode> {
    env_logger::init();

    let args = App::parse();

    let config = load_config(args.config.as_ref())?;
    if !config.storage.driver.is_empty() && config.storage.driver != "btrfs" {
        bail!("configured storage driver is {:?}, not btrfs", config.storage.driver);
    }

    let home = match (&args.home, config.storage.graphroot.as_os_str().is_empty()) {
        (Some(home), _) => home.clone(),
        (None, false) => config.storage.graphroot.join("btrfs"),
        (None, true) => PathBuf::from(DEFAULT_HOME),
    };

    let (uid_maps, gid_maps) = config.id_maps()?;
    let mut driver_options = config.driver_options();
    driver_options.extend(args.storage_opt.iter().cloned());

    let driver = BtrfsDriver::init(
        &home,
        InitOptions {
            uid_maps,
            gid_maps,
            driver_options,
        },
    )
    .with_context(|| format!("initializing btrfs driver at {}", home.display()))?;

    match args.cmd {
        Command::Create {
            ref id,
            ref parent,
            ref size,
            ref label,
        } => {
            let mut storage_opt: HashMap<String, String> = config.default_storage_opt();
            if let Some(size) = size {
                storage_opt.insert("size".to_string(), size.clone());
            }
            let opts = CreateOpts {
                mount_label: label.clone(),
                storage_opt,
            };
            driver
                .create(id, parent.as_deref(), &opts)
                .with_context(|| format!("creating layer {id}"))?;
        }
        Command::Remove { ref id } => {
            driver
                .remove(id)
                .with_context(|| format!("removing layer {id}"))?;
        }
        Command::Get { ref id, ro } => {
            let opts = MountOpts {
                options: if ro { vec!["ro".to_string()] } else { vec![] },
                ..Default::default()
            };
            let dir = driver.get(id, &opts)?;
            println!("{}", dir.display());
        }
        Command::Put { ref id } => {
            driver.put(id)?;
        }
        Command::Exists { ref id } => {
            if !driver.exists(id) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Usage { ref id } => {
            let usage = driver.read_write_disk_usage(id)?;
            println!("size {}", usage.size);
            println!("inodes {}", usage.inode_count);
        }
        Command::Status => {
            println!("Driver: {driver}");
            for (key, value) in driver.status() {
                println!("{key}: {value}");
            }
        }
        Command::Cleanup => {
            driver.cleanup()?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
