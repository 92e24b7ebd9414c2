use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "ArknightsLauncher";
const CONFIG_FILE: &str = "config.json";
const BACKUP_DIR: &str = "AccountBackups";
const LOGS_DIR: &str = "logs";

/// Name prefix of the vendor SDK directory; the suffix changes per install.
pub const LIVE_DIR_PREFIX: &str = "sdk_data_";

pub const HOME_ENV: &str = "ARK_LAUNCHER_HOME";
pub const SDK_DIR_ENV: &str = "ARK_LAUNCHER_SDK_DIR";

/// Every per-user location the launcher reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub backup_root: PathBuf,
    pub logs_dir: PathBuf,
    /// Parent of the vendor-owned `sdk_data_*` directory.
    pub live_parent: PathBuf,
}

impl Paths {
    pub fn new(config_dir: PathBuf, live_parent: PathBuf) -> Self {
        Self {
            config_file: config_dir.join(CONFIG_FILE),
            backup_root: config_dir.join(BACKUP_DIR),
            logs_dir: config_dir.join(LOGS_DIR),
            config_dir,
            live_parent,
        }
    }

    pub fn detect() -> Result<Self> {
        Ok(Self::new(config_dir()?, live_parent()?))
    }
}

pub fn config_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let base = dirs::data_local_dir().context("local data dir not available")?;
    Ok(base.join(APP_DIR))
}

pub fn live_parent() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(SDK_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("home dir not available")?;
    Ok(vendor_dir_under(&home))
}

fn vendor_dir_under(home: &Path) -> PathBuf {
    home.join("AppData")
        .join("LocalLow")
        .join("Hypergryph")
        .join("Arknights")
}
