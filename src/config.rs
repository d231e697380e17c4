//! Daemon configuration.
//!
//! Values come from an optional YAML file with command-line flags folded
//! on top; uid and gid default to the invoking user.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

/// Fully resolved configuration the daemon runs with.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the store database file.
    pub database: PathBuf,
    /// Where to attach the filesystem.
    pub mountpoint: PathBuf,
    /// Log destination; stderr when unset.
    pub logfile: Option<PathBuf>,
    /// Owner applied to every inode this filesystem creates.
    pub uid: u32,
    pub gid: u32,
}

/// Command-line values layered over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub mountpoint: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database: Option<PathBuf>,
    mountpoint: Option<PathBuf>,
    logfile: Option<PathBuf>,
    uid: Option<u32>,
    gid: Option<u32>,
}

const DEFAULT_CONFIG_FILE: &str = "config.yaml";
const DEFAULT_DATABASE: &str = "ledgerfs.db";

impl Config {
    /// Read the config file (mandatory when given explicitly, best-effort
    /// for the default location) and fold the overrides on top.
    pub fn resolve(file: Option<&Path>, overrides: Overrides) -> anyhow::Result<Config> {
        let from_file = match file {
            Some(path) => Self::read_file(path)
                .with_context(|| format!("could not load config file {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::read_file(Path::new(DEFAULT_CONFIG_FILE)).with_context(|| {
                    format!("could not load config file {DEFAULT_CONFIG_FILE}")
                })?
            }
            None => FileConfig::default(),
        };

        let Some(mountpoint) = overrides.mountpoint.or(from_file.mountpoint) else {
            bail!("no mountpoint given (flag --mountpoint or config key `mountpoint`)");
        };

        Ok(Config {
            database: overrides
                .database
                .or(from_file.database)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)),
            mountpoint,
            logfile: overrides.logfile.or(from_file.logfile),
            uid: overrides
                .uid
                .or(from_file.uid)
                .unwrap_or_else(|| nix::unistd::getuid().as_raw()),
            gid: overrides
                .gid
                .or(from_file.gid)
                .unwrap_or_else(|| nix::unistd::getgid().as_raw()),
        })
    }

    fn read_file(path: &Path) -> anyhow::Result<FileConfig> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}
