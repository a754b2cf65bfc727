//! Configuration management for capsuled.
//!
//! Loads settings from /etc/capsuled/config.toml or uses defaults.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/capsuled/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root under which capsules are mounted. The canonical mount point
    /// of package `name` is `<capsule_root>/name`, versioned instances
    /// live at `<capsule_root>/name@version`.
    #[serde(default = "default_capsule_root")]
    pub capsule_root: PathBuf,

    /// Persistent daemon state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// One JSON record per staged session.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Incoming images, one subdirectory per submitted session.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Trusted public keys for image manifests.
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    /// Unix socket the RPC server binds.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Boot checkpoint markers maintained by the init system.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Kernel block-device metadata root.
    #[serde(default = "default_sys_block_dir")]
    pub sys_block_dir: PathBuf,

    /// Device node root.
    #[serde(default = "default_dev_dir")]
    pub dev_dir: PathBuf,

    /// Live mount table.
    #[serde(default = "default_mounts_path")]
    pub mounts_path: PathBuf,
}

fn default_capsule_root() -> PathBuf {
    PathBuf::from("/capsule")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/capsuled")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("/var/lib/capsuled/sessions")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/capsuled/staging")
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("/etc/capsuled/keys.d")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/capsuled/capsuled.sock")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/var/lib/capsuled/checkpoint")
}

fn default_sys_block_dir() -> PathBuf {
    PathBuf::from("/sys/block")
}

fn default_dev_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_mounts_path() -> PathBuf {
    PathBuf::from("/proc/mounts")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capsule_root: default_capsule_root(),
            state_dir: default_state_dir(),
            sessions_dir: default_sessions_dir(),
            staging_dir: default_staging_dir(),
            keys_dir: default_keys_dir(),
            socket_path: default_socket_path(),
            checkpoint_dir: default_checkpoint_dir(),
            sys_block_dir: default_sys_block_dir(),
            dev_dir: default_dev_dir(),
            mounts_path: default_mounts_path(),
        }
    }
}

impl Config {
    /// Version-qualified mount point for one instance.
    pub fn version_mount_point(&self, name: &str, version: u64) -> PathBuf {
        self.capsule_root.join(format!("{name}@{version}"))
    }

    /// Canonical (version-less) mount point of the active instance.
    pub fn canonical_mount_point(&self, name: &str) -> PathBuf {
        self.capsule_root.join(name)
    }

    /// Staging directory scanned for one session's candidate image.
    pub fn session_staging_dir(&self, session_id: u64) -> PathBuf {
        self.staging_dir.join(format!("session_{session_id}"))
    }
}

/// Load configuration, falling back to defaults when the file is absent
/// or unparseable.
pub fn load_config() -> Result<Config> {
    load_config_from(Path::new(CONFIG_PATH))
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) => {
                warn!("Failed to parse {}: {}. Using defaults", path.display(), e);
                Ok(Config::default())
            }
        },
        Err(e) => {
            warn!("Failed to read {}: {}. Using defaults", path.display(), e);
            Ok(Config::default())
        }
    }
}
