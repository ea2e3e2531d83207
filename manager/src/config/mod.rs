pub mod manager;

pub use manager::ConfigManager;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{files, spawn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address of the admin API, also the base of the locker URL
    /// handed to spawned services.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root of the on-disk tree; installed instances live under
    /// `{locker_dir}/Me/{id}/`.
    #[serde(default = "default_locker_dir")]
    pub locker_dir: String,

    /// Directories scanned for service descriptors, relative to
    /// `locker_dir`.
    #[serde(default = "default_service_dirs")]
    pub service_dirs: Vec<String>,

    /// Seed for the monotonic suggested-port counter. When absent it
    /// is derived by prefixing the manager port with "1", the locker
    /// convention (port 8042 seeds 18042).
    #[serde(default)]
    pub service_port_base: Option<u32>,

    /// Deadline for the first stdout line of a spawned service.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8042
}

fn default_locker_dir() -> String {
    ".".to_string()
}

fn default_service_dirs() -> Vec<String> {
    vec![
        "Apps".to_string(),
        "Collections".to_string(),
        "Connectors".to_string(),
    ]
}

fn default_handshake_timeout() -> u64 {
    spawn::DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            locker_dir: default_locker_dir(),
            service_dirs: default_service_dirs(),
            service_port_base: None,
            handshake_timeout_seconds: default_handshake_timeout(),
        }
    }
}

impl Config {
    /// Base URL of this manager, sent to services as `lockerUrl`.
    pub fn locker_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn me_dir(&self) -> PathBuf {
        Path::new(&self.locker_dir).join(files::ME_DIR)
    }

    pub fn service_dir_paths(&self) -> Vec<PathBuf> {
        self.service_dirs
            .iter()
            .map(|d| Path::new(&self.locker_dir).join(d))
            .collect()
    }

    /// First value handed out by the suggested-port counter.
    pub fn service_port_seed(&self) -> u32 {
        self.service_port_base.unwrap_or_else(|| {
            format!("1{}", self.port)
                .parse()
                .unwrap_or(100_000 + self.port as u32)
        })
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}
