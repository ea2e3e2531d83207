//! Custom error types for the service manager
//!
//! Discovery and load failures are deliberately absent: malformed
//! descriptors and instance records are logged and skipped, never
//! surfaced (best-effort cataloging).

use std::fmt;

/// Main error type for the service manager
#[derive(Debug)]
pub enum ManagerError {
    /// Installation errors
    Install(InstallError),

    /// Subprocess lifecycle errors
    Spawn(SpawnError),

    /// Other errors with context
    Other(String),
}

/// Installation error variants
#[derive(Debug)]
pub enum InstallError {
    /// Install target absent from the available registry
    NotFound { src_dir: String },

    /// No auth provider installed or installable for the requirement
    DependencyUnresolved { src_dir: String, required: String },

    /// Instance directory or record could not be written
    Persist { id: String, reason: String },
}

/// Subprocess lifecycle error variants
#[derive(Debug)]
pub enum SpawnError {
    /// Operation on an id that is not installed
    UnknownService { id: String },

    /// Malformed or missing startup handshake
    Handshake { id: String, reason: String },
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::Install(e) => write!(f, "Install error: {}", e),
            ManagerError::Spawn(e) => write!(f, "Spawn error: {}", e),
            ManagerError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallError::NotFound { src_dir } => {
                write!(f, "No available service with source directory '{}'", src_dir)
            }
            InstallError::DependencyUnresolved { src_dir, required } => {
                write!(
                    f,
                    "Could not resolve auth dependency '{}' for '{}'",
                    required, src_dir
                )
            }
            InstallError::Persist { id, reason } => {
                write!(f, "Failed to persist instance '{}': {}", id, reason)
            }
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::UnknownService { id } => {
                write!(f, "Service '{}' is not installed", id)
            }
            SpawnError::Handshake { id, reason } => {
                write!(f, "Service '{}' failed its startup handshake: {}", id, reason)
            }
        }
    }
}

impl std::error::Error for ManagerError {}
impl std::error::Error for InstallError {}
impl std::error::Error for SpawnError {}

impl From<InstallError> for ManagerError {
    fn from(e: InstallError) -> Self {
        ManagerError::Install(e)
    }
}

impl From<SpawnError> for ManagerError {
    fn from(e: SpawnError) -> Self {
        ManagerError::Spawn(e)
    }
}
