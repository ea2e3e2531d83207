//! Central repository for timeouts, limits and file names used across
//! the manager.

use std::time::Duration;

/// Subprocess startup constants
pub mod spawn {
    /// Default deadline for the first stdout line of a spawned
    /// service, overridable through `handshake_timeout_seconds`
    pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
}

/// On-disk layout constants
pub mod files {
    /// Per-instance metadata record inside the instance directory
    pub const INSTANCE_RECORD: &str = "me.json";

    /// Subdirectory of the locker tree holding installed instances
    pub const ME_DIR: &str = "Me";
}

/// Shutdown constants
pub mod shutdown {
    use super::Duration;

    /// How long the binary waits for the shutdown barrier before
    /// giving up and exiting anyway
    pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
}
