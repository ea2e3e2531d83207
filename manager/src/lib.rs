pub mod config;
pub mod constants;
pub mod errors;
pub mod installer;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
pub mod web;

// Re-export commonly used types
pub use config::{Config, ConfigManager};
pub use errors::{InstallError, ManagerError, SpawnError};
pub use installer::Installer;
pub use registry::{InstalledService, Registry, ServiceDescriptor, ServiceType, SharedRegistry};
pub use shutdown::ShutdownCoordinator;
pub use supervisor::ProcessSupervisor;
