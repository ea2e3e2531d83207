pub mod handlers;
pub mod server;

pub use server::start_web_server;

use std::sync::Arc;

use crate::config::Config;
use crate::installer::Installer;
use crate::registry::SharedRegistry;
use crate::supervisor::ProcessSupervisor;

// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SharedRegistry,
    pub installer: Arc<Installer>,
    pub supervisor: Arc<ProcessSupervisor>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: SharedRegistry,
        installer: Arc<Installer>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            config,
            registry,
            installer,
            supervisor,
        }
    }
}
