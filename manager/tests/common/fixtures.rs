use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

use locker_manager::config::{Config, ConfigManager};
use locker_manager::installer::Installer;
use locker_manager::registry::{Registry, SharedRegistry};
use locker_manager::shutdown::ShutdownCoordinator;
use locker_manager::supervisor::ProcessSupervisor;

/// A temporary locker directory tree with service source directories
/// and a `Me` directory for installed instances.
pub struct LockerTree {
    root: TempDir,
}

impl LockerTree {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("create temp locker tree"),
        }
    }

    pub fn locker_dir(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn me_dir(&self) -> PathBuf {
        self.root.path().join("Me")
    }

    /// Write a descriptor file `{name}.{ext}` under `rel_dir`,
    /// returning the source directory it identifies.
    pub fn write_descriptor(&self, rel_dir: &str, name: &str, ext: &str, body: &str) -> String {
        let dir = self.root.path().join(rel_dir);
        fs::create_dir_all(&dir).expect("create service source dir");
        fs::write(dir.join(format!("{}.{}", name, ext)), body).expect("write descriptor");
        dir.to_string_lossy().into_owned()
    }

    /// Write a descriptor plus a `run.sh` launched through `sh`; the
    /// script runs with the source directory as its working dir.
    pub fn write_service_with_script(
        &self,
        rel_dir: &str,
        name: &str,
        ext: &str,
        provides: &[&str],
        script: &str,
    ) -> String {
        let provides_json = provides
            .iter()
            .map(|p| format!("\"{}\"", p))
            .collect::<Vec<_>>()
            .join(", ");
        let descriptor = format!(
            r#"{{"title": "{name}", "provides": [{provides_json}], "run": "sh run.sh"}}"#
        );
        let src_dir = self.write_descriptor(rel_dir, name, ext, &descriptor);
        fs::write(PathBuf::from(&src_dir).join("run.sh"), script).expect("write run script");
        src_dir
    }

    pub fn config(&self) -> Config {
        Config {
            host: "localhost".to_string(),
            port: 8042,
            locker_dir: self.locker_dir().to_string_lossy().into_owned(),
            service_dirs: vec![
                "Apps".to_string(),
                "Collections".to_string(),
                "Connectors".to_string(),
            ],
            service_port_base: Some(20000),
            handshake_timeout_seconds: 3,
        }
    }
}

impl Default for LockerTree {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully wired manager stack over a temporary locker tree.
pub struct TestStack {
    pub tree: LockerTree,
    pub config: Arc<Config>,
    pub registry: SharedRegistry,
    pub installer: Installer,
    pub supervisor: Arc<ProcessSupervisor>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl TestStack {
    /// Scan the tree's service directories and wire up the
    /// components the way `lockerd` does at startup.
    pub async fn new(tree: LockerTree) -> Self {
        Self::with_config(tree, None).await
    }

    pub async fn with_config(tree: LockerTree, config: Option<Config>) -> Self {
        let config_manager =
            ConfigManager::from_config(config.unwrap_or_else(|| tree.config()));
        let config = config_manager.current();

        let mut registry = Registry::new(config.me_dir());
        for dir in config.service_dir_paths() {
            registry.scan_directory(&dir).await;
        }
        registry
            .load_installed()
            .await
            .expect("load installed instances");
        let registry: SharedRegistry = Arc::new(Mutex::new(registry));

        let shutdown = Arc::new(ShutdownCoordinator::new());
        let supervisor = Arc::new(ProcessSupervisor::new(
            registry.clone(),
            config.clone(),
            shutdown.clone(),
        ));
        let installer = Installer::new(registry.clone(), config.clone());

        Self {
            tree,
            config,
            registry,
            installer,
            supervisor,
            shutdown,
        }
    }

    pub async fn available_count(&self) -> usize {
        self.registry.lock().await.available.len()
    }

    pub async fn installed_count(&self) -> usize {
        self.registry.lock().await.installed.len()
    }
}

/// Handshake script: reads the startup request, confirms `port`, then
/// stays alive until killed.
pub fn handshake_script(port: u32) -> String {
    format!("read line\necho '{{\"port\": {}}}'\nsleep 30\n", port)
}

/// Script that records each launch in `launches.log` (in the source
/// directory) before handshaking.
pub fn counting_handshake_script(port: u32) -> String {
    format!(
        "echo launched >> launches.log\nread line\necho '{{\"port\": {}}}'\nsleep 30\n",
        port
    )
}

pub fn launch_count(src_dir: &str) -> usize {
    match fs::read_to_string(PathBuf::from(src_dir).join("launches.log")) {
        Ok(content) => content.lines().count(),
        Err(_) => 0,
    }
}
