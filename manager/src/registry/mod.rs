//! In-memory catalog of available service descriptors and installed
//! service instances.
//!
//! Descriptors are discovered by scanning the service directories for
//! files whose extension names one of the known service types.
//! Installed instances are loaded from the `Me` directory tree, one
//! subdirectory per instance with a `me.json` record inside.

use chrono::{DateTime, Utc};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::files;

/// Registry shared between the installer, the process supervisor and
/// the web layer. All mutation happens under this single lock.
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// The kinds of services the manager understands, keyed by descriptor
/// file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Collection,
    Connector,
    App,
    Auth,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Collection,
        ServiceType::Connector,
        ServiceType::App,
        ServiceType::Auth,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            ServiceType::Collection => "collection",
            ServiceType::Connector => "connector",
            ServiceType::App => "app",
            ServiceType::Auth => "auth",
        }
    }
}

/// An installable service as described by its descriptor file. The
/// on-disk field names follow the locker record format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Directory containing the descriptor file; the identity key
    /// within the available set.
    #[serde(rename = "srcdir")]
    pub src_dir: String,

    #[serde(rename = "is")]
    pub service_type: ServiceType,

    /// Capability tags, optionally namespaced `category/specific`.
    #[serde(default)]
    pub provides: Vec<String>,

    /// Command line used to launch the service, e.g. `node index.js`.
    pub run: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Capability category this service needs an auth provider for.
    #[serde(rename = "authRequired", default, skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<String>,

    /// For auth services, the auth capability they satisfy.
    #[serde(rename = "serviceType", default, skip_serializing_if = "Option::is_none")]
    pub auth_service_type: Option<String>,
}

/// Raw shape of a descriptor file before it is annotated with its
/// containing directory and type.
#[derive(Debug, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    provides: Vec<String>,
    run: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "authRequired", default)]
    auth_required: Option<String>,
    #[serde(rename = "serviceType", default)]
    auth_service_type: Option<String>,
}

/// Queued start requests for an instance with a spawn attempt in
/// flight. Its presence is the per-instance mutual-exclusion flag: at
/// most one subprocess launch may be outstanding at a time.
#[derive(Debug, Default)]
pub struct StartingState {
    /// Waiters notified in FIFO order once the handshake completes.
    pub waiters: VecDeque<oneshot::Sender<()>>,
}

impl StartingState {
    pub fn new(notify: Option<oneshot::Sender<()>>) -> Self {
        let mut waiters = VecDeque::new();
        if let Some(tx) = notify {
            waiters.push_back(tx);
        }
        Self { waiters }
    }
}

/// An installed, id-bearing service instance. `pid` is present iff
/// the instance has a live, handshake-confirmed subprocess; it is
/// never trusted across manager restarts.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstalledService {
    #[serde(flatten)]
    pub descriptor: ServiceDescriptor,

    pub id: String,
    pub uri: String,

    #[serde(rename = "uriLocal", default, skip_serializing_if = "Option::is_none")]
    pub uri_local: Option<String>,

    /// Id of the auth instance resolved at install time.
    #[serde(rename = "authServiceID", default, skip_serializing_if = "Option::is_none")]
    pub auth_service_id: Option<String>,

    #[serde(rename = "installedAt")]
    pub installed_at: DateTime<Utc>,

    /// Suggested port for the current spawn attempt, possibly
    /// overridden by the port the service reports in its handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    #[serde(skip)]
    pub starting: Option<StartingState>,

    /// Termination handle for the live subprocess.
    #[serde(skip)]
    pub term: Option<CancellationToken>,
}

impl InstalledService {
    pub fn from_descriptor(descriptor: ServiceDescriptor, id: String, uri: String) -> Self {
        Self {
            descriptor,
            id,
            uri,
            uri_local: None,
            auth_service_id: None,
            installed_at: Utc::now(),
            port: None,
            pid: None,
            starting: None,
            term: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// Copy of this record with runtime-only state stripped, safe to
    /// hand out of the registry lock.
    pub fn sterilized(&self) -> InstalledService {
        InstalledService {
            descriptor: self.descriptor.clone(),
            id: self.id.clone(),
            uri: self.uri.clone(),
            uri_local: self.uri_local.clone(),
            auth_service_id: self.auth_service_id.clone(),
            installed_at: self.installed_at,
            port: self.port,
            pid: self.pid,
            starting: None,
            term: None,
        }
    }

    /// Label used when relabeling subprocess output.
    pub fn log_label(&self) -> String {
        self.descriptor
            .title
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }

    /// Write the instance record to `{me_dir}/{id}/me.json`.
    pub async fn persist(&self, me_dir: &Path) -> anyhow::Result<()> {
        let path = me_dir.join(&self.id).join(files::INSTANCE_RECORD);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).await?;
        Ok(())
    }
}

/// Read-only snapshot of the whole service map for the admin API.
#[derive(Debug, Serialize)]
pub struct ServiceMapSnapshot {
    pub available: Vec<ServiceDescriptor>,
    pub installed: HashMap<String, InstalledService>,
}

pub struct Registry {
    /// Ordered, append-only per scan. Re-scanning appends duplicates;
    /// installs match by src_dir so duplicates are benign.
    pub available: Vec<ServiceDescriptor>,
    pub installed: HashMap<String, InstalledService>,
    me_dir: PathBuf,
}

impl Registry {
    pub fn new(me_dir: PathBuf) -> Self {
        Self {
            available: Vec::new(),
            installed: HashMap::new(),
            me_dir,
        }
    }

    pub fn me_dir(&self) -> &Path {
        &self.me_dir
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.me_dir.join(id)
    }

    /// Recursively scan `dir` for descriptor files. A file that fails
    /// to parse is logged and skipped; the scan itself never fails.
    pub async fn scan_directory(&mut self, dir: &Path) {
        for service_type in ServiceType::ALL {
            let pattern = format!("{}/**/*.{}", dir.display(), service_type.extension());
            let entries = match glob(&pattern) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Bad scan pattern {}: {}", pattern, e);
                    continue;
                }
            };

            for entry in entries {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("Unreadable path during scan: {}", e);
                        continue;
                    }
                };

                match Self::map_descriptor(&path, service_type).await {
                    Ok(descriptor) => {
                        debug!(
                            "Discovered {} service in {}",
                            service_type.extension(),
                            descriptor.src_dir
                        );
                        self.available.push(descriptor);
                    }
                    Err(e) => {
                        warn!("Could not parse descriptor {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    async fn map_descriptor(
        path: &Path,
        service_type: ServiceType,
    ) -> anyhow::Result<ServiceDescriptor> {
        let content = fs::read_to_string(path).await?;
        let file: DescriptorFile = serde_json::from_str(&content)?;
        let src_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_string_lossy()
            .into_owned();

        Ok(ServiceDescriptor {
            src_dir,
            service_type,
            provides: file.provides,
            run: file.run,
            title: file.title,
            auth_required: file.auth_required,
            auth_service_type: file.auth_service_type,
        })
    }

    /// Load installed instances from the `Me` directory. A prior
    /// run's pid is stripped: a live-process marker is never trusted
    /// across restarts. Malformed subdirectories are logged and
    /// skipped.
    pub async fn load_installed(&mut self) -> anyhow::Result<()> {
        if !self.me_dir.exists() {
            fs::create_dir_all(&self.me_dir).await?;
        }

        let mut entries = fs::read_dir(&self.me_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let record = entry.path().join(files::INSTANCE_RECORD);
            match Self::load_record(&record).await {
                Ok(mut service) => {
                    service.pid = None;
                    info!("Installing {}", service.id);
                    self.installed.insert(service.id.clone(), service);
                }
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path().display(), e);
                }
            }
        }

        Ok(())
    }

    async fn load_record(path: &Path) -> anyhow::Result<InstalledService> {
        let content = fs::read_to_string(path).await?;
        let service: InstalledService = serde_json::from_str(&content)?;
        Ok(service)
    }

    /// Every installed instance whose `provides` set satisfies at
    /// least one of the requested capabilities.
    pub fn providers(&self, requested: &[String]) -> Vec<&InstalledService> {
        self.installed
            .values()
            .filter(|service| {
                service.descriptor.provides.iter().any(|provided| {
                    requested
                        .iter()
                        .any(|request| capability_matches(request, provided))
                })
            })
            .collect()
    }

    /// Identity by path, not by reference: tolerates re-scanned
    /// duplicates as long as the path matches.
    pub fn find_available(&self, src_dir: &str) -> Option<&ServiceDescriptor> {
        self.available.iter().find(|d| d.src_dir == src_dir)
    }

    pub fn meta_info(&self, id: &str) -> Option<&InstalledService> {
        self.installed.get(id)
    }

    pub fn is_installed(&self, id: &str) -> bool {
        self.installed.contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.installed.get(id).is_some_and(|s| s.pid.is_some())
    }

    pub fn snapshot(&self) -> ServiceMapSnapshot {
        ServiceMapSnapshot {
            available: self.available.clone(),
            installed: self
                .installed
                .iter()
                .map(|(id, service)| (id.clone(), service.sterilized()))
                .collect(),
        }
    }
}

/// Asymmetric capability match. An uncategorized request like
/// `contact` matches a provided `contact/facebook` through its
/// category prefix; a categorized request such as `contact/twitter`
/// matches only exactly.
pub fn capability_matches(requested: &str, provided: &str) -> bool {
    if requested.contains('/') {
        return requested == provided;
    }
    match provided.split_once('/') {
        Some((category, _)) => requested == category,
        None => requested == provided,
    }
}

#[cfg(test)]
mod tests {
    use super::capability_matches;

    #[test]
    fn uncategorized_request_matches_category_prefix() {
        assert!(capability_matches("contact", "contact/facebook"));
        assert!(capability_matches("contact", "contact"));
        assert!(!capability_matches("photo", "contact/facebook"));
    }

    #[test]
    fn categorized_request_matches_only_exactly() {
        assert!(capability_matches("contact/facebook", "contact/facebook"));
        assert!(!capability_matches("contact/twitter", "contact/facebook"));
        assert!(!capability_matches("contact/facebook", "contact"));
    }
}
