//! Resolves an available descriptor into a persisted instance.
//!
//! If the descriptor requires an auth capability, the installer
//! reuses an already installed auth instance or recursively installs
//! an available auth descriptor that satisfies it. A visited set of
//! source directories bounds the recursion so dependency cycles fail
//! as unresolved rather than looping.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::InstallError;
use crate::registry::{InstalledService, Registry, ServiceType, SharedRegistry};

pub struct Installer {
    registry: SharedRegistry,
    config: Arc<Config>,
}

impl Installer {
    pub fn new(registry: SharedRegistry, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    /// Install the available service whose source directory is
    /// `src_dir`. Fails with `NotFound` if no such descriptor exists
    /// and with `DependencyUnresolved` if a required auth provider is
    /// neither installed nor installable; in both cases nothing is
    /// persisted.
    pub async fn install(&self, src_dir: &str) -> Result<InstalledService, InstallError> {
        let mut registry = self.registry.lock().await;
        let mut visited = HashSet::new();
        self.install_locked(&mut registry, src_dir, &mut visited)
            .await
    }

    fn install_locked<'a>(
        &'a self,
        registry: &'a mut Registry,
        src_dir: &'a str,
        visited: &'a mut HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<InstalledService, InstallError>> + Send + 'a>> {
        Box::pin(async move {
            let descriptor = registry
                .find_available(src_dir)
                .cloned()
                .ok_or_else(|| InstallError::NotFound {
                    src_dir: src_dir.to_string(),
                })?;
            visited.insert(descriptor.src_dir.clone());

            let auth_service_id = match &descriptor.auth_required {
                Some(required) => Some(self.resolve_auth(registry, src_dir, required, visited).await?),
                None => None,
            };

            let id = Uuid::new_v4().simple().to_string();
            let uri = format!("{}/Me/{}/", self.config.locker_url(), id);
            let mut service = InstalledService::from_descriptor(descriptor, id.clone(), uri);
            service.auth_service_id = auth_service_id;

            fs::create_dir_all(registry.instance_dir(&id))
                .await
                .map_err(|e| InstallError::Persist {
                    id: id.clone(),
                    reason: e.to_string(),
                })?;
            service
                .persist(registry.me_dir())
                .await
                .map_err(|e| InstallError::Persist {
                    id: id.clone(),
                    reason: e.to_string(),
                })?;

            info!("Installed {} from {}", id, service.descriptor.src_dir);
            let snapshot = service.sterilized();
            registry.installed.insert(id, service);
            Ok(snapshot)
        })
    }

    /// Find or install an auth provider for `required`, returning its
    /// instance id.
    async fn resolve_auth(
        &self,
        registry: &mut Registry,
        src_dir: &str,
        required: &str,
        visited: &mut HashSet<String>,
    ) -> Result<String, InstallError> {
        if let Some(dep) = registry.installed.values().find(|s| {
            s.descriptor.service_type == ServiceType::Auth
                && s.descriptor.auth_service_type.as_deref() == Some(required)
        }) {
            debug!("Auth requirement '{}' satisfied by installed {}", required, dep.id);
            return Ok(dep.id.clone());
        }

        let candidate = registry
            .available
            .iter()
            .find(|d| {
                d.service_type == ServiceType::Auth
                    && d.auth_service_type.as_deref() == Some(required)
                    && !visited.contains(&d.src_dir)
            })
            .map(|d| d.src_dir.clone());

        match candidate {
            Some(dep_src_dir) => {
                debug!("Installing auth dependency '{}' for {}", required, src_dir);
                let dep = self.install_locked(registry, &dep_src_dir, visited).await?;
                Ok(dep.id)
            }
            None => Err(InstallError::DependencyUnresolved {
                src_dir: src_dir.to_string(),
                required: required.to_string(),
            }),
        }
    }
}
