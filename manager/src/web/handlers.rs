use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time;
use tracing::info;

use crate::errors::{InstallError, ManagerError, SpawnError};
use crate::registry::{InstalledService, ServiceMapSnapshot};
use crate::web::AppState;

// Helper type for API responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<()>>)>;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

fn api_error(status: StatusCode, message: String) -> (StatusCode, Json<ApiResponse<()>>) {
    (status, Json(ApiResponse::error(message)))
}

#[derive(Deserialize)]
pub struct ProvidersQuery {
    /// Comma-separated capability strings, e.g. `contact,photo/flickr`.
    pub provides: String,
}

#[derive(Deserialize)]
pub struct InstallRequest {
    pub src_dir: String,
}

#[derive(Serialize)]
pub struct RunningStatus {
    pub id: String,
    pub running: bool,
}

/// Sterilized view of the whole service map (read-only UI boundary).
pub async fn get_service_map(State(state): State<AppState>) -> ApiResult<ServiceMapSnapshot> {
    let registry = state.registry.lock().await;
    Ok(Json(ApiResponse::success(registry.snapshot())))
}

pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<InstalledService> {
    match state.supervisor.meta_info(&id).await {
        Some(service) => Ok(Json(ApiResponse::success(service))),
        None => Err(unknown_service(id)),
    }
}

fn unknown_service(id: String) -> (StatusCode, Json<ApiResponse<()>>) {
    api_error(
        StatusCode::NOT_FOUND,
        ManagerError::from(SpawnError::UnknownService { id }).to_string(),
    )
}

pub async fn get_service_running(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RunningStatus> {
    if !state.supervisor.is_installed(&id).await {
        return Err(unknown_service(id));
    }
    let running = state.supervisor.is_running(&id).await;
    Ok(Json(ApiResponse::success(RunningStatus { id, running })))
}

/// The sole interface the contact-aggregation collaborator consumes.
pub async fn get_providers(
    State(state): State<AppState>,
    Query(query): Query<ProvidersQuery>,
) -> ApiResult<Vec<InstalledService>> {
    let requested: Vec<String> = query
        .provides
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let registry = state.registry.lock().await;
    let providers = registry
        .providers(&requested)
        .into_iter()
        .map(|s| s.sterilized())
        .collect();
    Ok(Json(ApiResponse::success(providers)))
}

pub async fn install_service(
    State(state): State<AppState>,
    Json(request): Json<InstallRequest>,
) -> ApiResult<InstalledService> {
    match state.installer.install(&request.src_dir).await {
        Ok(service) => Ok(Json(ApiResponse::success(service))),
        Err(e) => {
            let status = match &e {
                InstallError::NotFound { .. } => StatusCode::NOT_FOUND,
                InstallError::DependencyUnresolved { .. } => StatusCode::CONFLICT,
                InstallError::Persist { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err(api_error(status, ManagerError::from(e).to_string()))
        }
    }
}

/// Start a service and wait for its startup handshake.
pub async fn start_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RunningStatus> {
    if !state.supervisor.is_installed(&id).await {
        return Err(unknown_service(id));
    }
    if state.supervisor.is_running(&id).await {
        return Ok(Json(ApiResponse::success(RunningStatus { id, running: true })));
    }

    let (tx, rx) = oneshot::channel();
    state.supervisor.spawn(&id, Some(tx)).await;

    // The waiter fires on a confirmed handshake and is dropped when
    // the attempt fails; a small margin covers the supervisor's own
    // deadline handling.
    let deadline = state.config.handshake_timeout() + std::time::Duration::from_secs(5);
    match time::timeout(deadline, rx).await {
        Ok(Ok(())) => {
            info!("Started {} via admin API", id);
            Ok(Json(ApiResponse::success(RunningStatus { id, running: true })))
        }
        Ok(Err(_)) => {
            let e = SpawnError::Handshake {
                id,
                reason: "startup attempt failed".to_string(),
            };
            Err(api_error(StatusCode::BAD_GATEWAY, ManagerError::from(e).to_string()))
        }
        Err(_) => {
            let e = SpawnError::Handshake {
                id,
                reason: "timed out waiting for the service to start".to_string(),
            };
            Err(api_error(StatusCode::GATEWAY_TIMEOUT, ManagerError::from(e).to_string()))
        }
    }
}
