use crate::web::{handlers, AppState};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub async fn start_web_server(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Admin API running on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn create_router(state: AppState) -> Router {
    Router::new()
        // === REGISTRY ROUTES (read-only UI boundary) ===
        .route("/api/services", get(handlers::get_service_map))
        .route("/api/services/{id}", get(handlers::get_service))
        .route(
            "/api/services/{id}/running",
            get(handlers::get_service_running),
        )
        .route("/api/providers", get(handlers::get_providers))
        // === LIFECYCLE ROUTES ===
        .route("/api/install", post(handlers::install_service))
        .route("/api/services/{id}/start", post(handlers::start_service))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
