//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the chat websocket and a health check reporting live counts under one Axum router. When a
//! static directory is configured, the built frontend is served at `/` with
//! `index.html` as the fallback for client-side routes.

pub mod ws;

use axum::{Json, Router};
use axum::extract::State;
use axum::http::HeaderValue;
use axum::routing::get;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::ServerConfig;
use crate::state::AppState;

pub fn app(state: AppState, config: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors_layer(config.cors_origin.as_deref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let Some(dir) = &config.static_dir else {
        return router;
    };
    let spa = ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html")));
    router.fallback_service(spa)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let Some(origin) = origin else {
        return layer.allow_origin(Any);
    };
    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(AllowOrigin::exact(value)),
        Err(e) => {
            warn!(origin, error = %e, "invalid CORS_ORIGIN; allowing any origin");
            layer.allow_origin(Any)
        }
    }
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active_users = state.hub.active_users().await.len();
    let clients = state.hub.client_count().await;
    Json(serde_json::json!({ "status": "ok", "clients": clients, "active_users": active_users }))
}
