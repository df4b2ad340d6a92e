//! # InferMesh Console
//!
//! The admin HTTP surface, served on its own port: `/stats`, registry
//! mutations under `/admin/*`, configuration get/apply, diagnostics,
//! and a log tail. JSON in, JSON out.

pub mod handlers;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use proxy_core::ProxyServer;

use crate::state::ConsoleState;

pub fn router(proxy: Arc<ProxyServer>) -> Router {
    let state = Arc::new(ConsoleState::new(proxy));
    Router::new()
        .route("/stats", get(handlers::stats))
        .route(
            "/admin/config",
            get(handlers::get_config).post(handlers::apply_config),
        )
        .route("/admin/backend_register", post(handlers::backend_register))
        .route("/admin/backend_remove", post(handlers::backend_remove))
        .route("/admin/backend_online", post(handlers::backend_online))
        .route("/admin/backend_metrics", post(handlers::backend_metrics))
        .route("/admin/backend_model", post(handlers::backend_model))
        .route("/admin/diagnose", get(handlers::diagnose))
        .route("/admin/logs", get(handlers::logs))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the console on an already-bound listener.
pub async fn serve(
    proxy: Arc<ProxyServer>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "console listening");
    axum::serve(listener, router(proxy)).await
}
