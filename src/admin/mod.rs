//! Admin HTTP API.
//!
//! # Routes
//! ```text
//! GET  /admin/status                     service status snapshot
//! POST /admin/events/{kind}/acquire      hold a poll feed open (bind)
//! POST /admin/events/{kind}/release      drop a hold (unbind)
//! POST /admin/reload                     request a profile reload
//! POST /admin/power/{on|off}             deliver a power state change
//! POST /admin/engine/start|stop          start or stop the engine
//! GET  /admin/observe?id=&kinds=         WebSocket event stream
//! ```
//!
//! # Design Decisions
//! - Bearer auth applies to every route when `api_key` is configured
//! - The server stops with the service's shutdown signal

pub mod auth;
pub mod handlers;
pub mod observe;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::service::EngineService;

#[derive(Clone)]
pub struct AdminState {
    pub service: Arc<EngineService>,
    pub api_key: Option<String>,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/events/{kind}/acquire", post(acquire_event))
        .route("/admin/events/{kind}/release", post(release_event))
        .route("/admin/reload", post(reload))
        .route("/admin/power/{state}", post(set_power))
        .route("/admin/engine/start", post(start_engine))
        .route("/admin/engine/stop", post(stop_engine))
        .route("/admin/observe", get(observe::observe))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API on `listener` until the service shuts down.
pub async fn serve(listener: TcpListener, state: AdminState) -> std::io::Result<()> {
    let mut shutdown = state.service.subscribe_shutdown();
    let router = setup_admin_router(state);

    tracing::info!(address = ?listener.local_addr().ok(), "Admin API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
