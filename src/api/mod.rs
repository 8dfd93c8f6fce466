use crate::orchestrator::Trigger;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::UnboundedSender;

pub mod handlers;
pub mod responses;

/// Shared handler context: the read-only state fan-out plus the serialized
/// trigger stream into the orchestrator. Handlers never touch system state
/// directly.
#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<RwLock<AppState>>,
    pub triggers: UnboundedSender<Trigger>,
}

pub fn router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/queue", get(handlers::get_queue))
        .route("/api/book", post(handlers::post_book))
        .route("/api/cancel", post(handlers::post_cancel))
        .route("/api/replace", post(handlers::post_replace))
        .route("/api/health", get(handlers::get_health))
        .route("/api/admin/force_unlock", post(handlers::post_force_unlock))
        .route("/api/admin/reset", post(handlers::post_reset))
        .route("/api/admin/clear_queue", post(handlers::post_clear_queue))
        .route("/api/admin/maintenance", post(handlers::post_maintenance))
        .route(
            "/api/admin/config",
            get(handlers::get_config).post(handlers::post_config),
        )
        .with_state(ctx)
}
