pub mod admin;
pub mod ws;

use crate::sync::RoomRegistry;
use axum::{Router, routing::get};
use std::sync::Arc;

pub use admin::admin_routes;
pub use ws::{serve_session, sync_handler};

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
}

/// All routes: the sync socket plus the admin surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync/{room_id}", get(sync_handler))
        .with_state(state.clone())
        .merge(admin_routes(state))
}
