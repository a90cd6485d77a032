use super::AppState;
use crate::sync::RegistryStats;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get},
};
use gachaboard_sync::RoomId;
use serde::Serialize;
use tracing::{error, info, warn};

/// Result of a mutating admin call
#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
}

/// Live session count for one room
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatusResponse {
    pub room_id: String,
    pub active_sessions: usize,
}

/// Registry-wide status
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub stats: RegistryStats,
}

fn error_response(status: StatusCode, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            ok: false,
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Create admin routes
pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route("/room/{room_id}", delete(delete_room))
        .route("/status", get(get_status))
        .route("/status/{room_id}", get(get_room_status))
        .route("/health", get(health))
        .with_state(state)
}

/// DELETE /room/{room_id} - Unload a room and delete its stored state
async fn delete_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    let room_id = match RoomId::parse(&room_id) {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejected delete for room {:?}: {}", room_id, e);
            return error_response(StatusCode::BAD_REQUEST, e);
        }
    };

    match state.registry.delete_room(&room_id).await {
        Ok(deleted) => {
            info!("[sync] room_delete roomId={} deleted={}", room_id, deleted);
            Json(OkResponse { ok: deleted }).into_response()
        }
        Err(e) => {
            error!("[sync] room_delete_failed roomId={}: {}", room_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// GET /status/{room_id} - Active sessions in one room
async fn get_room_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    let room_id = match RoomId::parse(&room_id) {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let active_sessions = state.registry.session_count(&room_id).await;
    Json(RoomStatusResponse {
        room_id: room_id.to_string(),
        active_sessions,
    })
    .into_response()
}

/// GET /status - Loaded rooms and their session counts
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        stats: state.registry.stats().await,
    })
}

/// GET /health - Liveness probe
async fn health() -> impl IntoResponse {
    Json(OkResponse { ok: true })
}
