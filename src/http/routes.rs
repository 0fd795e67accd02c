//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::{PlayerId, RegistryError};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;
use crate::ws::protocol::PlayerView;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - comma-separated origins in CLIENT_ORIGIN, any when unset
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    let cors = match &state.config.client_origin {
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
                .collect();
            cors.allow_origin(allowed_origins)
        }
        None => cors.allow_origin(Any),
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/players", get(players_handler))
        .route("/players/:player_id", get(player_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.registry.len(),
    })
}

// ============================================================================
// Player endpoints
// ============================================================================

#[derive(Serialize)]
struct ConnectedPlayer {
    player_id: PlayerId,
    connected_at: u64,
}

#[derive(Serialize)]
struct PlayersResponse {
    players: Vec<ConnectedPlayer>,
}

async fn players_handler(State(state): State<AppState>) -> Json<PlayersResponse> {
    let players = state
        .registry
        .player_ids()
        .into_iter()
        .filter_map(|player_id| {
            // Sessions may end between listing and lookup
            let handle = state.registry.get(&player_id)?;
            Some(ConnectedPlayer {
                player_id,
                connected_at: handle.connected_at,
            })
        })
        .collect();

    Json(PlayersResponse { players })
}

async fn player_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerView>, AppError> {
    let player_id =
        PlayerId::parse(Some(&player_id)).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let snapshot = state.registry.snapshot(&player_id).await?;

    Ok(Json(PlayerView::from(&snapshot)))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        let message = e.to_string();
        match e {
            RegistryError::NotConnected(_) => AppError::NotFound(message),
            RegistryError::AlreadyConnected(_) => AppError::Conflict(message),
            RegistryError::ShuttingDown | RegistryError::Unresponsive(_) => {
                AppError::Unavailable(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
