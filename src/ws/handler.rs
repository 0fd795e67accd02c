//! WebSocket upgrade handler

use std::sync::Arc;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use crate::app::AppState;
use crate::config::Config;
use crate::game::{PlayerId, Registration, Session};
use crate::http::routes::AppError;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Identifier the player connects as
    #[serde(rename = "playerID")]
    pub player_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let player_id = match PlayerId::parse(query.player_id.as_deref()) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Rejected WebSocket upgrade");
            return AppError::BadRequest(e.to_string()).into_response();
        }
    };

    // Register before upgrading so a duplicate gets a proper HTTP status
    let registration = match state.registry.register(player_id) {
        Ok(registration) => registration,
        Err(e) => {
            warn!(error = %e, "Rejected WebSocket upgrade");
            return AppError::from(e).into_response();
        }
    };

    info!(
        player_id = %registration.player_id(),
        session_id = %registration.session_id(),
        "WebSocket upgrade"
    );

    let config = state.config.clone();
    // If the upgrade never completes the closure is dropped and so is the registration
    ws.on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, registration, config))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, registration: Registration, config: Arc<Config>) {
    let player_id = registration.player_id().clone();
    info!(player_id = %player_id, "New WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();
    let end = Session::new(registration, &config.sync)
        .run(ws_stream, ws_sink)
        .await;

    info!(player_id = %player_id, reason = %end, "WebSocket connection closed");
}
