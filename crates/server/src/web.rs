use std::sync::Arc;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use rtpcast_protocol::RelayConfig;
use tower_http::cors::{Any, CorsLayer};

use crate::manager::{self, PeerRegistry};
use crate::stream::Stream;

/// Shared application state.
pub struct AppState {
    pub config: RelayConfig,
    pub streams: Vec<Arc<Stream>>,
    pub registry: PeerRegistry,
}

/// Build the router: one WebSocket endpoint, reachable at `/` and `/signal`.
/// Browser peers connect cross-origin, so CORS is wide open.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/signal", get(ws_upgrade))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

/// GET / - upgrade to WebSocket and hand the connection to the manager.
///
/// The capacity check runs before the upgrade so a full relay answers 503
/// instead of completing a handshake it would immediately tear down.
/// Non-upgrade requests get the extractor's rejection (400).
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.registry.is_full() {
        tracing::warn!(
            current = state.registry.len(),
            max = state.registry.max_peers(),
            "peer rejected, registry full"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "max connections reached").into_response();
    }

    match ws {
        Ok(ws) => {
            tracing::debug!("websocket upgrade");
            ws.on_upgrade(move |socket| manager::handle_socket(state, socket))
                .into_response()
        }
        Err(rejection) => rejection.into_response(),
    }
}
