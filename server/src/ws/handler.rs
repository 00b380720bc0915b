use std::net::SocketAddr;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::ws::{actor, GatewayState};

/// Build the device ingress router: a single websocket connect endpoint.
pub fn device_router(state: GatewayState, connect_path: &str) -> Router {
    Router::new()
        .route(connect_path, get(connect))
        .with_state(state)
}

/// GET /connect (path configurable)
/// Authenticates the raw request, validates the handshake headers and
/// upgrades. Registration happens after the upgrade so a duplicate device
/// can be refused with a proper close code.
async fn connect(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = (state.authenticate)(&headers, peer) {
        tracing::debug!(remote = %peer, error = %err, "unauthorized connection");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let device_id = header_value(&headers, "Device-Id");
    if device_id.is_empty() {
        tracing::debug!(remote = %peer, "connection without Device-Id header");
        return (StatusCode::BAD_REQUEST, "missing Device-Id header").into_response();
    }

    let meta = actor::ConnectionMeta {
        device_id,
        device_name: header_value(&headers, "Device-Name"),
        device_type: header_value(&headers, "Device-Type"),
        user_agent: header_value(&headers, "User-Agent"),
        remote_address: peer.to_string(),
    };

    tracing::debug!(remote = %peer, device_id = %meta.device_id, "websocket accepted");

    ws.on_upgrade(move |socket| actor::run_connection(socket, state, meta))
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_string()
}
