//! Operator control API: the adapter contract the supervisor drives, plus
//! the bundled REST/SSE implementation.

mod auth;
mod payloads;

pub use auth::ApiAuthentication;
pub use payloads::{
    DeviceResponsePayload, DeviceShowPayload, DevicesListPayload, ErrorPayload, StatusPayload,
};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use crate::connections::{Command, Query};
use crate::error::ConnectorError;
use crate::supervisor::Supervisor;

/// What the supervisor expects from an attached control API: `start` is
/// called during boot with a handle to the supervisor, `stop` during the
/// drain.
#[async_trait]
pub trait ControlApi: Send + Sync {
    async fn start(&self, connector: Arc<Supervisor>) -> Result<(), ConnectorError>;
    async fn stop(&self);
}

#[derive(Clone)]
pub struct ApiState {
    connector: Arc<Supervisor>,
    auth: ApiAuthentication,
}

/// The bundled REST control API. One operator-facing listener exposing
/// status, the SSE metrics stream, device listings and command/query
/// forwarding.
pub struct DefaultControlApi {
    address: String,
    port: u16,
    auth: ApiAuthentication,
    shutdown_tx: watch::Sender<bool>,
    ready_tx: Mutex<Option<oneshot::Sender<SocketAddr>>>,
}

impl DefaultControlApi {
    pub fn new(address: &str, port: u16, auth: ApiAuthentication) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            address: address.to_string(),
            port,
            auth,
            shutdown_tx,
            ready_tx: Mutex::new(None),
        }
    }

    /// The bound address is reported here once the listener accepts.
    pub fn with_ready(self, ready: oneshot::Sender<SocketAddr>) -> Self {
        *self.ready_tx.lock().expect("ready lock poisoned") = Some(ready);
        self
    }

    fn router(state: ApiState) -> Router {
        Router::new()
            .route("/cloud-connector/status", get(status))
            .route("/cloud-connector/status/stream", get(status_stream))
            .route("/devices", get(devices_list))
            .route("/devices/{device_id}/show", get(device_show))
            .route("/devices/command/{device_id}", post(send_command))
            .route("/devices/query/{device_id}", post(send_query))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                auth::require_authentication,
            ))
            .with_state(state)
    }
}

#[async_trait]
impl ControlApi for DefaultControlApi {
    async fn start(&self, connector: Arc<Supervisor>) -> Result<(), ConnectorError> {
        let state = ApiState {
            connector,
            auth: self.auth.clone(),
        };
        let app = Self::router(state);
        let bind_addr = format!("{}:{}", self.address, self.port);

        let listener = TcpListener::bind(&bind_addr).await.map_err(|err| {
            ConnectorError::Startup(format!("binding control API {bind_addr} failed: {err}"))
        })?;
        let bound = listener.local_addr().map_err(|err| {
            ConnectorError::Startup(format!("control API has no local address: {err}"))
        })?;

        if let Some(ready) = self.ready_tx.lock().expect("ready lock poisoned").take() {
            let _ = ready.send(bound);
        }
        tracing::info!("control API available at http://{bound}");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
            .map_err(|err| ConnectorError::Startup(format!("control API failed: {err}")))
    }

    async fn stop(&self) {
        tracing::debug!("shutting down control API");
        let _ = self.shutdown_tx.send(true);
    }
}

/// GET /cloud-connector/status
/// Full metric snapshot plus state, uptime and derived message rates.
async fn status(State(state): State<ApiState>) -> Json<StatusPayload> {
    let connector = &state.connector;
    let uptime = connector.uptime("");
    let received = connector.received_messages("");
    let sent = connector.sent_messages("");

    Json(StatusPayload {
        server_current_state: connector.state().to_string(),
        uptime,
        received_messages_per_second: per_second(received, uptime),
        sent_messages_per_second: per_second(sent, uptime),
        metrics: connector.system_metrics(),
    })
}

/// GET /cloud-connector/status/stream
/// Server-sent events: one event per metric change, at most one per metric
/// per sampler tick.
async fn status_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.connector.subscribe_to_metrics();
    tracing::debug!("metrics stream subscriber attached");

    let stream = subscription.map(|change| {
        let event = Event::default().event("system_metric");
        Ok(match event.json_data(&change) {
            Ok(event) => event,
            Err(_) => Event::default().data(""),
        })
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /devices
async fn devices_list(State(state): State<ApiState>) -> Json<DevicesListPayload> {
    Json(DevicesListPayload {
        devices: state.connector.connected_devices(),
    })
}

/// GET /devices/{device_id}/show
async fn device_show(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Response {
    let connector = &state.connector;
    let uptime = connector.uptime(&device_id);

    if uptime == 0 {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorPayload {
                error: "Device not found".to_string(),
            }),
        )
            .into_response();
    }

    let received = connector.received_messages(&device_id);
    let sent = connector.sent_messages(&device_id);

    Json(DeviceShowPayload {
        uptime,
        received_messages: received,
        received_messages_per_second: per_second(received, uptime),
        sent_messages: sent,
        sent_messages_per_second: per_second(sent, uptime),
    })
    .into_response()
}

/// POST /devices/command/{device_id}
/// The raw body is forwarded to the device as the command payload.
async fn send_command(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    body: String,
) -> Response {
    let result = state
        .connector
        .send_command(Command::new(&device_id, &body))
        .await;
    device_response(result)
}

/// POST /devices/query/{device_id}
async fn send_query(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    body: String,
) -> Response {
    let result = state
        .connector
        .send_query(Query::new(&device_id, &body))
        .await;
    device_response(result)
}

fn device_response(result: Result<String, ConnectorError>) -> Response {
    match result {
        Ok(payload) => (
            StatusCode::OK,
            Json(DeviceResponsePayload {
                response: payload,
                errors: String::new(),
            }),
        )
            .into_response(),
        Err(err) => (
            err.http_status(),
            Json(DeviceResponsePayload {
                response: String::new(),
                errors: err.to_string(),
            }),
        )
            .into_response(),
    }
}

fn per_second(count: u64, uptime: i64) -> f64 {
    count as f64 / (uptime + 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_second_never_divides_by_zero() {
        assert_eq!(per_second(0, 0), 0.0);
        assert_eq!(per_second(10, 4), 2.0);
    }

    #[test]
    fn test_device_response_maps_outcomes_to_statuses() {
        let ok = device_response(Ok("pong".to_string()));
        assert_eq!(ok.status(), StatusCode::OK);

        let not_connected =
            device_response(Err(ConnectorError::NotConnected("d1".to_string())));
        assert_eq!(not_connected.status(), StatusCode::NOT_FOUND);

        let timeout = device_response(Err(ConnectorError::Timeout {
            device_id: "d1".to_string(),
            timeout: std::time::Duration::from_secs(8),
        }));
        assert_eq!(timeout.status(), StatusCode::REQUEST_TIMEOUT);

        let transport = device_response(Err(ConnectorError::Transport {
            device_id: "d1".to_string(),
            reason: "gone".to_string(),
        }));
        assert_eq!(transport.status(), StatusCode::BAD_REQUEST);
    }
}
