use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use uuid::Uuid;

use crate::connections::{Command, ConnectionsHandler, Query};
use crate::correlator::{CallKind, Correlator, WireMessage};
use crate::error::ConnectorError;
use crate::events::ConnectionEventBus;
use crate::registry::ConnectionRegistry;
use crate::ws::{
    self, close_message, Authenticator, CloseCode, GatewayState, IncomingMessageHandler,
    SocketRegistry,
};

struct TlsPaths {
    certificate: String,
    key: String,
}

/// Websocket implementation of [`ConnectionsHandler`].
///
/// Owns the socket mailbox table and the correlator; the registry is
/// shared with the supervisor. Sends are synchronous from the operator's
/// point of view: a fresh message ID is parked in the correlator, the
/// frame is pushed through the device's mailbox, and the call waits on the
/// reply with a deadline.
pub struct WebSocketsHandler {
    id: String,
    address: String,
    port: u16,
    connect_path: String,
    tls: Option<TlsPaths>,
    request_timeout: Duration,
    registry: Arc<ConnectionRegistry>,
    sockets: Arc<SocketRegistry>,
    correlator: Arc<Correlator>,
    events: Arc<ConnectionEventBus>,
    authenticate: Authenticator,
    on_message: IncomingMessageHandler,
    shutting_down: Arc<AtomicBool>,
}

impl WebSocketsHandler {
    pub fn new(
        address: &str,
        port: u16,
        connect_path: &str,
        request_timeout: Duration,
        registry: Arc<ConnectionRegistry>,
        authenticate: Authenticator,
        on_message: IncomingMessageHandler,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            address: address.to_string(),
            port,
            connect_path: connect_path.to_string(),
            tls: None,
            request_timeout,
            registry,
            sockets: Arc::new(SocketRegistry::new()),
            correlator: Arc::new(Correlator::new()),
            events: Arc::new(ConnectionEventBus::new()),
            authenticate,
            on_message,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Devices connect via wss once certificate and key paths are set.
    pub fn with_tls(mut self, certificate_path: &str, key_path: &str) -> Self {
        self.tls = Some(TlsPaths {
            certificate: certificate_path.to_string(),
            key: key_path.to_string(),
        });
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lifecycle events (`connections::established`, `connections::closed`)
    /// are published here for embedders to subscribe to.
    pub fn events(&self) -> &Arc<ConnectionEventBus> {
        &self.events
    }

    fn gateway_state(&self) -> GatewayState {
        GatewayState {
            registry: Arc::clone(&self.registry),
            sockets: Arc::clone(&self.sockets),
            correlator: Arc::clone(&self.correlator),
            events: Arc::clone(&self.events),
            authenticate: Arc::clone(&self.authenticate),
            on_message: Arc::clone(&self.on_message),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }

    async fn submit(
        &self,
        kind: CallKind,
        device_id: &str,
        payload: &str,
    ) -> Result<String, ConnectorError> {
        if !self.sockets.contains(device_id) {
            return Err(ConnectorError::NotConnected(device_id.to_string()));
        }

        let (message_id, waiter) = self.correlator.register(kind);
        let wire = WireMessage::new(&message_id, payload);

        let frame = match serde_json::to_string(&wire) {
            Ok(frame) => frame,
            Err(err) => {
                self.correlator.remove(kind, &message_id);
                return Err(ConnectorError::Transport {
                    device_id: device_id.to_string(),
                    reason: format!("encoding outbound message failed: {err}"),
                });
            }
        };

        let written = self
            .sockets
            .get(device_id)
            .map(|tx| tx.send(Message::Text(frame.into())).is_ok())
            .unwrap_or(false);

        if !written {
            self.correlator.remove(kind, &message_id);
            return Err(ConnectorError::Transport {
                device_id: device_id.to_string(),
                reason: "device socket is gone".to_string(),
            });
        }

        tracing::debug!(
            device_id,
            message_id = %message_id,
            kind = kind.as_str(),
            "message sent to device, awaiting reply"
        );

        match timeout(self.request_timeout, waiter).await {
            Ok(Ok(reply)) => {
                if let Err(err) = self.registry.message_was_sent(device_id) {
                    tracing::debug!(device_id, error = %err, "sent counter update failed");
                }
                Ok(reply.payload)
            }
            Ok(Err(_)) => {
                // The waiter sender was dropped without a reply; the
                // connection went away mid-call.
                self.correlator.remove(kind, &message_id);
                Err(ConnectorError::Transport {
                    device_id: device_id.to_string(),
                    reason: "connection closed while awaiting reply".to_string(),
                })
            }
            Err(_) => {
                self.correlator.remove(kind, &message_id);
                Err(ConnectorError::Timeout {
                    device_id: device_id.to_string(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    /// Closes every open socket with a normal-closure frame and empties
    /// the registry. Actors run their own cleanup when their loops exit;
    /// both paths are idempotent.
    fn drain_connections(
        sockets: &SocketRegistry,
        registry: &ConnectionRegistry,
        shutting_down: &AtomicBool,
    ) {
        shutting_down.store(true, Ordering::SeqCst);
        tracing::debug!("connections handler closing open connections");

        for device_id in sockets.device_ids() {
            if let Some(tx) = sockets.get(&device_id) {
                let _ = tx.send(close_message(CloseCode::NormalClosure, "server shutting down"));
            }
            sockets.remove(&device_id);
            registry.delete(&device_id);
            tracing::debug!(device_id = %device_id, "connection closed");
        }

        tracing::debug!("all device connections closed");
    }
}

#[async_trait]
impl ConnectionsHandler for WebSocketsHandler {
    async fn start(
        &self,
        shutdown: watch::Receiver<bool>,
        shutdown_complete: mpsc::Sender<()>,
        ready: oneshot::Sender<SocketAddr>,
    ) -> Result<(), ConnectorError> {
        let app = ws::handler::device_router(self.gateway_state(), &self.connect_path)
            .into_make_service_with_connect_info::<SocketAddr>();
        let bind_addr = format!("{}:{}", self.address, self.port);

        // Graceful-shutdown watcher: drains sockets when the supervisor
        // signals, then acknowledges on shutdown_complete. Runs to
        // completion on its own; the supervisor's drain wait is bounded
        // either way.
        {
            let mut shutdown_rx = shutdown.clone();
            let sockets = Arc::clone(&self.sockets);
            let registry = Arc::clone(&self.registry);
            let shutting_down = Arc::clone(&self.shutting_down);
            tokio::spawn(async move {
                if shutdown_rx.changed().await.is_ok() {
                    tracing::debug!("connections handler shutdown signal received");
                    Self::drain_connections(&sockets, &registry, &shutting_down);
                }
                let _ = shutdown_complete.send(()).await;
            });
        }

        match &self.tls {
            Some(tls) => {
                let addr: SocketAddr = bind_addr.parse().map_err(|err| {
                    ConnectorError::Startup(format!("invalid listen address {bind_addr}: {err}"))
                })?;
                let rustls = RustlsConfig::from_pem_file(&tls.certificate, &tls.key)
                    .await
                    .map_err(|err| {
                        ConnectorError::Startup(format!("loading TLS material failed: {err}"))
                    })?;

                let handle = axum_server::Handle::new();

                {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Some(bound) = handle.listening().await {
                            tracing::debug!(
                                "serving websockets via wss (TLS on) at {bound}"
                            );
                            let _ = ready.send(bound);
                        }
                    });
                }
                {
                    let handle = handle.clone();
                    let mut shutdown_rx = shutdown.clone();
                    tokio::spawn(async move {
                        let _ = shutdown_rx.changed().await;
                        handle.graceful_shutdown(Some(Duration::from_secs(2)));
                    });
                }

                axum_server::bind_rustls(addr, rustls)
                    .handle(handle)
                    .serve(app)
                    .await
                    .map_err(|err| ConnectorError::Startup(format!("listener failed: {err}")))
            }
            None => {
                let listener = TcpListener::bind(&bind_addr).await.map_err(|err| {
                    ConnectorError::Startup(format!("binding {bind_addr} failed: {err}"))
                })?;
                let bound = listener.local_addr().map_err(|err| {
                    ConnectorError::Startup(format!("listener has no local address: {err}"))
                })?;

                tracing::debug!(
                    "serving websockets via ws (TLS off) at {bound}, connect endpoint ws://{bound}{}",
                    self.connect_path
                );
                let _ = ready.send(bound);

                let mut shutdown_rx = shutdown.clone();
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.changed().await;
                    })
                    .await
                    .map_err(|err| ConnectorError::Startup(format!("listener failed: {err}")))
            }
        }
    }

    async fn send_command(&self, command: Command) -> Result<String, ConnectorError> {
        self.submit(CallKind::Command, &command.device_id, &command.payload)
            .await
    }

    async fn send_query(&self, query: Query) -> Result<String, ConnectorError> {
        self.submit(CallKind::Query, &query.device_id, &query.payload)
            .await
    }

    fn commands_waiting(&self) -> usize {
        self.correlator.commands_waiting()
    }

    fn queries_waiting(&self) -> usize {
        self.correlator.queries_waiting()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_all() -> Authenticator {
        Arc::new(|_headers, _peer| Ok(()))
    }

    fn discard_messages() -> IncomingMessageHandler {
        Arc::new(|_device, _kind, _bytes| Ok(()))
    }

    fn handler(request_timeout: Duration) -> WebSocketsHandler {
        WebSocketsHandler::new(
            "127.0.0.1",
            0,
            "/connect",
            request_timeout,
            Arc::new(ConnectionRegistry::new()),
            allow_all(),
            discard_messages(),
        )
    }

    #[tokio::test]
    async fn test_send_to_unconnected_device_is_fast_404() {
        let handler = handler(Duration::from_secs(8));

        let started = std::time::Instant::now();
        let result = handler.send_command(Command::new("ghost", "ping")).await;
        assert!(started.elapsed() < Duration::from_millis(100));

        let err = result.unwrap_err();
        assert!(matches!(err, ConnectorError::NotConnected(_)));
        assert_eq!(err.http_status(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(handler.commands_waiting(), 0);
    }

    #[tokio::test]
    async fn test_reply_through_mailbox_resolves_command() {
        let handler = handler(Duration::from_secs(2));
        handler
            .registry
            .add("c1", "d1", "", "", "", "127.0.0.1:1")
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handler.sockets.insert("d1", tx);

        // Device side: echo a "pong" reply with the request's message ID.
        let correlator = Arc::clone(&handler.correlator);
        tokio::spawn(async move {
            if let Some(Message::Text(frame)) = rx.recv().await {
                let request: WireMessage = serde_json::from_str(frame.as_str()).unwrap();
                let reply = WireMessage::new(&request.id, "pong");
                correlator.dispatch(&serde_json::to_vec(&reply).unwrap());
            }
        });

        let payload = handler
            .send_command(Command::new("d1", "ping"))
            .await
            .unwrap();
        assert_eq!(payload, "pong");
        assert_eq!(handler.commands_waiting(), 0);
        assert_eq!(handler.registry.sent_messages("d1"), 1);
    }

    #[tokio::test]
    async fn test_silent_device_times_out_and_clears_waiter() {
        let handler = handler(Duration::from_millis(50));
        handler
            .registry
            .add("c1", "d1", "", "", "", "127.0.0.1:1")
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        handler.sockets.insert("d1", tx);

        let err = handler
            .send_query(Query::new("d1", "status?"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout { .. }));
        assert_eq!(err.http_status(), axum::http::StatusCode::REQUEST_TIMEOUT);
        assert_eq!(handler.queries_waiting(), 0);
        assert_eq!(handler.registry.sent_messages("d1"), 0);
    }

    #[tokio::test]
    async fn test_dead_mailbox_is_a_transport_error() {
        let handler = handler(Duration::from_secs(2));
        handler
            .registry
            .add("c1", "d1", "", "", "", "127.0.0.1:1")
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        handler.sockets.insert("d1", tx);
        drop(rx); // writer task is gone

        let err = handler
            .send_command(Command::new("d1", "ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Transport { .. }));
        assert_eq!(err.http_status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(handler.commands_waiting(), 0);
    }

    #[tokio::test]
    async fn test_drain_closes_sockets_and_empties_registry() {
        let handler = handler(Duration::from_secs(2));
        let mut receivers = Vec::new();
        for id in ["d1", "d2", "d3"] {
            handler.registry.add("c", id, "", "", "", "127.0.0.1:1").unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            handler.sockets.insert(id, tx);
            receivers.push(rx);
        }

        WebSocketsHandler::drain_connections(
            &handler.sockets,
            &handler.registry,
            &handler.shutting_down,
        );

        assert!(handler.sockets.is_empty());
        assert_eq!(handler.registry.open_connections(), 0);
        assert!(handler.shutting_down.load(Ordering::SeqCst));
        for mut rx in receivers {
            let frame = rx.try_recv().unwrap();
            match frame {
                Message::Close(Some(frame)) => assert_eq!(frame.code, 1000),
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

}
