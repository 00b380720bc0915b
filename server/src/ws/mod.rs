//! Websocket transport: the per-socket mailbox table, RFC 6455 close
//! codes, the connect/upgrade endpoint and the per-connection actor.

pub mod actor;
pub mod handler;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use axum::http::HeaderMap;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::correlator::Correlator;
use crate::error::ConnectorError;
use crate::events::ConnectionEventBus;
use crate::registry::ConnectionRegistry;

/// Sender half of a connection's mailbox. The writer task owns the socket
/// sink; everything that needs to write (correlated sends, pong replies,
/// shutdown closes) pushes messages here, which serializes all writes per
/// socket.
pub type DeviceSender = mpsc::UnboundedSender<Message>;

/// Websocket close status codes, RFC 6455 §7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    NormalClosure = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    AbnormalClosure = 1006,
    InvalidFramePayloadData = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    InternalError = 1011,
    ServiceRestart = 1012,
    TryAgainLater = 1013,
    BadGateway = 1014,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// A close frame ready to push into a connection mailbox.
pub fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.code(),
        reason: reason.into(),
    }))
}

/// Kind of data frame handed to the embedder's incoming-message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Embedder-supplied connection gate. Receives the upgrade request's
/// headers and peer address; an `Err` rejects with `401` before the
/// upgrade.
pub type Authenticator =
    Arc<dyn Fn(&HeaderMap, SocketAddr) -> Result<(), ConnectorError> + Send + Sync>;

/// Embedder-supplied sink for every inbound frame that is not a correlated
/// reply. Errors are logged and tolerated; they never tear down the
/// connection.
pub type IncomingMessageHandler =
    Arc<dyn Fn(&str, FrameKind, &[u8]) -> Result<(), ConnectorError> + Send + Sync>;

/// Mailboxes of all open sockets, keyed by device ID. The registry is the
/// gate that enforces single-connection-per-device; this table only routes
/// writes.
#[derive(Default)]
pub struct SocketRegistry {
    sockets: DashMap<String, DeviceSender>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device_id: &str, sender: DeviceSender) {
        self.sockets.insert(device_id.to_string(), sender);
    }

    pub fn remove(&self, device_id: &str) {
        self.sockets.remove(device_id);
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.sockets.contains_key(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceSender> {
        self.sockets.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.sockets.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Shared state behind the connect endpoint, cloned into every upgrade.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<ConnectionRegistry>,
    pub sockets: Arc<SocketRegistry>,
    pub correlator: Arc<Correlator>,
    pub events: Arc<ConnectionEventBus>,
    pub authenticate: Authenticator,
    pub on_message: IncomingMessageHandler,
    pub shutting_down: Arc<AtomicBool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_follow_rfc_6455() {
        assert_eq!(CloseCode::NormalClosure.code(), 1000);
        assert_eq!(CloseCode::PolicyViolation.code(), 1008);
        assert_eq!(CloseCode::BadGateway.code(), 1014);
    }

    #[test]
    fn test_socket_registry_routes_by_device() {
        let registry = SocketRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.insert("d1", tx);

        assert!(registry.contains("d1"));
        assert_eq!(registry.device_ids(), vec!["d1".to_string()]);

        registry
            .get("d1")
            .unwrap()
            .send(Message::Text("hi".into()))
            .unwrap();
        assert!(matches!(rx.try_recv().unwrap(), Message::Text(_)));

        registry.remove("d1");
        assert!(registry.get("d1").is_none());
        assert!(registry.is_empty());
    }
}
