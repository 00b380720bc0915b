//! The connections handler: composes the websocket transport and the
//! correlator into a synchronous command/query channel per device.

mod websockets;

pub use websockets::WebSocketsHandler;

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ConnectorError;

/// An operator-initiated request expecting a correlated device reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub device_id: String,
    pub payload: String,
}

impl Command {
    pub fn new(device_id: &str, payload: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            payload: payload.to_string(),
        }
    }
}

/// Semantically identical to [`Command`]; kept separate for bookkeeping
/// and rate accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub device_id: String,
    pub payload: String,
}

impl Query {
    pub fn new(device_id: &str, payload: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            payload: payload.to_string(),
        }
    }
}

/// Contract between the supervisor and whatever handles device
/// connections.
///
/// `start` blocks until the listener stops. It reports the bound address
/// through `ready` once accepting; dropping `ready` without sending is the
/// startup-failure signal the supervisor acts on. On `shutdown` flipping
/// to `true` the handler drains its connections and then reports on
/// `shutdown_complete`.
#[async_trait]
pub trait ConnectionsHandler: Send + Sync {
    async fn start(
        &self,
        shutdown: watch::Receiver<bool>,
        shutdown_complete: mpsc::Sender<()>,
        ready: oneshot::Sender<SocketAddr>,
    ) -> Result<(), ConnectorError>;

    /// Forwards a command to the device and waits for its correlated
    /// reply. Outcomes map onto HTTP statuses via
    /// [`ConnectorError::http_status`]: success 200, not connected 404,
    /// timeout 408, transport error 400.
    async fn send_command(&self, command: Command) -> Result<String, ConnectorError>;

    /// Same contract as [`send_command`](Self::send_command).
    async fn send_query(&self, query: Query) -> Result<String, ConnectorError>;

    /// Commands still waiting for a device reply.
    fn commands_waiting(&self) -> usize;

    /// Queries still waiting for a device reply.
    fn queries_waiting(&self) -> usize;
}
