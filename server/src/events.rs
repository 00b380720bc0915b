//! Well-known bus topics and the connection lifecycle events published on
//! them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::EventBus;

/// A device completed its handshake and entered the registry.
pub const CONNECTION_ESTABLISHED_TOPIC: &str = "connections::established";
/// A device connection ended and left the registry.
pub const CONNECTION_CLOSED_TOPIC: &str = "connections::closed";
/// A system metric changed value since the last sampler tick.
pub const SYSTEM_METRICS_TOPIC: &str = "system_metrics::changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Established,
    Closed,
}

/// Lifecycle notification emitted by the connections handler every time a
/// device connects or disconnects. Embedders subscribe through the
/// handler's event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub id: String,
    pub device_id: String,
    pub remote_address: String,
    pub kind: ConnectionEventKind,
    pub timestamp: i64,
}

impl ConnectionEvent {
    pub fn established(device_id: &str, remote_address: &str) -> Self {
        Self::new(device_id, remote_address, ConnectionEventKind::Established)
    }

    pub fn closed(device_id: &str, remote_address: &str) -> Self {
        Self::new(device_id, remote_address, ConnectionEventKind::Closed)
    }

    fn new(device_id: &str, remote_address: &str, kind: ConnectionEventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            remote_address: remote_address.to_string(),
            kind,
            timestamp: Utc::now().timestamp(),
        }
    }
}

pub type ConnectionEventBus = EventBus<ConnectionEvent>;
