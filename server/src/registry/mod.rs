//! Thread-safe table of active device connections with per-device and
//! global traffic counters.

mod record;

pub use record::{DeviceConnection, DeviceConnectionSummary};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ConnectorError;

/// One record per connected device, keyed by device ID. All map mutation is
/// serialized under a single lock; the global totals are atomics so
/// aggregate reads never contend with the map.
///
/// The registry owns its records exclusively: [`get`](Self::get) and
/// [`connected_devices`](Self::connected_devices) return value copies.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, DeviceConnection>>,
    total_received: AtomicU64,
    total_sent: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new device connection. At most one record may exist per
    /// device ID at any instant.
    pub fn add(
        &self,
        connection_id: &str,
        device_id: &str,
        device_name: &str,
        device_type: &str,
        user_agent: &str,
        remote_address: &str,
    ) -> Result<(), ConnectorError> {
        let mut connections = self.connections.lock().expect("registry lock poisoned");

        if connections.contains_key(device_id) {
            return Err(ConnectorError::AlreadyConnected(device_id.to_string()));
        }

        connections.insert(
            device_id.to_string(),
            DeviceConnection::new(
                connection_id,
                device_id,
                device_name,
                device_type,
                user_agent,
                remote_address,
            ),
        );

        Ok(())
    }

    /// Removes a device's record. Idempotent: deleting an absent device is
    /// not an error.
    pub fn delete(&self, device_id: &str) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        connections.remove(device_id);
    }

    /// A value copy of the device's record.
    pub fn get(&self, device_id: &str) -> Result<DeviceConnection, ConnectorError> {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections
            .get(device_id)
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(device_id.to_string()))
    }

    /// Records an inbound message from the device: per-record counter,
    /// last-received timestamp and the global total.
    pub fn message_was_received(&self, device_id: &str) -> Result<(), ConnectorError> {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        let connection = connections
            .get_mut(device_id)
            .ok_or_else(|| ConnectorError::NotFound(device_id.to_string()))?;

        connection.message_received();
        self.total_received.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Records an outbound message to the device.
    pub fn message_was_sent(&self, device_id: &str) -> Result<(), ConnectorError> {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        let connection = connections
            .get_mut(device_id)
            .ok_or_else(|| ConnectorError::NotFound(device_id.to_string()))?;

        connection.message_sent();
        self.total_sent.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Messages received from a device. `0` for an unknown device.
    pub fn received_messages(&self, device_id: &str) -> u64 {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections
            .get(device_id)
            .map(DeviceConnection::received_messages)
            .unwrap_or(0)
    }

    /// Messages sent to a device. `0` for an unknown device.
    pub fn sent_messages(&self, device_id: &str) -> u64 {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections
            .get(device_id)
            .map(DeviceConnection::sent_messages)
            .unwrap_or(0)
    }

    pub fn total_received_messages(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    pub fn total_sent_messages(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub fn is_device_connected(&self, device_id: &str) -> bool {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.contains_key(device_id)
    }

    pub fn open_connections(&self) -> usize {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.len()
    }

    /// Freshly allocated summaries of every connected device. The copy is
    /// taken under the lock; the lock is released before returning.
    pub fn connected_devices(&self) -> Vec<DeviceConnectionSummary> {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.values().map(DeviceConnection::summary).collect()
    }
}
