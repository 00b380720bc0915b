use chrono::Utc;
use serde::{Deserialize, Serialize};

/// In-memory descriptor of one active device session: a permanent,
/// bidirectional connection between the connector and an IoT device
/// (a sensor, an actuator, an edge server).
///
/// Records are owned exclusively by the [`ConnectionRegistry`]; everything
/// handed out is a value copy.
///
/// [`ConnectionRegistry`]: super::ConnectionRegistry
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    connection_id: String,
    device_id: String,
    device_name: String,
    device_type: String,
    user_agent: String,
    remote_address: String,
    created_at: i64,
    last_received_at: i64,
    last_sent_at: i64,
    received_messages: u64,
    sent_messages: u64,
}

impl DeviceConnection {
    pub fn new(
        connection_id: &str,
        device_id: &str,
        device_name: &str,
        device_type: &str,
        user_agent: &str,
        remote_address: &str,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            device_type: device_type.to_string(),
            user_agent: user_agent.to_string(),
            remote_address: remote_address.to_string(),
            created_at: Utc::now().timestamp(),
            last_received_at: 0,
            last_sent_at: 0,
            received_messages: 0,
            sent_messages: 0,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn received_messages(&self) -> u64 {
        self.received_messages
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages
    }

    /// Seconds this connection has been active. `created_at` is set at
    /// construction, so this is always well defined for a live record.
    pub fn uptime(&self) -> i64 {
        Utc::now().timestamp() - self.created_at
    }

    pub(super) fn message_received(&mut self) {
        self.received_messages += 1;
        self.last_received_at = Utc::now().timestamp();
    }

    pub(super) fn message_sent(&mut self) {
        self.sent_messages += 1;
        self.last_sent_at = Utc::now().timestamp();
    }

    pub fn summary(&self) -> DeviceConnectionSummary {
        DeviceConnectionSummary {
            connection_id: self.connection_id.clone(),
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            device_type: self.device_type.clone(),
            user_agent: self.user_agent.clone(),
            remote_address: self.remote_address.clone(),
            created_at: self.created_at,
            last_received_message: self.last_received_at,
            last_sent_message: self.last_sent_at,
            received_messages: self.received_messages,
            sent_messages: self.sent_messages,
        }
    }
}

/// Serializable snapshot of a [`DeviceConnection`], as returned by the
/// control API's device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConnectionSummary {
    pub connection_id: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub user_agent: String,
    pub remote_address: String,
    pub created_at: i64,
    pub last_received_message: i64,
    pub last_sent_message: i64,
    pub received_messages: u64,
    pub sent_messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_connection_has_creation_time_and_zeroed_counters() {
        let conn = DeviceConnection::new("c1", "d1", "thermo", "sensor", "esp32/1.0", "10.0.0.9");
        assert_ne!(conn.created_at(), 0);
        assert_eq!(conn.received_messages(), 0);
        assert_eq!(conn.sent_messages(), 0);
        assert!(conn.uptime() >= 0);
    }

    #[test]
    fn test_counters_track_traffic() {
        let mut conn = DeviceConnection::new("c1", "d1", "thermo", "sensor", "esp32/1.0", "10.0.0.9");
        conn.message_received();
        conn.message_received();
        conn.message_sent();
        assert_eq!(conn.received_messages(), 2);
        assert_eq!(conn.sent_messages(), 1);

        let summary = conn.summary();
        assert_eq!(summary.received_messages, 2);
        assert_ne!(summary.last_received_message, 0);
        assert_ne!(summary.last_sent_message, 0);
    }
}
