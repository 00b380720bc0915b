use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::DeviceConnectionSummary;

/// GET /cloud-connector/status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub server_current_state: String,
    pub uptime: i64,
    pub received_messages_per_second: f64,
    pub sent_messages_per_second: f64,
    pub metrics: HashMap<String, String>,
}

/// GET /devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesListPayload {
    pub devices: Vec<DeviceConnectionSummary>,
}

/// GET /devices/{device_id}/show
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceShowPayload {
    pub uptime: i64,
    pub received_messages: u64,
    pub received_messages_per_second: f64,
    pub sent_messages: u64,
    pub sent_messages_per_second: f64,
}

/// POST /devices/command/{device_id} and /devices/query/{device_id}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResponsePayload {
    pub response: String,
    pub errors: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}
