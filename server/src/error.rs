use std::time::Duration;

use axum::http::StatusCode;

/// Error kinds surfaced by the connector core. The control API maps these
/// onto HTTP status codes via [`ConnectorError::http_status`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// A device with the same ID already holds an active connection.
    #[error("device {0} is already connected")]
    AlreadyConnected(String),

    /// The device has no record in the connection registry.
    #[error("device {0} not found")]
    NotFound(String),

    /// Fast-path rejection: the device has no open socket right now.
    #[error("device {0} is not connected")]
    NotConnected(String),

    /// The device did not reply to a command/query within the deadline.
    #[error("device {device_id} did not reply within {timeout:?}")]
    Timeout { device_id: String, timeout: Duration },

    /// Writing to or reading from the device socket failed.
    #[error("transport failure for device {device_id}: {reason}")]
    Transport { device_id: String, reason: String },

    /// The embedder-supplied authenticator rejected the connection.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A subsystem did not acknowledge shutdown within the bounded drain.
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// Publish or unsubscribe on a topic nobody has ever subscribed to.
    #[error("topic {0} does not exist")]
    NoSuchTopic(String),

    /// A subsystem failed before it became operational.
    #[error("startup failed: {0}")]
    Startup(String),
}

impl ConnectorError {
    /// The HTTP status the control API reports for this error.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ConnectorError::NotFound(_) | ConnectorError::NotConnected(_) => {
                StatusCode::NOT_FOUND
            }
            ConnectorError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            ConnectorError::Transport { .. } => StatusCode::BAD_REQUEST,
            ConnectorError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ConnectorError::AlreadyConnected(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            ConnectorError::NotConnected("d1".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ConnectorError::Timeout {
                device_id: "d1".into(),
                timeout: Duration::from_secs(8)
            }
            .http_status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ConnectorError::Transport {
                device_id: "d1".into(),
                reason: "socket closed".into()
            }
            .http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ConnectorError::Unauthorized("bad credentials".into()).http_status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
