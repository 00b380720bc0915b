//! Minimal fieldlink embedder.
//!
//! Devices connect to ws://localhost:8080/connect with a `Device-Id`
//! header and an `Authorization: Bearer fieldlink-demo` token. Unsolicited
//! "PING" frames are logged as pongs; operators can reach the control API
//! on localhost:9090, e.g.
//!
//! ```sh
//! curl localhost:9090/cloud-connector/status
//! curl -X POST -d 'report' localhost:9090/devices/query/<device-id>
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use fieldlink_server::api::{ApiAuthentication, ControlApi, DefaultControlApi};
use fieldlink_server::connections::WebSocketsHandler;
use fieldlink_server::error::ConnectorError;
use fieldlink_server::registry::ConnectionRegistry;
use fieldlink_server::supervisor::Supervisor;
use fieldlink_server::ws::{Authenticator, IncomingMessageHandler};

const DEMO_TOKEN: &str = "Bearer fieldlink-demo";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("fieldlink_server=debug,fieldlink_pingpong=debug")
            }),
        )
        .init();

    let registry = Arc::new(ConnectionRegistry::new());

    let authenticate: Authenticator = Arc::new(|headers, peer| {
        let token = headers
            .get("Authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if token == DEMO_TOKEN {
            Ok(())
        } else {
            Err(ConnectorError::Unauthorized(format!(
                "bad or missing token from {peer}"
            )))
        }
    });

    let on_message: IncomingMessageHandler = Arc::new(|device_id, _kind, bytes| {
        if bytes == b"PING" {
            tracing::info!(device_id, "PING received, PONG to you too");
        } else {
            tracing::info!(
                device_id,
                payload = %String::from_utf8_lossy(bytes),
                "device message"
            );
        }
        Ok(())
    });

    let handler = WebSocketsHandler::new(
        "localhost",
        8080,
        "/connect",
        Duration::from_secs(8),
        Arc::clone(&registry),
        authenticate,
        on_message,
    );

    let control_api: Arc<dyn ControlApi> = Arc::new(DefaultControlApi::new(
        "localhost",
        9090,
        ApiAuthentication::None,
    ));

    let connector = Arc::new(Supervisor::new(
        registry,
        Arc::new(handler),
        Some(control_api),
        Duration::from_secs(10),
        Duration::from_secs(5),
    ));

    match connector.start().await {
        Ok(()) => {
            tracing::info!("finished shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}
