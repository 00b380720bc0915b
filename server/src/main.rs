use std::process::ExitCode;
use std::sync::Arc;

use fieldlink_server::api::{ApiAuthentication, ControlApi, DefaultControlApi};
use fieldlink_server::config::{generate_config_template, Config};
use fieldlink_server::connections::WebSocketsHandler;
use fieldlink_server::registry::ConnectionRegistry;
use fieldlink_server::supervisor::Supervisor;
use fieldlink_server::ws::{Authenticator, IncomingMessageHandler};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return ExitCode::SUCCESS;
    }

    init_tracing(&config);

    tracing::info!("fieldlink-server v{} starting", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(ConnectionRegistry::new());

    // The standalone binary accepts every device; embedders using the
    // library inject their own authenticator.
    let authenticate: Authenticator = Arc::new(|_headers, _peer| Ok(()));

    // Uncorrelated device traffic is logged; embedders plug their own
    // handler here.
    let on_message: IncomingMessageHandler = Arc::new(|device_id, _kind, bytes| {
        tracing::info!(device_id, size = bytes.len(), "unsolicited device message");
        Ok(())
    });

    let mut handler = WebSocketsHandler::new(
        &config.address,
        config.port,
        &config.connect_path,
        config.request_timeout(),
        Arc::clone(&registry),
        authenticate,
        on_message,
    );
    if let (Some(certificate), Some(key)) = (&config.certificate_path, &config.key_path) {
        handler = handler.with_tls(certificate, key);
    }

    let control_api: Option<Arc<dyn ControlApi>> = if config.api_enabled {
        let auth = match (&config.api_username, &config.api_password) {
            (Some(username), Some(password)) => ApiAuthentication::StaticBasic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => ApiAuthentication::None,
        };
        Some(Arc::new(DefaultControlApi::new(
            &config.api_address,
            config.api_port,
            auth,
        )))
    } else {
        None
    };

    let connector = Arc::new(Supervisor::new(
        registry,
        Arc::new(handler),
        control_api,
        config.shutdown_timeout(),
        config.metrics_interval(),
    ));

    match connector.start().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("fieldlink_server={}", config.log_directive()))
    });

    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
