use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Fieldlink IoT cloud connector
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "fieldlink-server", version, about = "Fieldlink IoT cloud connector")]
pub struct Config {
    /// Bind address for the device websocket listener
    #[arg(long, env = "FIELDLINK_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Port for the device websocket listener
    #[arg(long, env = "FIELDLINK_PORT", default_value = "8080")]
    pub port: u16,

    /// Listener network: tcp, tcp4 or tcp6
    #[arg(long, env = "FIELDLINK_NETWORK", default_value = "tcp")]
    pub network: String,

    /// Path of the websocket connect endpoint
    #[arg(long, env = "FIELDLINK_CONNECT_PATH", default_value = "/connect")]
    pub connect_path: String,

    /// TLS certificate path (PEM). TLS is enabled when both certificate and key are set
    #[arg(long, env = "FIELDLINK_CERTIFICATE_PATH")]
    pub certificate_path: Option<String>,

    /// TLS private key path (PEM)
    #[arg(long, env = "FIELDLINK_KEY_PATH")]
    pub key_path: Option<String>,

    /// Seconds a command/query waits for the device reply
    #[arg(long, env = "FIELDLINK_REQUEST_TIMEOUT", default_value = "8")]
    pub request_timeout: u64,

    /// Seconds between system metric samples published to the status stream
    #[arg(long, env = "FIELDLINK_METRICS_INTERVAL", default_value = "5")]
    pub metrics_interval: u64,

    /// Seconds the supervisor waits for subsystems to drain on shutdown
    #[arg(long, env = "FIELDLINK_SHUTDOWN_TIMEOUT", default_value = "10")]
    pub shutdown_timeout: u64,

    /// Log level: panic, fatal, error, warn, info, debug or trace
    #[arg(long, env = "FIELDLINK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "FIELDLINK_JSON_LOGS")]
    pub json_logs: bool,

    /// Serve the operator control API
    #[arg(
        long,
        env = "FIELDLINK_API_ENABLED",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    pub api_enabled: bool,

    /// Bind address for the control API
    #[arg(long, env = "FIELDLINK_API_ADDRESS", default_value = "0.0.0.0")]
    pub api_address: String,

    /// Port for the control API
    #[arg(long, env = "FIELDLINK_API_PORT", default_value = "9090")]
    pub api_port: u16,

    /// Control API basic-auth username (with api_password, selects static basic auth)
    #[arg(long, env = "FIELDLINK_API_USERNAME")]
    pub api_username: Option<String>,

    /// Control API basic-auth password
    #[arg(long, env = "FIELDLINK_API_PASSWORD")]
    pub api_password: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./fieldlink.toml")]
    pub config: String,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            network: "tcp".to_string(),
            connect_path: "/connect".to_string(),
            certificate_path: None,
            key_path: None,
            request_timeout: 8,
            metrics_interval: 5,
            shutdown_timeout: 10,
            log_level: "info".to_string(),
            json_logs: false,
            api_enabled: true,
            api_address: "0.0.0.0".to_string(),
            api_port: 9090,
            api_username: None,
            api_password: None,
            config: "./fieldlink.toml".to_string(),
            generate_config: false,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (FIELDLINK_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("FIELDLINK_"))
            .merge(Serialized::defaults(cli))
            .extract()?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), figment::Error> {
        match self.network.as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(()),
            other => Err(figment::Error::from(format!(
                "network must be tcp, tcp4 or tcp6, got {other}"
            ))),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Directive for tracing's `EnvFilter`. The `panic` and `fatal` levels of
    /// the config surface have no tracing equivalent and collapse to `error`.
    pub fn log_directive(&self) -> &str {
        match self.log_level.as_str() {
            "panic" | "fatal" | "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Fieldlink IoT Cloud Connector Configuration
# Place this file at ./fieldlink.toml or specify with --config <path>
# All settings can be overridden via environment variables (FIELDLINK_PORT, etc.)
# or CLI flags (--port, etc.)

# Device websocket listener (default: 0.0.0.0:8080)
# address = "0.0.0.0"
# port = 8080

# Listener network: tcp, tcp4 or tcp6
# network = "tcp"

# Websocket connect endpoint path
# connect_path = "/connect"

# TLS: devices connect via wss when both paths are set
# certificate_path = "/etc/fieldlink/cert.pem"
# key_path = "/etc/fieldlink/key.pem"

# Seconds a command/query waits for the device reply (default: 8)
# request_timeout = 8

# Seconds between system metric samples (default: 5)
# metrics_interval = 5

# Seconds the supervisor waits for subsystems to drain (default: 10)
# shutdown_timeout = 10

# Log level: panic, fatal, error, warn, info, debug or trace
# log_level = "info"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Operator control API (default: enabled on 0.0.0.0:9090)
# api_enabled = true
# api_address = "0.0.0.0"
# api_port = 9090

# Setting both selects static basic auth for the control API
# api_username = "operator"
# api_password = "secret"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Toml};

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.connect_path, "/connect");
        assert_eq!(config.request_timeout(), Duration::from_secs(8));
        assert_eq!(config.metrics_interval(), Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_directive_collapses_unknown_levels() {
        let mut config = Config::default();
        config.log_level = "fatal".to_string();
        assert_eq!(config.log_directive(), "error");
        config.log_level = "verbose".to_string();
        assert_eq!(config.log_directive(), "info");
    }

    #[test]
    fn test_invalid_network_rejected() {
        let mut config = Config::default();
        config.network = "udp".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_layer_overrides_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("port = 1700\nrequest_timeout = 2"))
            .extract()
            .unwrap();
        assert_eq!(config.port, 1700);
        assert_eq!(config.request_timeout(), Duration::from_secs(2));
        assert_eq!(config.metrics_interval, 5);
    }
}
