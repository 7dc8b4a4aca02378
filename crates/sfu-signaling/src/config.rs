//! SFU signaling configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default; a value that is present but unparseable is an error rather than
//! silently replaced.

use crate::engine::{LoopbackSettings, WebRtcTransportOptions};
use crate::gateway::GatewaySettings;

use common::config::{LogFormat, ObservabilityConfig};
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health/metrics endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default local address WebRTC transports listen on.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default address advertised in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default RTC port range of the media worker.
pub const DEFAULT_RTC_MIN_PORT: u16 = 2000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 2020;

/// Default wait for DTLS to connect after `connect-transport`.
pub const DEFAULT_TRANSPORT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default delay between a fatal engine error and process exit.
pub const DEFAULT_FATAL_EXIT_DELAY_MS: u64 = 2_000;

/// Default limit on concurrently connected peers.
pub const DEFAULT_MAX_PEERS: usize = 1000;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sfu";

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "sfu_signaling=debug,tower_http=debug";

/// SFU signaling configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Address WebRTC transports listen on.
    pub listen_ip: IpAddr,

    /// Address advertised to clients; `None` when `SFU_ANNOUNCED_IP` is empty.
    pub announced_ip: Option<IpAddr>,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    pub transport_connect_timeout: Duration,

    /// Grace period for logs to flush before a fatal exit.
    pub fatal_exit_delay: Duration,

    /// Connections beyond this are refused with `capacity-exceeded`.
    pub max_peers: usize,

    /// Unique identifier for this SFU instance.
    pub instance_id: String,

    pub observability: ObservabilityConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let listen_ip = parse_or(vars, "SFU_LISTEN_IP", DEFAULT_LISTEN_IP.parse().ok())?;

        let announced_ip = match vars.get("SFU_ANNOUNCED_IP").map(|s| s.trim()) {
            Some("") => None,
            Some(value) => Some(value.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("SFU_ANNOUNCED_IP={value}: {e}"))
            })?),
            None => DEFAULT_ANNOUNCED_IP.parse().ok(),
        };

        let rtc_min_port = parse_or(vars, "SFU_RTC_MIN_PORT", Some(DEFAULT_RTC_MIN_PORT))?;
        let rtc_max_port = parse_or(vars, "SFU_RTC_MAX_PORT", Some(DEFAULT_RTC_MAX_PORT))?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) must not exceed SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let transport_connect_timeout = Duration::from_millis(parse_or(
            vars,
            "SFU_TRANSPORT_CONNECT_TIMEOUT_MS",
            Some(DEFAULT_TRANSPORT_CONNECT_TIMEOUT_MS),
        )?);

        let fatal_exit_delay = Duration::from_millis(parse_or(
            vars,
            "SFU_FATAL_EXIT_DELAY_MS",
            Some(DEFAULT_FATAL_EXIT_DELAY_MS),
        )?);

        let max_peers = parse_or(vars, "SFU_MAX_PEERS", Some(DEFAULT_MAX_PEERS))?;
        if max_peers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_MAX_PEERS must be at least 1".to_string(),
            ));
        }

        let log_format = vars
            .get("SFU_LOG_FORMAT")
            .map(|s| s.parse::<LogFormat>())
            .transpose()
            .map_err(|e| ConfigError::InvalidValue(format!("SFU_LOG_FORMAT: {e}")))?
            .unwrap_or_default();

        // Generate instance ID
        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().simple().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            listen_ip,
            announced_ip,
            rtc_min_port,
            rtc_max_port,
            transport_connect_timeout,
            fatal_exit_delay,
            max_peers,
            instance_id,
            observability: ObservabilityConfig {
                log_filter: DEFAULT_LOG_FILTER.to_string(),
                log_format,
            },
        })
    }

    /// Network parameters for every WebRTC transport.
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip,
            ..WebRtcTransportOptions::default()
        }
    }

    #[must_use]
    pub fn loopback_settings(&self) -> LoopbackSettings {
        LoopbackSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    #[must_use]
    pub fn gateway_settings(&self) -> GatewaySettings {
        let mut settings = GatewaySettings::new(self.transport_options());
        settings.connect_timeout = self.transport_connect_timeout;
        settings
    }
}

/// Parse `name` if set, otherwise fall back to `default`.
fn parse_or<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: Option<T>,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}={value}: {e}"))),
        None => default.ok_or_else(|| ConfigError::MissingEnvVar(name.to_string())),
    }
}
