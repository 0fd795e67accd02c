//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default bounds of the playfield
pub const DEFAULT_SCREEN_WIDTH: f64 = 400.0;
/// Default maximum position change a single update may declare
pub const DEFAULT_ALLOWED_DELTA: f64 = 0.1;
/// Default broadcast cadence in milliseconds
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 200;
/// Default speed assigned to a freshly admitted player
pub const DEFAULT_INITIAL_SPEED: f64 = 1.0;
/// Default inbound messages per second per connection
pub const DEFAULT_INPUT_RATE_LIMIT: u32 = 30;
/// Default time a single outbound write may stall before the session ends
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
/// Default time allowed for sessions to release at shutdown
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Output format of the log subscriber
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Movement and cadence constants shared by every session
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Positions live in `[0, screen_width)`
    pub screen_width: f64,
    /// Largest accepted difference between the stored and the declared position
    pub allowed_delta: f64,
    /// Broadcast cadence; also the time step of direction-driven movement
    pub broadcast_interval: Duration,
    /// Speed assigned on admission
    pub initial_speed: f64,
    /// Inbound messages allowed per second per connection
    pub input_rate_limit: u32,
    /// A write that makes no progress for this long ends the session
    pub write_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            screen_width: DEFAULT_SCREEN_WIDTH,
            allowed_delta: DEFAULT_ALLOWED_DELTA,
            broadcast_interval: Duration::from_millis(DEFAULT_BROADCAST_INTERVAL_MS),
            initial_speed: DEFAULT_INITIAL_SPEED,
            input_rate_limit: DEFAULT_INPUT_RATE_LIMIT,
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
        }
    }
}

impl SyncConfig {
    /// Reject values that would break the position invariant
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.screen_width.is_finite() && self.screen_width > 0.0) {
            return Err(ConfigError::OutOfRange("SCREEN_WIDTH"));
        }
        if !(self.allowed_delta.is_finite() && self.allowed_delta >= 0.0) {
            return Err(ConfigError::OutOfRange("ALLOWED_DELTA"));
        }
        if self.broadcast_interval.is_zero() {
            return Err(ConfigError::OutOfRange("BROADCAST_INTERVAL_MS"));
        }
        if !(self.initial_speed.is_finite() && self.initial_speed > 0.0) {
            return Err(ConfigError::OutOfRange("INITIAL_SPEED"));
        }
        if self.input_rate_limit == 0 {
            return Err(ConfigError::OutOfRange("INPUT_RATE_LIMIT"));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::OutOfRange("WRITE_TIMEOUT_MS"));
        }
        Ok(())
    }
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Human readable or JSON log lines
    pub log_format: LogFormat,
    /// Allowed client origins for CORS, any origin when unset
    pub client_origin: Option<String>,
    /// How long shutdown waits for sessions to release their connections
    pub shutdown_grace: Duration,
    /// Movement policy and broadcast cadence
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            screen_width: parse_var(&lookup, "SCREEN_WIDTH")?.unwrap_or(defaults.screen_width),
            allowed_delta: parse_var(&lookup, "ALLOWED_DELTA")?.unwrap_or(defaults.allowed_delta),
            broadcast_interval: parse_var(&lookup, "BROADCAST_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.broadcast_interval),
            initial_speed: parse_var(&lookup, "INITIAL_SPEED")?.unwrap_or(defaults.initial_speed),
            input_rate_limit: parse_var(&lookup, "INPUT_RATE_LIMIT")?
                .unwrap_or(defaults.input_rate_limit),
            write_timeout: parse_var(&lookup, "WRITE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.write_timeout),
        };
        sync.validate()?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: parse_var(&lookup, "LOG_FORMAT")?.unwrap_or(LogFormat::Pretty),

            client_origin: lookup("CLIENT_ORIGIN").filter(|s| !s.trim().is_empty()),

            shutdown_grace: Duration::from_secs(
                parse_var(&lookup, "SHUTDOWN_GRACE_SECS")?.unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),

            sync,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("Value out of range for {0}")]
    OutOfRange(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
