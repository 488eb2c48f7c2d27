//! Session configuration using Figment.
//!
//! Configuration is layered:
//! 1. Defaults of the selected [`DeviceProfile`]
//! 2. A TOML file (optional)
//! 3. Environment variables prefixed with `INSTRUMENT_SESSION_`, nested keys
//!    separated by `__` (e.g. `INSTRUMENT_SESSION_QUERY__TIMEOUT=2s`)
//!
//! Durations are written in humantime form (`"200ms"`, `"1s"`).
//!
//! # Example
//! ```no_run
//! use instrument_session::config::{DeviceProfile, SessionConfig};
//!
//! let config = SessionConfig::load(Some("config/pump.toml".as_ref()), DeviceProfile::Pump)?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::codec::{Classification, CodecKind};
use crate::error::{SessionError, SessionResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "INSTRUMENT_SESSION_";

/// Top-level session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Device address: serial port path or `host:port`
    #[serde(default)]
    pub address: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Transport settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Wire format
    #[serde(default)]
    pub codec: CodecKind,
    /// Query timing and retry policy
    #[serde(default)]
    pub query: QueryConfig,
    /// Background status polling
    #[serde(default)]
    pub feedback: FeedbackConfig,
}

/// Transport settings consumed by a [`Connector`](crate::transport::Connector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Baud rate (ignored by socket transports)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Open / connect timeout
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Byte that terminates each reply line
    #[serde(default = "default_line_delimiter")]
    pub line_delimiter: char,
}

/// Timing and retry policy for foreground queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Budget for a matching reply
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause after each command, once the transport is released
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Budget of a single `read_line` inside the read loop
    #[serde(default = "default_read_slice", with = "humantime_serde")]
    pub read_slice: Duration,
    /// Longest wait for exclusive transport access
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Resend once when the device reports a retryable fault (e.g. drive busy)
    #[serde(default = "default_true")]
    pub retry_on_busy: bool,
    /// Discard stale input before writing a frame
    #[serde(default = "default_true")]
    pub drain_before_write: bool,
}

/// Background status polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Status query codes polled each cycle; empty disables polling on connect
    #[serde(default)]
    pub codes: Vec<String>,
    /// Pause between poll cycles
    #[serde(default = "default_feedback_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound on waiting for the poller to exit
    #[serde(default = "default_join_timeout", with = "humantime_serde")]
    pub join_timeout: Duration,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_line_delimiter() -> char {
    '\n'
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_read_slice() -> Duration {
    Duration::from_millis(100)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_feedback_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            timeout: default_connection_timeout(),
            line_delimiter: default_line_delimiter(),
        }
    }
}

impl ConnectionConfig {
    /// Line delimiter as a byte.
    pub fn delimiter_byte(&self) -> u8 {
        u8::try_from(self.line_delimiter).unwrap_or(b'\n')
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: default_query_timeout(),
            settle_delay: default_settle_delay(),
            read_slice: default_read_slice(),
            acquire_timeout: default_acquire_timeout(),
            retry_on_busy: true,
            drain_before_write: true,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            codes: Vec::new(),
            interval: default_feedback_interval(),
            join_timeout: default_join_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        DeviceProfile::Pump.defaults()
    }
}

/// Presets matching the device families this crate was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    /// rLine pipette pump: 9600 baud, polls `DS` and `DN` every 200 ms
    #[default]
    Pump,
    /// Mass balance: 115200 baud, address-framed, no polling unless configured
    Balance,
    /// DMA instrument: 115200 baud, template-framed, no polling
    Dma,
}

impl DeviceProfile {
    /// Default configuration for this profile.
    pub fn defaults(self) -> SessionConfig {
        match self {
            DeviceProfile::Pump => SessionConfig {
                address: String::new(),
                log_level: default_log_level(),
                connection: ConnectionConfig {
                    baud_rate: 9600,
                    timeout: Duration::from_secs(1),
                    line_delimiter: '\r',
                },
                codec: CodecKind::Address { channel: 1 },
                query: QueryConfig::default(),
                feedback: FeedbackConfig {
                    codes: vec!["DS".to_string(), "DN".to_string()],
                    ..FeedbackConfig::default()
                },
            },
            DeviceProfile::Balance => SessionConfig {
                address: String::new(),
                log_level: default_log_level(),
                connection: ConnectionConfig {
                    baud_rate: 115200,
                    timeout: Duration::from_secs(1),
                    line_delimiter: '\n',
                },
                codec: CodecKind::Address { channel: 1 },
                query: QueryConfig {
                    timeout: Duration::from_secs(2),
                    ..QueryConfig::default()
                },
                feedback: FeedbackConfig::default(),
            },
            DeviceProfile::Dma => SessionConfig {
                address: String::new(),
                log_level: default_log_level(),
                connection: ConnectionConfig {
                    baud_rate: 115200,
                    timeout: Duration::from_secs(1),
                    line_delimiter: '\n',
                },
                codec: CodecKind::Template { channel: 1 },
                query: QueryConfig {
                    // INIT, CLR, CLAMP and GET can take up to a minute to complete
                    timeout: Duration::from_secs(60),
                    retry_on_busy: false,
                    ..QueryConfig::default()
                },
                feedback: FeedbackConfig::default(),
            },
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceProfile::Pump => "pump",
            DeviceProfile::Balance => "balance",
            DeviceProfile::Dma => "dma",
        };
        f.write_str(label)
    }
}

impl FromStr for DeviceProfile {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pump" => Ok(DeviceProfile::Pump),
            "balance" => Ok(DeviceProfile::Balance),
            "dma" => Ok(DeviceProfile::Dma),
            other => Err(SessionError::Config(format!(
                "Unknown device profile '{}'. Must be one of: pump, balance, dma",
                other
            ))),
        }
    }
}

impl SessionConfig {
    /// Load configuration: profile defaults, then `path` (if any), then environment.
    pub fn load(path: Option<&Path>, profile: DeviceProfile) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(profile.defaults()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()
    }

    /// Load configuration from a TOML string on top of profile defaults.
    pub fn from_toml_str(toml: &str, profile: DeviceProfile) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(profile.defaults()))
            .merge(Toml::string(toml))
            .extract()
    }

    /// Render as TOML (used by the CLI to show the effective configuration).
    pub fn to_toml(&self) -> SessionResult<String> {
        toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> SessionResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(SessionError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.address.trim().is_empty() {
            return Err(SessionError::Config("address must not be empty".to_string()));
        }

        if !self.connection.line_delimiter.is_ascii() {
            return Err(SessionError::Config(format!(
                "line_delimiter must be ASCII, got {:?}",
                self.connection.line_delimiter
            )));
        }

        if self.query.read_slice.is_zero() {
            return Err(SessionError::Config("query.read_slice must be > 0".to_string()));
        }

        if self.feedback.interval.is_zero() {
            return Err(SessionError::Config(
                "feedback.interval must be > 0".to_string(),
            ));
        }

        let codec = self.codec.build()?;
        for code in &self.feedback.codes {
            codec.validate(code)?;
            if codec.classify(code) != Classification::StatusQuery {
                return Err(SessionError::Config(format!(
                    "feedback code '{}' is not a status query",
                    code
                )));
            }
        }

        Ok(())
    }
}
