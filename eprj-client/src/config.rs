//! # Client Configuration
//!
//! Purpose: Collect the tunables of the factory, pool and façade in one
//! serde-friendly tree that can be loaded from JSON.
//!
//! ## Design Principles
//! 1. **Sensible Defaults**: Every field has a default matching the device.
//! 2. **Plain Units**: Durations are stored as milliseconds on the wire and
//!    exposed as `Duration` through accessors.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// TCP port the projector control service listens on.
pub const DEFAULT_PORT: u16 = 53595;

/// Greeting line sent by a projector that does not require a password.
pub const DEFAULT_GREETING: &str = "NOKEY";

/// Settings used when dialing and validating a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Port appended to every key.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on establishing the TCP stream.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Upper bound on receiving the greeting line.
    #[serde(default = "default_greeting_timeout_ms")]
    pub greeting_timeout_ms: u64,
    /// Exact greeting expected from the device.
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl FactoryConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        FactoryConfig {
            port: default_port(),
            dial_timeout_ms: default_dial_timeout_ms(),
            greeting_timeout_ms: default_greeting_timeout_ms(),
            greeting: default_greeting(),
        }
    }
}

/// Expiry policy for cached connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// A cached connection unused for longer than this is discarded.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// A cached connection older than this is discarded regardless of use.
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
    /// When set, a background task sweeps expired connections at this
    /// interval. Unset or zero means expiry is only checked on access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_ms: Option<u64>,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            sweep_interval_ms: None,
        }
    }
}

/// Complete configuration for a [`crate::ProjectorClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub factory: FactoryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Deadline applied separately to the write and the read of a command.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            factory: FactoryConfig::default(),
            pool: PoolConfig::default(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Parses a configuration from JSON text. Missing fields take defaults.
    pub fn from_json_str(text: &str) -> ClientResult<Self> {
        serde_json::from_str(text).map_err(ClientError::from)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_greeting_timeout_ms() -> u64 {
    60_000
}

fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}

fn default_idle_timeout_ms() -> u64 {
    40_000
}

fn default_max_lifetime_ms() -> u64 {
    45_000
}

fn default_command_timeout_ms() -> u64 {
    3_000
}
