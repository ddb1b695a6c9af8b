//! Configuration for the simulator
//!
//! All values have sensible defaults; a `Config` can also be deserialized
//! from JSON for embedding in test harness fixtures.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CassetteError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server-wide settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Address resolver settings
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Server-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Total budget in milliseconds for binding all listeners of a register call
    #[serde(default = "default_bind_timeout_ms")]
    pub bind_timeout_ms: u64,

    /// Whether observed requests are appended to the per-cluster activity log
    #[serde(default = "default_true")]
    pub activity_logging: bool,
}

/// Address resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// First loopback IP handed out
    #[serde(default = "default_start_ip")]
    pub start_ip: Ipv4Addr,

    /// Port used for every generated address
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_start_ip() -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, 1)
}

fn default_port() -> u16 {
    9042
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_timeout_ms: default_bind_timeout_ms(),
            activity_logging: default_true(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            start_ip: default_start_ip(),
            port: default_port(),
        }
    }
}

impl Config {
    /// Validate the configuration, returning an error describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.server.bind_timeout_ms == 0 {
            return Err(CassetteError::Config(
                "server.bind_timeout_ms must be non-zero".to_string(),
            ));
        }
        if !self.resolver.start_ip.is_loopback() {
            return Err(CassetteError::Config(format!(
                "resolver.start_ip must be a loopback address, got {}",
                self.resolver.start_ip
            )));
        }
        Ok(())
    }

    /// The bind budget as a `Duration`
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.server.bind_timeout_ms)
    }
}
