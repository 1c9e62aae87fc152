// src/config.rs

//! Manages node configuration: loading from TOML, defaults, and validation.

use crate::core::channel::DispatcherOptions;
use crate::core::connection::{ConnectionOptions, ReconnectPolicy};
use crate::core::router::Messages;
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Which broker implementation a node talks to.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// A RESP broker reachable over TCP.
    #[default]
    Tcp,
    /// An in-process broker; the node talks only to itself.
    Memory,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Empty means no authentication.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub operation_timeout: Option<Duration>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            host: default_broker_host(),
            port: default_broker_port(),
            password: None,
            pool_size: default_pool_size(),
            connect_timeout: None,
            operation_timeout: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelsConfig {
    /// Prefix of every physical channel name.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Logical channel carrying portal commands.
    #[serde(default = "default_portals_channel")]
    pub portals: String,
    #[serde(default)]
    pub echo_own_messages: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            portals: default_portals_channel(),
            echo_own_messages: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// The complete node configuration.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Name of this server within the fleet. Stamped on every published message.
    pub server_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Hex-dump every frame sent and received at debug level.
    #[serde(default)]
    pub debug_frames: bool,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub messages: Messages,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_broker_port() -> u16 {
    6379
}
fn default_pool_size() -> usize {
    8
}
fn default_namespace() -> String {
    "fleetsync:".to_string()
}
fn default_portals_channel() -> String {
    "portals".to_string()
}
fn default_metrics_port() -> u16 {
    9187
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Parses and validates configuration text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// A configuration for a node named `server_name` with every default applied.
    pub fn with_server_name(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            log_level: default_log_level(),
            debug_frames: false,
            broker: BrokerConfig::default(),
            channels: ChannelsConfig::default(),
            metrics: MetricsConfig::default(),
            messages: Messages::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(anyhow!("server_name cannot be empty"));
        }
        if self.broker.backend == BrokerBackend::Tcp {
            if self.broker.host.is_empty() {
                return Err(anyhow!("broker.host cannot be empty"));
            }
            if self.broker.port == 0 {
                return Err(anyhow!("broker.port cannot be 0"));
            }
        }
        if self.broker.pool_size == 0 {
            return Err(anyhow!("broker.pool_size cannot be 0"));
        }
        let reconnect = &self.broker.reconnect;
        if reconnect.initial_delay.is_zero() {
            return Err(anyhow!("broker.reconnect.initial_delay cannot be 0"));
        }
        if reconnect.max_delay < reconnect.initial_delay {
            return Err(anyhow!(
                "broker.reconnect.max_delay ({:?}) cannot be less than initial_delay ({:?})",
                reconnect.max_delay,
                reconnect.initial_delay
            ));
        }
        if self.channels.portals.is_empty() {
            return Err(anyhow!("channels.portals cannot be empty"));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0 when metrics are enabled"));
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            pool_size: self.broker.pool_size,
            operation_timeout: self.broker.operation_timeout,
            reconnect: ReconnectPolicy {
                initial_delay: self.broker.reconnect.initial_delay,
                max_delay: self.broker.reconnect.max_delay,
            },
        }
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            server_name: self.server_name.clone(),
            namespace: self.channels.namespace.clone(),
            echo_own_messages: self.channels.echo_own_messages,
            debug_frames: self.debug_frames,
        }
    }
}
