// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network instance configuration.
//!
//! Configuration sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/opt/fleet/etc/tasknet.toml`
//! 3. TOML file from the `TASKNET_CONFIG_PATH` environment variable
//! 4. Environment variables (`TASKNET_*` prefixed), e.g. `TASKNET_ROLE=agent`
//!
//! The receive buffer and worker pool sizes default per role; leave them unset to pick up the
//! role default.

use std::net::SocketAddr;
use std::time::Duration;

use derive_builder::Builder;
use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::position::{BROADCAST_RANK, Position, Role};

const CONFIG_PATH_ENV: &str = "TASKNET_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/opt/fleet/etc/tasknet.toml";
const ENV_PREFIX: &str = "TASKNET_";

/// Variables sharing the prefix that belong to other subsystems.
const FOREIGN_ENV_KEYS: [&str; 5] = [
    "CONFIG_PATH",
    "LOG",
    "LOG_USE_LOCAL_TZ",
    "LOGGING_JSONL",
    "LOGGING_CONFIG_PATH",
];

pub const DEFAULT_MAX_CHILDREN: usize = 4096;
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_DELIVER_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_ADMISSION_RATE: u32 = 2_000;
pub const DEFAULT_ADMISSION_BURST: u32 = 4_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, Builder)]
#[builder(pattern = "owned")]
#[validate(schema(function = "validate_topology"))]
pub struct NetworkConfig {
    /// Role of this process; fixes its depth in the tree.
    pub role: Role,

    #[builder(setter(into))]
    #[serde(deserialize_with = "deserialize_rank")]
    pub server_rank: String,

    #[builder(setter(into))]
    #[serde(deserialize_with = "deserialize_rank")]
    pub process_rank: String,

    /// Address children connect to. None = no children accepted.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Parent address as `host:port` or `http://host:port`. None = no parent.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub parent_addr: Option<String>,

    /// Capacity of the local delivery buffer. None = role default.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    #[validate(range(min = 1))]
    pub recv_buffer: Option<usize>,

    /// Concurrent sends during a broadcast fan-out. None = role default.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    #[validate(range(min = 1))]
    pub pool_size: Option<usize>,

    #[builder(default = "DEFAULT_MAX_CHILDREN")]
    #[serde(default = "default_max_children")]
    #[validate(range(min = 1))]
    pub max_children: usize,

    #[builder(default = "DEFAULT_ACK_TIMEOUT_MS")]
    #[serde(default = "default_ack_timeout_ms")]
    #[validate(range(min = 1))]
    pub ack_timeout_ms: u64,

    /// Delay between join, announcement and stream attempts.
    #[builder(default = "DEFAULT_RETRY_DELAY_MS")]
    #[serde(default = "default_retry_delay_ms")]
    #[validate(range(min = 1))]
    pub retry_delay_ms: u64,

    /// Longest wait for room in a full local buffer.
    #[builder(default = "DEFAULT_DELIVER_TIMEOUT_MS")]
    #[serde(default = "default_deliver_timeout_ms")]
    #[validate(range(min = 1))]
    pub deliver_timeout_ms: u64,

    /// Sustained inbound unary calls per second.
    #[builder(default = "DEFAULT_ADMISSION_RATE")]
    #[serde(default = "default_admission_rate")]
    #[validate(range(min = 1))]
    pub admission_rate: u32,

    #[builder(default = "DEFAULT_ADMISSION_BURST")]
    #[serde(default = "default_admission_burst")]
    #[validate(range(min = 1))]
    pub admission_burst: u32,
}

fn default_max_children() -> usize {
    DEFAULT_MAX_CHILDREN
}

fn default_ack_timeout_ms() -> u64 {
    DEFAULT_ACK_TIMEOUT_MS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_deliver_timeout_ms() -> u64 {
    DEFAULT_DELIVER_TIMEOUT_MS
}

fn default_admission_rate() -> u32 {
    DEFAULT_ADMISSION_RATE
}

fn default_admission_burst() -> u32 {
    DEFAULT_ADMISSION_BURST
}

/// Ranks are strings on the wire but environment variables and TOML often carry them as numbers.
fn deserialize_rank<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Rank {
        Text(String),
        Number(i64),
    }

    Ok(match Rank::deserialize(deserializer)? {
        Rank::Text(text) => text,
        Rank::Number(number) => number.to_string(),
    })
}

fn validate_topology(config: &NetworkConfig) -> Result<(), ValidationError> {
    for rank in [&config.server_rank, &config.process_rank] {
        if rank.trim().is_empty() || rank == BROADCAST_RANK {
            return Err(ValidationError::new("rank")
                .with_message("ranks must be non-empty and concrete".into()));
        }
    }
    if config.role.is_root() && config.parent_addr.is_some() {
        return Err(ValidationError::new("parent_addr")
            .with_message("the controller is the root and has no parent".into()));
    }
    if config
        .parent_addr
        .as_deref()
        .is_some_and(|addr| addr.trim().is_empty())
    {
        return Err(ValidationError::new("parent_addr")
            .with_message("parent address must not be empty".into()));
    }
    Ok(())
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new(Position::new(Role::Worker, "0", "0"))
    }
}

impl NetworkConfig {
    /// Defaults for the given position, with no listen or parent address.
    pub fn new(position: Position) -> Self {
        Self {
            role: position.role,
            server_rank: position.server_rank,
            process_rank: position.process_rank,
            listen_addr: None,
            parent_addr: None,
            recv_buffer: None,
            pool_size: None,
            max_children: DEFAULT_MAX_CHILDREN,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            deliver_timeout_ms: DEFAULT_DELIVER_TIMEOUT_MS,
            admission_rate: DEFAULT_ADMISSION_RATE,
            admission_burst: DEFAULT_ADMISSION_BURST,
        }
    }

    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder::default()
    }

    pub fn position(&self) -> Position {
        Position::new(
            self.role,
            self.server_rank.trim(),
            self.process_rank.trim(),
        )
    }

    pub fn recv_buffer(&self) -> usize {
        self.recv_buffer.unwrap_or(match self.role {
            Role::Worker => 64,
            Role::Agent => 256,
            Role::Controller => 1024,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or(match self.role {
            Role::Worker => 4,
            Role::Agent => 16,
            Role::Controller => 64,
        })
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn deliver_timeout(&self) -> Duration {
        Duration::from_millis(self.deliver_timeout_ms)
    }

    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(NetworkConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&FOREIGN_ENV_KEYS)
                    .map(|k| k.as_str().to_lowercase().into()),
            )
    }

    /// Build a figment from defaults, then merge a custom provider with highest priority.
    ///
    /// # Example
    /// ```rust,ignore
    /// let figment = NetworkConfig::figment_with(("role", "agent"));
    /// let config = NetworkConfig::extract_from(figment)?;
    /// ```
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Load configuration from the default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}
