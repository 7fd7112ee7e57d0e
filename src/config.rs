use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::handle::DeliveryConfig;
use crate::ingest::ProducerLimits;
use crate::producer::ProducerPolicy;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,

    #[error("write timeout must be greater than zero")]
    ZeroWriteTimeout,

    #[error("max message size must be greater than zero")]
    ZeroMessageSize,

    #[error("producer ping interval must be greater than zero")]
    ZeroPingInterval,

    #[error("producer idle timeout ({idle_ms} ms) must exceed the ping interval ({ping_ms} ms)")]
    IdleTimeoutTooShort { idle_ms: u64, ping_ms: u64 },
}

/// Relay a live frame stream from one producer to many WebSocket viewers.
#[derive(Parser, Debug, Clone)]
#[command(name = "frame-relay", version, about)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Directory served for any path that is not a relay endpoint
    #[arg(long, env = "RELAY_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Frames buffered per subscriber before the oldest is dropped
    #[arg(long, env = "RELAY_QUEUE_CAPACITY", default_value_t = crate::handle::DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Give up on a subscriber write after this many milliseconds
    #[arg(long, env = "RELAY_WRITE_TIMEOUT_MS", default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Largest producer frame accepted, in bytes
    #[arg(long, env = "RELAY_MAX_MESSAGE_BYTES", default_value_t = crate::ingest::DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Ping an open producer connection this often, in milliseconds
    #[arg(long, env = "RELAY_PING_INTERVAL_MS", default_value_t = 5000)]
    pub ping_interval_ms: u64,

    /// Drop a producer that sends nothing, not even a pong, for this many
    /// milliseconds
    #[arg(long, env = "RELAY_PRODUCER_IDLE_TIMEOUT_MS", default_value_t = 15000)]
    pub producer_idle_timeout_ms: u64,

    /// How to treat a producer connecting while another is streaming
    #[arg(long, env = "RELAY_PRODUCER_POLICY", value_enum, default_value_t = ProducerPolicy::Exclusive)]
    pub producer_policy: ProducerPolicy,

    /// How long to wait for sessions to close on shutdown, in milliseconds
    #[arg(long, env = "RELAY_SHUTDOWN_GRACE_MS", default_value_t = 5000)]
    pub shutdown_grace_ms: u64,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub static_dir: Option<PathBuf>,
    pub delivery: DeliveryConfig,
    pub producer_limits: ProducerLimits,
    pub producer_policy: ProducerPolicy,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if cli.write_timeout_ms == 0 {
            return Err(ConfigError::ZeroWriteTimeout);
        }
        if cli.max_message_bytes == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }
        if cli.ping_interval_ms == 0 {
            return Err(ConfigError::ZeroPingInterval);
        }
        if cli.producer_idle_timeout_ms <= cli.ping_interval_ms {
            return Err(ConfigError::IdleTimeoutTooShort {
                idle_ms: cli.producer_idle_timeout_ms,
                ping_ms: cli.ping_interval_ms,
            });
        }
        Ok(Self {
            bind: cli.bind,
            static_dir: cli.static_dir,
            delivery: DeliveryConfig {
                queue_capacity: cli.queue_capacity,
                write_timeout: Duration::from_millis(cli.write_timeout_ms),
            },
            producer_limits: ProducerLimits {
                max_message_bytes: cli.max_message_bytes,
                ping_interval: Duration::from_millis(cli.ping_interval_ms),
                idle_timeout: Duration::from_millis(cli.producer_idle_timeout_ms),
            },
            producer_policy: cli.producer_policy,
            shutdown_grace: Duration::from_millis(cli.shutdown_grace_ms),
        })
    }
}
