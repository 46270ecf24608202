//! Configuration for the transport core.
//!
//! This module provides the broker connection parameters and the tuning
//! surface for the ingress/egress machinery. Connection parameters double
//! as the pooling identity: two components constructing the same
//! [`ConnectionParams`] share one broker connection unless they explicitly
//! ask for an isolated one.

use crate::message::{QueueArgs, keys};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection parameters.
///
/// The full value (including credentials) is the identity key for
/// connection pooling; see [`crate::connection::ConnectionRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Broker hostname or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Authentication user
    pub user: String,
    /// Authentication password
    pub password: String,
    /// Virtual host to scope all declared objects under
    pub vhost: String,
    /// Heartbeat interval negotiated with the broker, if any
    pub heartbeat: Option<Duration>,
}

impl ConnectionParams {
    /// Display-safe endpoint description (no credentials).
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat: Some(Duration::from_secs(60)),
        }
    }
}

/// Tuning surface for the ingress/egress transport machinery.
///
/// # Examples
///
/// ```rust
/// use gridmon_transport::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig {
///     receive_timeout: Duration::from_millis(250),
///     buffer_capacity: 128,
///     tolerance_window: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Per-poll blocking budget for the broker receive call.
    ///
    /// Must stay below any external liveness-probe deadline the owning
    /// process is subject to.
    pub receive_timeout: Duration,

    /// Capacity of each per-stream reordering buffer (clamped to ≥ 1)
    pub buffer_capacity: usize,

    /// How long a reordering buffer waits on a sequence gap before skipping
    /// it; zero means wait forever
    pub tolerance_window: Duration,

    /// Exchange all gridmon streams are bound to
    pub exchange_name: String,

    /// Prefix for routing keys (`<prefix>.<stream>`)
    pub routing_key_prefix: String,

    /// Prefix for declared queue names (`<prefix>.<stream>`)
    pub queue_name_prefix: String,

    /// Bounded length of the egress retry cache; oldest entries are dropped
    /// on overflow
    pub retry_cache_size: usize,

    /// Declaration arguments applied to queues this core declares
    pub queue_args: QueueArgs,

    /// Cadence at which controller loop bodies run
    pub tick_interval: Duration,

    /// Base cooldown after a failed reconnect attempt (jitter is applied
    /// on top)
    pub reconnect_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(500),
            buffer_capacity: 64,
            tolerance_window: Duration::from_secs(5),
            exchange_name: "gridmon".to_string(),
            routing_key_prefix: keys::FEATURES_PREFIX.to_string(),
            queue_name_prefix: "gridmon.q".to_string(),
            retry_cache_size: 128,
            queue_args: QueueArgs::default(),
            tick_interval: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(2),
        }
    }
}

impl TransportConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration and returns any errors.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is invalid or would cause operational
    /// issues.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_timeout.is_zero() {
            anyhow::bail!("receive_timeout must be greater than 0");
        }

        if self.buffer_capacity == 0 {
            anyhow::bail!("buffer_capacity must be greater than 0");
        }

        if self.retry_cache_size == 0 {
            anyhow::bail!("retry_cache_size must be greater than 0");
        }

        if self.exchange_name.is_empty() {
            anyhow::bail!("exchange_name cannot be empty");
        }

        if self.routing_key_prefix.is_empty() {
            anyhow::bail!("routing_key_prefix cannot be empty");
        }

        if self.queue_name_prefix.is_empty() {
            anyhow::bail!("queue_name_prefix cannot be empty");
        }

        if self.tick_interval.is_zero() {
            anyhow::bail!("tick_interval must be greater than 0");
        }

        if self.reconnect_backoff.is_zero() {
            anyhow::bail!("reconnect_backoff must be greater than 0");
        }

        // Warn about potentially problematic configurations
        if self.buffer_capacity < 4 {
            tracing::warn!(
                "buffer_capacity is very small ({}), out-of-order messages will be evicted aggressively",
                self.buffer_capacity
            );
        }

        if self.receive_timeout > Duration::from_secs(5) {
            tracing::warn!(
                "receive_timeout is very large ({:?}), keep it below external liveness-probe deadlines",
                self.receive_timeout
            );
        }

        Ok(())
    }

    /// Sets the per-poll receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets the per-stream reordering buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the gap tolerance window (zero = wait forever).
    pub fn with_tolerance_window(mut self, window: Duration) -> Self {
        self.tolerance_window = window;
        self
    }

    /// Sets the egress retry cache bound.
    pub fn with_retry_cache_size(mut self, size: usize) -> Self {
        self.retry_cache_size = size;
        self
    }

    /// Routing key for a named stream.
    pub fn routing_key(&self, stream: &str) -> String {
        format!("{}.{}", self.routing_key_prefix, stream)
    }

    /// Queue name for a named stream.
    pub fn queue_name(&self, stream: &str) -> String {
        format!("{}.{}", self.queue_name_prefix, stream)
    }
}
