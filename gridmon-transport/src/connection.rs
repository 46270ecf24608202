//! Broker connection management: pooling, epochs, and the declare/publish
//! surface the rest of the core uses.
//!
//! Multiple controllers may share one [`BrokerConnection`], so the
//! connect/close path is serialized behind a lock and every successful
//! (re)connect bumps a lock-free epoch counter. A component that cached
//! broker-side state (bindings, consumers) compares its remembered epoch
//! against [`BrokerConnection::epoch`] to notice that some other component
//! silently replaced the shared connection underneath it.

use crate::broker::{BrokerChannel, BrokerEndpoint};
use crate::config::ConnectionParams;
use crate::error::{Result, TransportError};
use crate::message::{Envelope, QueueArgs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// One managed connection to the broker.
///
/// Invariant: [`epoch`](Self::epoch) changes if and only if a new
/// underlying channel replaced the old one.
pub struct BrokerConnection {
    params: ConnectionParams,
    endpoint: Arc<dyn BrokerEndpoint>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    epoch: AtomicU64,
    stats: ConnectionCounters,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    messages_published: AtomicU64,
    messages_received: AtomicU64,
    connection_failures: AtomicU64,
}

/// Snapshot of a connection's activity counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Messages published through this connection
    pub messages_published: u64,
    /// Deliveries received through this connection
    pub messages_received: u64,
    /// Failed dial attempts
    pub connection_failures: u64,
}

impl BrokerConnection {
    /// Create an unconnected handle; call [`connect`](Self::connect) before
    /// use.
    pub fn new(endpoint: Arc<dyn BrokerEndpoint>, params: ConnectionParams) -> Self {
        Self {
            params,
            endpoint,
            channel: Mutex::new(None),
            epoch: AtomicU64::new(0),
            stats: ConnectionCounters::default(),
        }
    }

    /// Establish the connection.
    ///
    /// A no-op when already connected unless `force` is set, in which case
    /// the existing channel is closed and replaced. Every successful
    /// (re)connect increments the epoch. On failure the handle is left
    /// absent and the error propagates; callers decide whether to retry.
    #[instrument(skip(self), fields(endpoint = %self.params.endpoint()))]
    pub async fn connect(&self, force: bool) -> Result<()> {
        let mut guard = self.channel.lock().await;
        if guard.is_some() && !force {
            return Ok(());
        }
        self.redial(&mut guard).await
    }

    /// Force-reconnect, but only if no other sharer already replaced the
    /// channel since `observed_epoch` was read.
    ///
    /// Controllers racing to recover the same shared connection go through
    /// here so exactly one reconnect proceeds; the losers observe the epoch
    /// change and return `Ok(false)` instead of tearing down the channel
    /// the winner just established.
    pub async fn reconnect(&self, observed_epoch: u64) -> Result<bool> {
        let mut guard = self.channel.lock().await;
        if self.epoch() != observed_epoch {
            debug!(
                observed_epoch,
                current = self.epoch(),
                "connection already replaced, skipping reconnect"
            );
            return Ok(false);
        }
        self.redial(&mut guard).await?;
        Ok(true)
    }

    /// Replace whatever channel the slot holds with a freshly dialed one,
    /// bumping the epoch on success. Caller holds the connect/close lock.
    async fn redial(&self, slot: &mut Option<Arc<dyn BrokerChannel>>) -> Result<()> {
        if let Some(existing) = slot.take()
            && let Err(e) = existing.close().await
        {
            warn!(error = %e, "error closing stale channel before reconnect");
        }

        match self.endpoint.dial(&self.params).await {
            Ok(channel) => {
                *slot = Some(channel);
                let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
                info!(epoch, "broker connection established");
                Ok(())
            }
            Err(e) => {
                self.stats.connection_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Close the connection, leaving the handle absent. The epoch does not
    /// change; only a successful reconnect moves it.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.take() {
            channel.close().await?;
            debug!("broker connection closed");
        }
        Ok(())
    }

    /// Current connection epoch. Lock-free; safe to poll from any task.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Whether a live channel is currently held.
    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Parameters this connection was keyed under.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            connection_failures: self.stats.connection_failures.load(Ordering::Relaxed),
        }
    }

    /// Clone out the live channel without holding the connect/close lock
    /// across awaits on it.
    async fn live(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.channel
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| TransportError::transport("not connected"))
    }

    /// Wait up to `timeout` for the next delivery on any consumed queue;
    /// `Ok(None)` means the wait timed out without data.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let delivery = self.live().await?.receive(timeout).await?;
        if delivery.is_some() {
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(delivery)
    }

    /// Create or passively verify an exchange.
    pub async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.live().await?.declare_exchange(name).await
    }

    /// Create or passively verify a queue. The [`QueueArgs`] are policy
    /// knobs the broker enforces, not behavior this connection implements.
    pub async fn declare_queue(&self, name: &str, args: &QueueArgs) -> Result<()> {
        self.live().await?.declare_queue(name, args).await
    }

    /// Bind a queue to an exchange under a routing key.
    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.live().await?.bind_queue(queue, exchange, routing_key).await
    }

    /// Passively check that a queue exists.
    ///
    /// Do not call this from the same consumer path that is actively
    /// draining messages: on some broker implementations a passive check
    /// can itself consume pending events. Issue it from the publish side
    /// (as [`crate::egress::EgressDispatcher`] does), never between
    /// receive calls on a draining consumer.
    pub async fn queue_exists(&self, name: &str) -> Result<bool> {
        self.live().await?.queue_exists(name).await
    }

    /// Publish an envelope to an exchange.
    pub async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        self.live().await?.publish(exchange, envelope).await?;
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Start consuming a queue on this connection.
    pub async fn consume(&self, queue: &str) -> Result<()> {
        self.live().await?.consume(queue).await
    }

    /// Stop consuming a queue on this connection.
    pub async fn cancel(&self, queue: &str) -> Result<()> {
        self.live().await?.cancel(queue).await
    }
}

/// Owns the pool of shared connections, keyed by [`ConnectionParams`].
///
/// Two components checking out the same parameters receive the same
/// [`BrokerConnection`] instance; the epoch counter is the agreed-upon
/// freshness token between them. Pass the registry by reference wherever a
/// connection is needed instead of reaching for process-global state.
pub struct ConnectionRegistry {
    endpoint: Arc<dyn BrokerEndpoint>,
    pool: Mutex<HashMap<ConnectionParams, Arc<BrokerConnection>>>,
}

impl ConnectionRegistry {
    /// Create a registry dialing the given endpoint.
    pub fn new(endpoint: Arc<dyn BrokerEndpoint>) -> Self {
        Self {
            endpoint,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the shared connection for `params`, creating an unconnected
    /// handle on first use.
    pub async fn checkout(&self, params: &ConnectionParams) -> Arc<BrokerConnection> {
        let mut pool = self.pool.lock().await;
        Arc::clone(pool.entry(params.clone()).or_insert_with(|| {
            debug!(endpoint = %params.endpoint(), "pooling new broker connection");
            Arc::new(BrokerConnection::new(Arc::clone(&self.endpoint), params.clone()))
        }))
    }

    /// Create a private connection outside the pool for callers that must
    /// not share channel state.
    pub fn isolated(&self, params: &ConnectionParams) -> Arc<BrokerConnection> {
        Arc::new(BrokerConnection::new(
            Arc::clone(&self.endpoint),
            params.clone(),
        ))
    }

    /// Close every pooled connection and empty the pool.
    pub async fn close_all(&self) {
        let mut pool = self.pool.lock().await;
        for (params, connection) in pool.drain() {
            if let Err(e) = connection.close().await {
                warn!(endpoint = %params.endpoint(), error = %e, "error closing pooled connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EmbeddedBroker;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(EmbeddedBroker::new()))
    }

    #[tokio::test]
    async fn checkout_shares_by_params() {
        let registry = registry();
        let params = ConnectionParams::default();
        let a = registry.checkout(&params).await;
        let b = registry.checkout(&params).await;
        assert!(Arc::ptr_eq(&a, &b));

        let mut other = ConnectionParams::default();
        other.vhost = "/staging".to_string();
        let c = registry.checkout(&other).await;
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn isolated_bypasses_the_pool() {
        let registry = registry();
        let params = ConnectionParams::default();
        let shared = registry.checkout(&params).await;
        let private = registry.isolated(&params);
        assert!(!Arc::ptr_eq(&shared, &private));
    }

    #[tokio::test]
    async fn epoch_moves_only_on_successful_connect() {
        let registry = registry();
        let connection = registry.checkout(&ConnectionParams::default()).await;
        assert_eq!(connection.epoch(), 0);

        connection.connect(false).await.unwrap();
        assert_eq!(connection.epoch(), 1);

        // Already connected, not forced: no new channel, no epoch change.
        connection.connect(false).await.unwrap();
        assert_eq!(connection.epoch(), 1);

        connection.connect(true).await.unwrap();
        assert_eq!(connection.epoch(), 2);

        connection.close().await.unwrap();
        assert_eq!(connection.epoch(), 2);
    }

    #[tokio::test]
    async fn stale_epoch_reconnect_is_skipped() {
        let registry = registry();
        let connection = registry.checkout(&ConnectionParams::default()).await;
        connection.connect(false).await.unwrap();
        let observed = connection.epoch();

        // Another sharer got there first.
        connection.connect(true).await.unwrap();
        assert_eq!(connection.epoch(), observed + 1);

        // The loser's reconnect must not tear down the fresh channel.
        assert!(!connection.reconnect(observed).await.unwrap());
        assert_eq!(connection.epoch(), observed + 1);

        // With a current epoch the reconnect proceeds.
        assert!(connection.reconnect(observed + 1).await.unwrap());
        assert_eq!(connection.epoch(), observed + 2);
    }

    #[tokio::test]
    async fn failed_dial_leaves_handle_absent() {
        let registry = registry();
        let mut params = ConnectionParams::default();
        params.user = String::new();
        let connection = registry.checkout(&params).await;

        assert!(connection.connect(false).await.is_err());
        assert!(!connection.is_connected().await);
        assert_eq!(connection.epoch(), 0);
        assert_eq!(connection.stats().connection_failures, 1);
    }

    #[tokio::test]
    async fn operations_require_a_live_channel() {
        let registry = registry();
        let connection = registry.checkout(&ConnectionParams::default()).await;
        let err = connection
            .publish("gridmon", Envelope::unsequenced(Vec::new(), "k"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Transport(_)));
    }
}
