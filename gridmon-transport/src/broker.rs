//! Broker contract and the embedded in-process broker.
//!
//! The transport core talks to the broker through two narrow seams:
//! [`BrokerEndpoint`] ("something we can dial") and [`BrokerChannel`] ("one
//! live, bound channel"). Everything above the seam — pooling, epochs,
//! reordering, controllers — is broker-agnostic.
//!
//! [`EmbeddedBroker`] is the in-process implementation: a direct-routing
//! broker with exchanges, bound queues, per-queue overflow policy,
//! max-length, message TTL, and consumer-idle expiry. It runs inside the
//! owning process so the transport core can be exercised, deployed in
//! single-node setups, and tested without an external broker daemon.

use crate::config::ConnectionParams;
use crate::error::{Result, TransportError};
use crate::message::{Envelope, OverflowPolicy, QueueArgs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of a channel's delivery stream before the broker parks
/// messages in the queue instead.
const DELIVERY_DEPTH: usize = 1024;

/// A broker the transport layer can dial.
#[async_trait]
pub trait BrokerEndpoint: Send + Sync {
    /// Open a fresh channel authenticated by `params`.
    async fn dial(&self, params: &ConnectionParams) -> Result<Arc<dyn BrokerChannel>>;
}

/// One live channel to a broker.
///
/// Deliveries from every queue this channel consumes arrive on a single
/// stream drained by [`BrokerChannel::receive`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Create or passively verify an exchange.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Create or passively verify a queue with the given policy knobs.
    async fn declare_queue(&self, name: &str, args: &QueueArgs) -> Result<()>;

    /// Bind a queue to an exchange under a routing key. Idempotent.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Passively check that a queue exists.
    async fn queue_exists(&self, name: &str) -> Result<bool>;

    /// Publish an envelope to an exchange; the envelope's routing key
    /// selects the bound queues.
    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()>;

    /// Start consuming a queue; deliveries flow to this channel's stream.
    async fn consume(&self, queue: &str) -> Result<()>;

    /// Stop consuming a queue on this channel.
    async fn cancel(&self, queue: &str) -> Result<()>;

    /// Wait up to `timeout` for the next delivery on any consumed queue.
    /// `Ok(None)` means the wait timed out without data. A zero timeout
    /// polls without blocking.
    async fn receive(&self, wait: std::time::Duration) -> Result<Option<Envelope>>;

    /// Close the channel, cancelling all of its consumers.
    async fn close(&self) -> Result<()>;
}

/// Counters describing broker activity since startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Channels opened by dialers
    pub channels_opened: u64,
    /// Messages accepted from publishers
    pub messages_published: u64,
    /// Messages handed to consumers
    pub messages_delivered: u64,
    /// Messages discarded by overflow policy or TTL
    pub messages_dropped: u64,
    /// Messages that matched no binding
    pub messages_unrouted: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    channels_opened: AtomicU64,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    messages_unrouted: AtomicU64,
}

struct Binding {
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct Exchange {
    bindings: Vec<Binding>,
}

struct StoredMessage {
    envelope: Envelope,
    enqueued_at: Instant,
}

struct ConsumerHandle {
    channel_id: Uuid,
    tx: mpsc::Sender<Envelope>,
}

struct QueueState {
    args: QueueArgs,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerHandle>,
    /// Round-robin cursor over consumers
    next_consumer: usize,
    /// Since when the queue has had no consumers (for queue expiry)
    idle_since: Option<Instant>,
}

impl QueueState {
    fn new(args: QueueArgs) -> Self {
        Self {
            args,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            idle_since: Some(Instant::now()),
        }
    }

    fn expired(&self) -> bool {
        match (self.args.queue_expiry, self.idle_since) {
            (Some(expiry), Some(idle_since)) => idle_since.elapsed() > expiry,
            _ => false,
        }
    }

    /// Drop messages that outlived their TTL. Returns how many went.
    fn expire_messages(&mut self) -> u64 {
        let Some(ttl) = self.args.message_ttl else {
            return 0;
        };
        let before = self.messages.len();
        self.messages.retain(|stored| stored.enqueued_at.elapsed() <= ttl);
        (before - self.messages.len()) as u64
    }

    /// Push queued messages out to live consumers, round-robin, until the
    /// backlog empties or every consumer stream is full.
    fn flush(&mut self) -> u64 {
        let mut delivered = 0;
        while !self.consumers.is_empty() {
            let Some(stored) = self.messages.pop_front() else {
                break;
            };
            let mut sent = false;
            for _ in 0..self.consumers.len() {
                let index = self.next_consumer % self.consumers.len();
                self.next_consumer = self.next_consumer.wrapping_add(1);
                if self.consumers[index].tx.try_send(stored.envelope.clone()).is_ok() {
                    sent = true;
                    delivered += 1;
                    break;
                }
            }
            if !sent {
                // Every consumer stream is full; park the message again.
                self.messages.push_front(stored);
                break;
            }
        }
        delivered
    }
}

struct BrokerState {
    exchanges: Mutex<HashMap<String, Exchange>>,
    queues: Mutex<HashMap<String, QueueState>>,
    stats: StatCounters,
}

impl BrokerState {
    /// Apply lazy TTL/expiry housekeeping to one queue entry; removes the
    /// queue when it has outlived its consumer-idle expiry.
    fn sweep(queues: &mut HashMap<String, QueueState>, name: &str, stats: &StatCounters) {
        let Some(queue) = queues.get_mut(name) else {
            return;
        };
        let dropped = queue.expire_messages();
        if dropped > 0 {
            stats.messages_dropped.fetch_add(dropped, Ordering::Relaxed);
            debug!(queue = name, dropped, "expired messages past their TTL");
        }
        if queue.expired() {
            queues.remove(name);
            warn!(queue = name, "queue idle past expiry, auto-deleting");
        }
    }
}

/// In-process broker with direct routing-key matching.
pub struct EmbeddedBroker {
    state: Arc<BrokerState>,
}

impl EmbeddedBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                exchanges: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Administratively delete a queue, discarding its backlog.
    pub async fn delete_queue(&self, name: &str) -> bool {
        let mut queues = self.state.queues.lock().await;
        let removed = queues.remove(name).is_some();
        if removed {
            let mut exchanges = self.state.exchanges.lock().await;
            for exchange in exchanges.values_mut() {
                exchange.bindings.retain(|binding| binding.queue != name);
            }
        }
        removed
    }

    /// Current backlog depth of a queue, if it exists.
    pub async fn queue_depth(&self, name: &str) -> Option<usize> {
        let queues = self.state.queues.lock().await;
        queues.get(name).map(|queue| queue.messages.len())
    }

    /// Number of live consumers on a queue, if it exists.
    pub async fn consumer_count(&self, name: &str) -> Option<usize> {
        let queues = self.state.queues.lock().await;
        queues.get(name).map(|queue| queue.consumers.len())
    }

    /// Snapshot of the broker counters.
    pub fn stats(&self) -> BrokerStats {
        let stats = &self.state.stats;
        BrokerStats {
            channels_opened: stats.channels_opened.load(Ordering::Relaxed),
            messages_published: stats.messages_published.load(Ordering::Relaxed),
            messages_delivered: stats.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: stats.messages_dropped.load(Ordering::Relaxed),
            messages_unrouted: stats.messages_unrouted.load(Ordering::Relaxed),
        }
    }
}

impl Default for EmbeddedBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerEndpoint for EmbeddedBroker {
    async fn dial(&self, params: &ConnectionParams) -> Result<Arc<dyn BrokerChannel>> {
        if params.user.is_empty() {
            return Err(TransportError::transport("authentication user is empty"));
        }
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_DEPTH);
        self.state.stats.channels_opened.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = %params.endpoint(), "opened embedded broker channel");
        Ok(Arc::new(EmbeddedChannel {
            id: Uuid::new_v4(),
            state: Arc::clone(&self.state),
            delivery_tx,
            delivery_rx: Mutex::new(delivery_rx),
        }))
    }
}

/// One live channel into an [`EmbeddedBroker`].
struct EmbeddedChannel {
    id: Uuid,
    state: Arc<BrokerState>,
    delivery_tx: mpsc::Sender<Envelope>,
    delivery_rx: Mutex<mpsc::Receiver<Envelope>>,
}

#[async_trait]
impl BrokerChannel for EmbeddedChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let mut exchanges = self.state.exchanges.lock().await;
        exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, args: &QueueArgs) -> Result<()> {
        let mut queues = self.state.queues.lock().await;
        BrokerState::sweep(&mut queues, name, &self.state.stats);
        queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState::new(args.clone()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        {
            let queues = self.state.queues.lock().await;
            if !queues.contains_key(queue) {
                return Err(TransportError::declare(format!("unknown queue: {queue}")));
            }
        }
        let mut exchanges = self.state.exchanges.lock().await;
        let Some(entry) = exchanges.get_mut(exchange) else {
            return Err(TransportError::declare(format!(
                "unknown exchange: {exchange}"
            )));
        };
        let already_bound = entry
            .bindings
            .iter()
            .any(|binding| binding.queue == queue && binding.routing_key == routing_key);
        if !already_bound {
            entry.bindings.push(Binding {
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn queue_exists(&self, name: &str) -> Result<bool> {
        let mut queues = self.state.queues.lock().await;
        BrokerState::sweep(&mut queues, name, &self.state.stats);
        Ok(queues.contains_key(name))
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        let targets: Vec<String> = {
            let exchanges = self.state.exchanges.lock().await;
            let Some(entry) = exchanges.get(exchange) else {
                return Err(TransportError::transport(format!(
                    "publish to unknown exchange: {exchange}"
                )));
            };
            entry
                .bindings
                .iter()
                .filter(|binding| binding.routing_key == envelope.routing_key)
                .map(|binding| binding.queue.clone())
                .collect()
        };

        self.state.stats.messages_published.fetch_add(1, Ordering::Relaxed);

        if targets.is_empty() {
            self.state.stats.messages_unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(
                exchange,
                routing_key = %envelope.routing_key,
                "message matched no binding, discarding"
            );
            return Ok(());
        }

        let mut queues = self.state.queues.lock().await;
        for name in targets {
            BrokerState::sweep(&mut queues, &name, &self.state.stats);
            let Some(queue) = queues.get_mut(&name) else {
                continue;
            };

            if let Some(max) = queue.args.max_length
                && queue.messages.len() >= max
            {
                match queue.args.overflow {
                    OverflowPolicy::DropOldest => {
                        queue.messages.pop_front();
                        self.state.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(queue = %name, "queue at max length, dropping oldest");
                    }
                    OverflowPolicy::RejectNew => {
                        self.state.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(queue = %name, "queue at max length, rejecting new message");
                        continue;
                    }
                }
            }

            queue.messages.push_back(StoredMessage {
                envelope: envelope.clone(),
                enqueued_at: Instant::now(),
            });
            let delivered = queue.flush();
            if delivered > 0 {
                self.state
                    .stats
                    .messages_delivered
                    .fetch_add(delivered, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<()> {
        let mut queues = self.state.queues.lock().await;
        BrokerState::sweep(&mut queues, queue, &self.state.stats);
        let Some(state) = queues.get_mut(queue) else {
            return Err(TransportError::transport(format!(
                "consume on unknown queue: {queue}"
            )));
        };
        let already = state
            .consumers
            .iter()
            .any(|consumer| consumer.channel_id == self.id);
        if !already {
            state.consumers.push(ConsumerHandle {
                channel_id: self.id,
                tx: self.delivery_tx.clone(),
            });
            state.idle_since = None;
        }
        // Backlogged messages flow out as soon as a consumer appears.
        let delivered = state.flush();
        if delivered > 0 {
            self.state
                .stats
                .messages_delivered
                .fetch_add(delivered, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn cancel(&self, queue: &str) -> Result<()> {
        let mut queues = self.state.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.consumers.retain(|consumer| consumer.channel_id != self.id);
            if state.consumers.is_empty() {
                state.idle_since = Some(Instant::now());
            }
        }
        Ok(())
    }

    async fn receive(&self, wait: std::time::Duration) -> Result<Option<Envelope>> {
        let mut rx = self.delivery_rx.lock().await;
        if wait.is_zero() {
            return Ok(rx.try_recv().ok());
        }
        match timeout(wait, rx.recv()).await {
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) => Err(TransportError::transport("delivery stream closed")),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut queues = self.state.queues.lock().await;
        for state in queues.values_mut() {
            state.consumers.retain(|consumer| consumer.channel_id != self.id);
            if state.consumers.is_empty() && state.idle_since.is_none() {
                state.idle_since = Some(Instant::now());
            }
        }
        debug!(channel = %self.id, "embedded broker channel closed");
        Ok(())
    }
}
