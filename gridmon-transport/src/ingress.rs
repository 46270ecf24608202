//! Ingress aggregation: many logical streams, one fair poll surface.
//!
//! The aggregator binds logical streams (by routing key) onto a shared
//! [`BrokerConnection`], routes incoming deliveries into the right
//! [`SequenceBuffer`] (or an unordered default FIFO), and exposes a single
//! `poll` that returns at most **one** message per call. The single-item
//! cap is deliberate: it keeps polling round-robin fair across streams
//! instead of letting one chatty stream monopolize a cycle.

use crate::config::TransportConfig;
use crate::connection::BrokerConnection;
use crate::error::Result;
use crate::message::{Envelope, QueueArgs};
use crate::sequence::SequenceBuffer;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// What a caller asks the aggregator to bind.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// Logical stream name; shapes the queue name and routing key
    pub name: String,
    /// Whether deliveries carry sequence tags that need reordering
    pub ordered: bool,
}

impl StreamSpec {
    /// An ordered stream (deliveries pass through a sequence buffer).
    pub fn ordered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordered: true,
        }
    }

    /// An unordered stream (deliveries go straight to the default FIFO).
    pub fn unordered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordered: false,
        }
    }
}

/// Everything needed to replay one stream's broker-side setup against a
/// freshly (re)established connection.
#[derive(Debug, Clone)]
pub struct StreamRegistration {
    /// Logical stream name
    pub stream: String,
    /// Exchange the queue is bound to
    pub exchange: String,
    /// Declared queue name
    pub queue: String,
    /// Routing keys bound for this stream
    pub routing_keys: Vec<String>,
    /// Declaration arguments used for the queue
    pub queue_args: QueueArgs,
    /// Whether deliveries are routed through a sequence buffer
    pub ordered: bool,
}

/// Fans many logical streams into one fair poll surface.
pub struct IngressAggregator {
    connection: Arc<BrokerConnection>,
    config: TransportConfig,
    /// Reorder buffers keyed by routing key
    buffers: HashMap<String, SequenceBuffer>,
    /// Unordered/ready messages awaiting pickup
    default_fifo: VecDeque<Envelope>,
    /// Replayable broker-side setup, in registration order
    registrations: Vec<StreamRegistration>,
    /// Connection epoch these registrations were applied under
    seen_epoch: u64,
}

impl IngressAggregator {
    /// Create an aggregator over a connection.
    pub fn new(connection: Arc<BrokerConnection>, config: TransportConfig) -> Self {
        let seen_epoch = connection.epoch();
        Self {
            connection,
            config,
            buffers: HashMap::new(),
            default_fifo: VecDeque::new(),
            registrations: Vec::new(),
            seen_epoch,
        }
    }

    /// Bind a logical stream: declare its exchange/queue/binding, start the
    /// consumer, and (for ordered streams) create its reorder buffer.
    #[instrument(skip(self), fields(stream = %spec.name))]
    pub async fn register(&mut self, spec: &StreamSpec) -> Result<()> {
        let registration = StreamRegistration {
            stream: spec.name.clone(),
            exchange: self.config.exchange_name.clone(),
            queue: self.config.queue_name(&spec.name),
            routing_keys: vec![self.config.routing_key(&spec.name)],
            queue_args: self.config.queue_args.clone(),
            ordered: spec.ordered,
        };

        self.apply(&registration).await?;

        if spec.ordered {
            for key in &registration.routing_keys {
                self.buffers.insert(
                    key.clone(),
                    SequenceBuffer::new(
                        spec.name.clone(),
                        self.config.buffer_capacity,
                        self.config.tolerance_window,
                    ),
                );
            }
        }

        info!(queue = %registration.queue, ordered = spec.ordered, "stream registered");
        self.registrations.push(registration);
        Ok(())
    }

    /// Drop a stream: cancel its consumer and discard its buffer along
    /// with anything still parked inside it.
    pub async fn unregister(&mut self, stream: &str) -> Result<()> {
        let Some(index) = self.registrations.iter().position(|r| r.stream == stream) else {
            return Ok(());
        };
        let registration = self.registrations.remove(index);
        for key in &registration.routing_keys {
            self.buffers.remove(key);
        }
        self.connection.cancel(&registration.queue).await?;
        info!(stream, "stream unregistered");
        Ok(())
    }

    /// Get the next ready message, waiting at most `timeout` on the broker.
    ///
    /// Drains the reorder buffers into the default FIFO, pops one item if
    /// any is ready, and otherwise performs a single blocking receive
    /// before trying once more. Returns `Ok(None)` when nothing became
    /// ready within the timeout.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        self.drain_buffers();
        if let Some(envelope) = self.default_fifo.pop_front() {
            return Ok(Some(envelope));
        }

        if let Some(envelope) = self.connection.receive(timeout).await? {
            self.route(envelope);
            // Pull whatever else is already sitting on the delivery stream
            // so reorder buffers see the whole burst this cycle.
            while let Some(envelope) = self.connection.receive(Duration::ZERO).await? {
                self.route(envelope);
            }
        }

        self.drain_buffers();
        Ok(self.default_fifo.pop_front())
    }

    /// Whether another component replaced the shared connection since this
    /// aggregator last applied its registrations.
    pub fn is_reconnected(&self) -> bool {
        self.seen_epoch != self.connection.epoch()
    }

    /// Replay every cached registration against the current connection.
    ///
    /// Called after [`is_reconnected`](Self::is_reconnected) reports a
    /// stale epoch; the cached epoch only advances once every registration
    /// applied, so a partial failure is retried on the next cycle.
    #[instrument(skip(self))]
    pub async fn resubscribe(&mut self) -> Result<()> {
        let epoch = self.connection.epoch();
        for registration in &self.registrations {
            self.apply(registration).await?;
        }
        self.seen_epoch = epoch;
        info!(
            epoch,
            streams = self.registrations.len(),
            "stream registrations replayed"
        );
        Ok(())
    }

    /// Registered streams, in registration order.
    pub fn streams(&self) -> impl Iterator<Item = &StreamRegistration> {
        self.registrations.iter()
    }

    /// Messages currently staged in the default FIFO.
    pub fn staged(&self) -> usize {
        self.default_fifo.len()
    }

    /// The reorder buffer for a routing key, if the stream is ordered.
    pub fn buffer(&self, routing_key: &str) -> Option<&SequenceBuffer> {
        self.buffers.get(routing_key)
    }

    async fn apply(&self, registration: &StreamRegistration) -> Result<()> {
        self.connection
            .declare_exchange(&registration.exchange)
            .await?;
        self.connection
            .declare_queue(&registration.queue, &registration.queue_args)
            .await?;
        for key in &registration.routing_keys {
            self.connection
                .bind_queue(&registration.queue, &registration.exchange, key)
                .await?;
        }
        self.connection.consume(&registration.queue).await?;
        Ok(())
    }

    /// Classify one delivery by routing key.
    fn route(&mut self, envelope: Envelope) {
        match self.buffers.get_mut(&envelope.routing_key) {
            Some(buffer) => buffer.put(envelope),
            None => self.default_fifo.push_back(envelope),
        }
    }

    /// Move everything the reorder buffers consider ready into the FIFO.
    fn drain_buffers(&mut self) {
        for buffer in self.buffers.values_mut() {
            let batch = buffer.get(false);
            if !batch.is_empty() {
                debug!(
                    stream = buffer.stream(),
                    count = batch.len(),
                    "reordered messages ready"
                );
                self.default_fifo.extend(batch);
            }
        }
    }
}
