//! Control loops binding codecs and failure recovery around the
//! ingress/egress machinery.
//!
//! Each controller exposes a `tick` that runs one scheduling cycle and a
//! `run` loop that drives ticks on the configured cadence. Tick bodies
//! never block longer than the receive timeout and never propagate
//! transport failures: they requeue in-flight work, force a reconnect, and
//! arm a jittered backoff that skips subsequent cycles until it expires.
//! A closing flag set by `close` suppresses the reconnect path so errors
//! produced by the shutdown sequence itself are not mistaken for live
//! failures.

use crate::backoff::{BackoffTimer, jittered};
use crate::codec::{RecordDecoder, RecordEncoder};
use crate::config::TransportConfig;
use crate::connection::BrokerConnection;
use crate::egress::{EgressDispatcher, SendOutcome};
use crate::error::TransportError;
use crate::ingress::{IngressAggregator, StreamSpec};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Transport-failure handling shared by both controllers: force a
/// reconnect on the shared connection, arming a jittered backoff when it
/// fails. Only one of the controllers racing on a shared connection
/// actually redials; the rest observe the epoch change. Suppressed
/// entirely while the controller is closing.
async fn recover(
    connection: &BrokerConnection,
    closing: &AtomicBool,
    backoff: &mut BackoffTimer,
    config: &TransportConfig,
    error: TransportError,
) {
    if closing.load(Ordering::Relaxed) {
        debug!(error = %error, "ignoring transport error raised during shutdown");
        return;
    }
    if !error.is_connection_fault() {
        // Declare-level failures are retried on a later cycle without
        // tearing the shared connection down.
        let delay = jittered(config.reconnect_backoff);
        warn!(error = %error, delay_ms = delay.as_millis() as u64, "recoverable failure, backing off");
        backoff.start(delay);
        return;
    }
    warn!(error = %error, "transport failure, forcing reconnect");
    match connection.reconnect(connection.epoch()).await {
        Ok(true) => info!(epoch = connection.epoch(), "reconnected after transport failure"),
        Ok(false) => debug!("another controller already reconnected"),
        Err(e) => {
            let delay = jittered(config.reconnect_backoff);
            warn!(error = %e, delay_ms = delay.as_millis() as u64, "reconnect failed, backing off");
            backoff.start(delay);
        }
    }
}

/// Drives the ingress side: poll, decode, hand off to the pipeline.
pub struct IngressController<D: RecordDecoder> {
    aggregator: IngressAggregator,
    connection: Arc<BrokerConnection>,
    decoder: D,
    pipeline: tokio::sync::mpsc::Sender<D::Record>,
    backoff: BackoffTimer,
    closing: Arc<AtomicBool>,
    config: TransportConfig,
}

impl<D: RecordDecoder> IngressController<D> {
    /// Create a controller feeding decoded records into `pipeline`.
    pub fn new(
        connection: Arc<BrokerConnection>,
        config: TransportConfig,
        decoder: D,
        pipeline: tokio::sync::mpsc::Sender<D::Record>,
    ) -> Self {
        let aggregator = IngressAggregator::new(Arc::clone(&connection), config.clone());
        Self {
            aggregator,
            connection,
            decoder,
            pipeline,
            backoff: BackoffTimer::new(),
            closing: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Bind a logical stream on the underlying aggregator.
    pub async fn register(&mut self, spec: &StreamSpec) -> crate::error::Result<()> {
        self.aggregator.register(spec).await
    }

    /// The aggregator this controller drives.
    pub fn aggregator(&self) -> &IngressAggregator {
        &self.aggregator
    }

    /// Run one scheduling cycle.
    pub async fn tick(&mut self) {
        if self.closing.load(Ordering::Relaxed) || self.backoff.active() {
            return;
        }

        if self.aggregator.is_reconnected() {
            info!("connection epoch changed, replaying ingress registrations");
            if let Err(e) = self.aggregator.resubscribe().await {
                recover(
                    &self.connection,
                    &self.closing,
                    &mut self.backoff,
                    &self.config,
                    e,
                )
                .await;
                return;
            }
        }

        match self.aggregator.poll(self.config.receive_timeout).await {
            Ok(Some(envelope)) => match self.decoder.decode(&envelope.payload) {
                Ok(record) => {
                    if self.pipeline.send(record).await.is_err() {
                        warn!("pipeline receiver dropped, discarding decoded record");
                    }
                }
                Err(e) => {
                    // One bad payload never aborts the loop.
                    warn!(
                        routing_key = %envelope.routing_key,
                        sequence = envelope.sequence,
                        error = %e,
                        "dropping undecodable message"
                    );
                }
            },
            Ok(None) => {}
            Err(e) => {
                recover(
                    &self.connection,
                    &self.closing,
                    &mut self.backoff,
                    &self.config,
                    e,
                )
                .await;
            }
        }
    }

    /// Drive ticks on the configured cadence until [`close`](Self::close)
    /// is called.
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !self.closing.load(Ordering::Relaxed) {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// Flag used to stop a `run` loop from another task.
    pub fn closing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closing)
    }

    /// Set the closing flag, then release the connection. Errors raised by
    /// in-flight operations during this window are suppressed, not treated
    /// as live failures.
    pub async fn close(&mut self) {
        self.closing.store(true, Ordering::Relaxed);
        if let Err(e) = self.connection.close().await {
            debug!(error = %e, "error closing connection during shutdown");
        }
    }
}

/// Drives the egress side: pull, encode, send, retry.
pub struct EgressController<E: RecordEncoder> {
    dispatcher: EgressDispatcher,
    connection: Arc<BrokerConnection>,
    encoder: E,
    pipeline: tokio::sync::mpsc::Receiver<E::Record>,
    /// Target stream every record is dispatched to
    target: String,
    /// Unsent records, oldest at the front; bounded by
    /// `retry_cache_size` with oldest dropped on overflow
    retry: VecDeque<E::Record>,
    backoff: BackoffTimer,
    closing: Arc<AtomicBool>,
    config: TransportConfig,
    /// Records lost to retry-cache overflow
    retry_drops: u64,
}

impl<E: RecordEncoder> EgressController<E> {
    /// Create a controller draining `pipeline` toward `target`.
    pub fn new(
        connection: Arc<BrokerConnection>,
        config: TransportConfig,
        encoder: E,
        pipeline: tokio::sync::mpsc::Receiver<E::Record>,
        target: impl Into<String>,
    ) -> Self {
        let dispatcher = EgressDispatcher::new(Arc::clone(&connection), config.clone());
        Self {
            dispatcher,
            connection,
            encoder,
            pipeline,
            target: target.into(),
            retry: VecDeque::new(),
            backoff: BackoffTimer::new(),
            closing: Arc::new(AtomicBool::new(false)),
            config,
            retry_drops: 0,
        }
    }

    /// Declare and cache the outbound target on the dispatcher.
    pub async fn register(&mut self) -> crate::error::Result<()> {
        let target = self.target.clone();
        self.dispatcher.register_target(&target).await
    }

    /// The dispatcher this controller drives.
    pub fn dispatcher(&self) -> &EgressDispatcher {
        &self.dispatcher
    }

    /// Records currently parked for retry.
    pub fn retry_backlog(&self) -> usize {
        self.retry.len()
    }

    /// Records lost to retry-cache overflow.
    pub fn retry_drops(&self) -> u64 {
        self.retry_drops
    }

    /// Run one scheduling cycle.
    pub async fn tick(&mut self) {
        if self.closing.load(Ordering::Relaxed) || self.backoff.active() {
            return;
        }

        if self.dispatcher.is_reconnected() {
            info!("connection epoch changed, replaying egress targets");
            if let Err(e) = self.dispatcher.resync().await {
                recover(
                    &self.connection,
                    &self.closing,
                    &mut self.backoff,
                    &self.config,
                    e,
                )
                .await;
                return;
            }
        }

        // Everything the pipeline has on offer joins the back of the cache;
        // unsent work from earlier cycles stays at the front.
        while let Ok(record) = self.pipeline.try_recv() {
            self.cache_back(record);
        }

        while let Some(record) = self.retry.pop_front() {
            let payload = match self.encoder.encode(&record) {
                Ok(payload) => payload,
                Err(e) => {
                    // One unencodable record never aborts the loop.
                    warn!(error = %e, "dropping unencodable record");
                    continue;
                }
            };

            match self.dispatcher.send(&self.target, payload, None).await {
                Ok(SendOutcome::Sent) => {}
                Ok(SendOutcome::QueueAbsent) => {
                    self.cache_front(record);
                    let delay = jittered(self.config.reconnect_backoff);
                    debug!(
                        target = %self.target,
                        delay_ms = delay.as_millis() as u64,
                        "target queue absent, parking unsent records"
                    );
                    self.backoff.start(delay);
                    break;
                }
                Err(e) => {
                    self.cache_front(record);
                    recover(
                        &self.connection,
                        &self.closing,
                        &mut self.backoff,
                        &self.config,
                        e,
                    )
                    .await;
                    break;
                }
            }
        }
    }

    /// Drive ticks on the configured cadence until [`close`](Self::close)
    /// is called.
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !self.closing.load(Ordering::Relaxed) {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// Flag used to stop a `run` loop from another task.
    pub fn closing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closing)
    }

    /// Set the closing flag, then release the connection.
    pub async fn close(&mut self) {
        self.closing.store(true, Ordering::Relaxed);
        if let Err(e) = self.connection.close().await {
            debug!(error = %e, "error closing connection during shutdown");
        }
    }

    fn cache_front(&mut self, record: E::Record) {
        self.retry.push_front(record);
        self.shrink_cache();
    }

    fn cache_back(&mut self, record: E::Record) {
        self.retry.push_back(record);
        self.shrink_cache();
    }

    fn shrink_cache(&mut self) {
        while self.retry.len() > self.config.retry_cache_size {
            // Oldest unsent record loses its slot.
            self.retry.pop_front();
            self.retry_drops += 1;
            warn!(
                target = %self.target,
                "retry cache full, dropping oldest unsent record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EmbeddedBroker;
    use crate::codec::JsonCodec;
    use crate::config::ConnectionParams;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        device: String,
        value: f64,
    }

    async fn connected(broker: &Arc<EmbeddedBroker>) -> Arc<BrokerConnection> {
        let connection = Arc::new(BrokerConnection::new(
            Arc::clone(broker) as Arc<dyn crate::broker::BrokerEndpoint>,
            ConnectionParams::default(),
        ));
        connection.connect(false).await.unwrap();
        connection
    }

    fn quick_config() -> TransportConfig {
        TransportConfig::default()
            .with_receive_timeout(Duration::from_millis(50))
            .with_retry_cache_size(3)
    }

    #[tokio::test]
    async fn ingress_tick_decodes_and_forwards() {
        let broker = Arc::new(EmbeddedBroker::new());
        let connection = connected(&broker).await;
        let config = quick_config();
        let (tx, mut rx) = mpsc::channel(16);
        let mut controller =
            IngressController::new(Arc::clone(&connection), config.clone(), JsonCodec::<Reading>::new(), tx);
        controller
            .register(&StreamSpec::unordered("dev-1"))
            .await
            .unwrap();

        let record = Reading {
            device: "dev-1".to_string(),
            value: 7.25,
        };
        connection
            .publish(
                &config.exchange_name,
                crate::message::Envelope::unsequenced(
                    serde_json::to_vec(&record).unwrap(),
                    config.routing_key("dev-1"),
                ),
            )
            .await
            .unwrap();

        controller.tick().await;
        assert_eq!(rx.try_recv().unwrap(), record);
    }

    #[tokio::test]
    async fn ingress_drops_undecodable_payloads() {
        let broker = Arc::new(EmbeddedBroker::new());
        let connection = connected(&broker).await;
        let config = quick_config();
        let (tx, mut rx) = mpsc::channel::<Reading>(16);
        let mut controller =
            IngressController::new(Arc::clone(&connection), config.clone(), JsonCodec::new(), tx);
        controller
            .register(&StreamSpec::unordered("dev-1"))
            .await
            .unwrap();

        connection
            .publish(
                &config.exchange_name,
                crate::message::Envelope::unsequenced(
                    b"garbage".to_vec(),
                    config.routing_key("dev-1"),
                ),
            )
            .await
            .unwrap();

        controller.tick().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn egress_tick_encodes_and_publishes() {
        let broker = Arc::new(EmbeddedBroker::new());
        let connection = connected(&broker).await;
        let config = quick_config();
        let (tx, rx) = mpsc::channel(16);
        let mut controller = EgressController::new(
            Arc::clone(&connection),
            config.clone(),
            JsonCodec::<Reading>::new(),
            rx,
            "results",
        );
        controller.register().await.unwrap();

        tx.send(Reading {
            device: "dev-1".to_string(),
            value: 1.0,
        })
        .await
        .unwrap();
        controller.tick().await;

        assert_eq!(controller.retry_backlog(), 0);
        assert_eq!(
            broker.queue_depth(&config.queue_name("results")).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn egress_parks_records_when_queue_absent() {
        let broker = Arc::new(EmbeddedBroker::new());
        let connection = connected(&broker).await;
        let config = quick_config();
        let (tx, rx) = mpsc::channel(16);
        let mut controller = EgressController::new(
            Arc::clone(&connection),
            config.clone(),
            JsonCodec::<Reading>::new(),
            rx,
            "results",
        );
        controller.register().await.unwrap();
        broker.delete_queue(&config.queue_name("results")).await;

        tx.send(Reading {
            device: "dev-1".to_string(),
            value: 2.0,
        })
        .await
        .unwrap();
        controller.tick().await;

        assert_eq!(controller.retry_backlog(), 1);
        // Backoff is armed; the next cycle is skipped entirely.
        controller.tick().await;
        assert_eq!(controller.retry_backlog(), 1);
    }

    #[tokio::test]
    async fn retry_cache_drops_oldest_on_overflow() {
        let broker = Arc::new(EmbeddedBroker::new());
        let connection = connected(&broker).await;
        let config = quick_config();
        let (tx, rx) = mpsc::channel(16);
        let mut controller = EgressController::new(
            Arc::clone(&connection),
            config.clone(),
            JsonCodec::<Reading>::new(),
            rx,
            "results",
        );
        controller.register().await.unwrap();
        broker.delete_queue(&config.queue_name("results")).await;

        for value in 0..5 {
            tx.send(Reading {
                device: "dev-1".to_string(),
                value: f64::from(value),
            })
            .await
            .unwrap();
        }
        controller.tick().await;

        // retry_cache_size is 3: the two oldest readings are gone.
        assert_eq!(controller.retry_backlog(), 3);
        assert_eq!(controller.retry_drops(), 2);
    }

    #[tokio::test]
    async fn closing_flag_suppresses_reconnect() {
        let broker = Arc::new(EmbeddedBroker::new());
        let connection = connected(&broker).await;
        let config = quick_config();
        let (tx, rx) = mpsc::channel(16);
        let mut controller = EgressController::new(
            Arc::clone(&connection),
            config.clone(),
            JsonCodec::<Reading>::new(),
            rx,
            "results",
        );
        controller.register().await.unwrap();
        let epoch_before = connection.epoch();

        controller.close().await;
        tx.send(Reading {
            device: "dev-1".to_string(),
            value: 3.0,
        })
        .await
        .unwrap();
        controller.tick().await;

        // No reconnect happened on behalf of the closed controller.
        assert_eq!(connection.epoch(), epoch_before);
        assert!(!connection.is_connected().await);
    }
}
