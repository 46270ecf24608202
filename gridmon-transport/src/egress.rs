//! Egress dispatch: fan computed results back out to per-device queues.
//!
//! The dispatcher caches one [`StreamRegistration`] per outbound target and
//! verifies the target queue still exists before every publish. A missing
//! queue is a normal outcome ([`SendOutcome::QueueAbsent`]), not an error:
//! the caller decides whether to park the record for retry.

use crate::config::TransportConfig;
use crate::connection::BrokerConnection;
use crate::error::Result;
use crate::ingress::StreamRegistration;
use crate::message::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of a non-blocking send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The payload was published to the target queue
    Sent,
    /// The target queue does not exist; nothing was published
    QueueAbsent,
}

/// Binds outbound logical streams to broker queues.
pub struct EgressDispatcher {
    connection: Arc<BrokerConnection>,
    config: TransportConfig,
    targets: HashMap<String, StreamRegistration>,
    /// Connection epoch the targets were declared under
    seen_epoch: u64,
}

impl EgressDispatcher {
    /// Create a dispatcher over a connection.
    pub fn new(connection: Arc<BrokerConnection>, config: TransportConfig) -> Self {
        let seen_epoch = connection.epoch();
        Self {
            connection,
            config,
            targets: HashMap::new(),
            seen_epoch,
        }
    }

    /// Declare and cache an outbound target stream.
    #[instrument(skip(self))]
    pub async fn register_target(&mut self, stream: &str) -> Result<()> {
        let registration = StreamRegistration {
            stream: stream.to_string(),
            exchange: self.config.exchange_name.clone(),
            queue: self.config.queue_name(stream),
            routing_keys: vec![self.config.routing_key(stream)],
            queue_args: self.config.queue_args.clone(),
            ordered: false,
        };
        self.apply(&registration).await?;
        info!(queue = %registration.queue, "egress target registered");
        self.targets.insert(stream.to_string(), registration);
        Ok(())
    }

    /// Publish `payload` to a registered target without blocking on
    /// recovery.
    ///
    /// Verifies the target queue still exists first; if it is gone the
    /// payload is not published and [`SendOutcome::QueueAbsent`] is
    /// returned with no side effects.
    pub async fn send(
        &self,
        stream: &str,
        payload: Vec<u8>,
        routing_key: Option<&str>,
    ) -> Result<SendOutcome> {
        let registration = self.targets.get(stream).ok_or_else(|| {
            crate::error::TransportError::configuration(format!(
                "unregistered egress stream: {stream}"
            ))
        })?;

        if !self.connection.queue_exists(&registration.queue).await? {
            warn!(queue = %registration.queue, "target queue absent, send skipped");
            return Ok(SendOutcome::QueueAbsent);
        }

        let key = routing_key.unwrap_or(&registration.routing_keys[0]);
        self.connection
            .publish(
                &registration.exchange,
                Envelope::unsequenced(payload, key.to_string()),
            )
            .await?;
        debug!(queue = %registration.queue, routing_key = %key, "result dispatched");
        Ok(SendOutcome::Sent)
    }

    /// Whether another component replaced the shared connection since the
    /// targets were declared.
    pub fn is_reconnected(&self) -> bool {
        self.seen_epoch != self.connection.epoch()
    }

    /// Re-declare every cached target against the current connection.
    #[instrument(skip(self))]
    pub async fn resync(&mut self) -> Result<()> {
        let epoch = self.connection.epoch();
        for registration in self.targets.values() {
            self.apply(registration).await?;
        }
        self.seen_epoch = epoch;
        info!(epoch, targets = self.targets.len(), "egress targets re-declared");
        Ok(())
    }

    /// Registered target streams.
    pub fn targets(&self) -> impl Iterator<Item = &StreamRegistration> {
        self.targets.values()
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EmbeddedBroker;
    use crate::config::ConnectionParams;
    use crate::error::TransportError;

    async fn setup() -> (Arc<EmbeddedBroker>, Arc<BrokerConnection>, TransportConfig) {
        let broker = Arc::new(EmbeddedBroker::new());
        let connection = Arc::new(BrokerConnection::new(
            broker.clone(),
            ConnectionParams::default(),
        ));
        connection.connect(false).await.unwrap();
        (broker, connection, TransportConfig::default())
    }

    #[tokio::test]
    async fn send_publishes_to_the_bound_queue() {
        let (broker, connection, config) = setup().await;
        let mut dispatcher = EgressDispatcher::new(connection, config.clone());
        dispatcher.register_target("results").await.unwrap();

        let outcome = dispatcher
            .send("results", b"payload".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(
            broker.queue_depth(&config.queue_name("results")).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn absent_queue_is_an_outcome_not_an_error() {
        let (broker, connection, config) = setup().await;
        let mut dispatcher = EgressDispatcher::new(connection, config.clone());
        dispatcher.register_target("results").await.unwrap();
        broker.delete_queue(&config.queue_name("results")).await;

        let outcome = dispatcher
            .send("results", b"payload".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::QueueAbsent);
        assert_eq!(broker.stats().messages_published, 0);
    }

    #[tokio::test]
    async fn unregistered_stream_is_a_configuration_error() {
        let (_broker, connection, config) = setup().await;
        let dispatcher = EgressDispatcher::new(connection, config);
        let err = dispatcher
            .send("ghost", b"payload".to_vec(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[tokio::test]
    async fn resync_restores_targets_after_epoch_bump() {
        let (broker, connection, config) = setup().await;
        let mut dispatcher = EgressDispatcher::new(connection.clone(), config.clone());
        dispatcher.register_target("results").await.unwrap();
        broker.delete_queue(&config.queue_name("results")).await;

        connection.connect(true).await.unwrap();
        assert!(dispatcher.is_reconnected());

        dispatcher.resync().await.unwrap();
        assert!(!dispatcher.is_reconnected());
        let outcome = dispatcher
            .send("results", b"payload".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
    }
}
