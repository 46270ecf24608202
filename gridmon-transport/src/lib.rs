//! # Gridmon Transport Core
//!
//! The real-time transport and ordering layer of the gridmon
//! sensor-analytics platform. Device-monitoring processes exchange
//! time-series records and computed results with the central backend
//! exclusively through a message broker; this crate owns everything
//! between the broker and the analytics pipeline.
//!
//! ## Overview
//!
//! - [`BrokerConnection`]/[`ConnectionRegistry`]: pooled broker
//!   connections keyed by [`ConnectionParams`], with a monotonically
//!   increasing epoch counter that lets components detect a silently
//!   replaced shared connection
//! - [`SequenceBuffer`]: per-stream reordering with bounded memory and a
//!   bounded gap-tolerance window
//! - [`IngressAggregator`]: fans many logical streams into one fair
//!   single-item poll surface
//! - [`EgressDispatcher`]: queue-verified, non-blocking result dispatch
//! - [`IngressController`]/[`EgressController`]: scheduling loop bodies
//!   binding the injected codecs, retry caching, and reconnect/backoff
//!   recovery around the above
//! - [`EmbeddedBroker`]: in-process broker implementing the
//!   [`BrokerEndpoint`] contract for single-node deployments and tests
//!
//! Delivery semantics are at-least-once with best-effort local
//! reordering; there is no cross-process total ordering and no
//! persistence of in-flight state across restarts.
//!
//! ## Architecture
//!
//! ```text
//! broker ─▶ BrokerConnection ─▶ IngressAggregator ─▶ SequenceBuffer(s)
//!                                      │
//!                                      ▼ decode
//!                               analytics pipeline
//!                                      │ encode
//!                                      ▼
//! broker ◀─ BrokerConnection ◀─ EgressDispatcher ◀─ EgressController
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use gridmon_transport::{
//!     ConnectionParams, ConnectionRegistry, EmbeddedBroker, IngressAggregator,
//!     StreamSpec, TransportConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = ConnectionRegistry::new(Arc::new(EmbeddedBroker::new()));
//!     let connection = registry.checkout(&ConnectionParams::default()).await;
//!     connection.connect(false).await?;
//!
//!     let config = TransportConfig::default();
//!     config.validate()?;
//!
//!     let mut ingress = IngressAggregator::new(connection, config);
//!     ingress.register(&StreamSpec::ordered("device-42")).await?;
//!
//!     while let Some(envelope) = ingress.poll(Duration::from_millis(500)).await? {
//!         println!("ready: {} #{}", envelope.routing_key, envelope.sequence);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod controller;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod message;
pub mod sequence;

// Re-export main types for convenience
pub use backoff::{BackoffTimer, jittered};
pub use broker::{BrokerChannel, BrokerEndpoint, BrokerStats, EmbeddedBroker};
pub use codec::{JsonCodec, RecordDecoder, RecordEncoder};
pub use config::{ConnectionParams, TransportConfig};
pub use connection::{BrokerConnection, ConnectionRegistry, ConnectionStats};
pub use controller::{EgressController, IngressController};
pub use egress::{EgressDispatcher, SendOutcome};
pub use error::{Result, TransportError};
pub use ingress::{IngressAggregator, StreamRegistration, StreamSpec};
pub use message::{Envelope, OverflowPolicy, QueueArgs, UNSEQUENCED, keys};
pub use sequence::SequenceBuffer;
