//! Wire-facing types shared by the broker contract and the transport core

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Well-known routing key prefixes for gridmon streams
pub mod keys {
    /// Time-series feature records flowing from device monitors to the backend
    pub const FEATURES_PREFIX: &str = "gridmon.features";
    /// Computed analysis results flowing back out to device monitors
    pub const RESULTS_PREFIX: &str = "gridmon.results";
    /// Control-plane messages (registration, health, shutdown)
    pub const CONTROL_PREFIX: &str = "gridmon.control";
}

/// Sequence tag value meaning "unordered / no sequence"
pub const UNSEQUENCED: i64 = 0;

/// A message as it crosses the broker boundary.
///
/// The payload is opaque to the transport core; translation to and from
/// domain records happens through the codec seam (see [`crate::codec`]).
/// The sequence tag is used purely for local per-stream reordering and
/// carries no broker-level guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Routing key the broker used (or will use) to route this message
    pub routing_key: String,
    /// Per-stream sequence tag; `0` means unordered, values ≤ 0 reset a
    /// stream's reordering baseline
    pub sequence: i64,
}

impl Envelope {
    /// Create a sequenced envelope
    pub fn new(payload: Vec<u8>, routing_key: impl Into<String>, sequence: i64) -> Self {
        Self {
            payload,
            routing_key: routing_key.into(),
            sequence,
        }
    }

    /// Create an envelope with no sequence tag
    pub fn unsequenced(payload: Vec<u8>, routing_key: impl Into<String>) -> Self {
        Self::new(payload, routing_key, UNSEQUENCED)
    }
}

/// What the broker does with new messages once a queue hits `max_length`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Drop the oldest queued message to make room
    DropOldest,
    /// Reject the incoming message and keep the queue as-is
    RejectNew,
}

/// Declaration arguments for broker queues.
///
/// These are policy knobs the broker enforces; the transport core only
/// forwards them at declare time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueArgs {
    /// Behavior when the queue is at `max_length`
    pub overflow: OverflowPolicy,
    /// Maximum queued messages before the overflow policy applies
    pub max_length: Option<usize>,
    /// Per-message time-to-live; expired messages are discarded undelivered
    pub message_ttl: Option<Duration>,
    /// How long a queue may sit without consumers before auto-deletion
    pub queue_expiry: Option<Duration>,
}

impl Default for QueueArgs {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::DropOldest,
            max_length: None,
            message_ttl: None,
            queue_expiry: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsequenced_envelope_carries_zero_tag() {
        let envelope = Envelope::unsequenced(b"payload".to_vec(), "gridmon.features.dev-1");
        assert_eq!(envelope.sequence, UNSEQUENCED);
        assert_eq!(envelope.routing_key, "gridmon.features.dev-1");
    }

    #[test]
    fn queue_args_default_to_drop_oldest() {
        let args = QueueArgs::default();
        assert_eq!(args.overflow, OverflowPolicy::DropOldest);
        assert!(args.max_length.is_none());
    }
}
