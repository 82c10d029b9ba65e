//! Real-time event delivery: envelopes, channels, pub/sub, the per-connection
//! stream bridge, presence markers and the admission semaphore.

pub mod admission;
pub mod bridge;
pub mod channel;
pub mod envelope;
pub mod presence;
pub mod pubsub;
pub mod subscription;

pub use admission::AdmissionController;
pub use bridge::{BridgeConnection, BridgeState, CloseReason, EventSink, SinkError, StreamBridge};
pub use envelope::{Action, Envelope};
pub use presence::PresenceTracker;
pub use pubsub::{BroadcastSummary, EventBus};
pub use subscription::Subscription;

use crate::broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
