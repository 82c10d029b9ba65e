//! Best-effort "recipient is connected" markers backed by expiring keys.
//!
//! A marker lives for [`PRESENCE_TTL_SECS`] unless refreshed, so a recipient
//! whose connection died without a clean close can still read as online for up
//! to one TTL window.

use std::sync::Arc;

use crate::broker::{Broker, BrokerError};

pub const PRESENCE_TTL_SECS: u64 = 30;

pub fn presence_key(recipient_id: &str) -> String {
    format!("user:{recipient_id}:online")
}

#[derive(Clone)]
pub struct PresenceTracker {
    broker: Arc<dyn Broker>,
}

impl PresenceTracker {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Set or refresh the marker; the TTL restarts on every call.
    pub async fn mark_online(&self, recipient_id: &str) -> Result<(), BrokerError> {
        self.broker
            .set_ex(&presence_key(recipient_id), "1", PRESENCE_TTL_SECS)
            .await
    }

    pub async fn mark_offline(&self, recipient_id: &str) -> Result<(), BrokerError> {
        self.broker.del(&presence_key(recipient_id)).await
    }

    /// Never-seen and expired both read as offline.
    pub async fn is_online(&self, recipient_id: &str) -> Result<bool, BrokerError> {
        self.broker.exists(&presence_key(recipient_id)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::MemoryBroker;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Arc::new(MemoryBroker::new()))
    }

    #[tokio::test]
    async fn unknown_recipient_is_offline() {
        assert!(!tracker().is_online("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn mark_online_then_offline() {
        let presence = tracker();
        presence.mark_online("u1").await.unwrap();
        assert!(presence.is_online("u1").await.unwrap());
        assert!(!presence.is_online("u2").await.unwrap());

        presence.mark_offline("u1").await.unwrap();
        assert!(!presence.is_online("u1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn marker_expires_without_refresh() {
        let presence = tracker();
        presence.mark_online("u1").await.unwrap();

        tokio::time::advance(Duration::from_secs(PRESENCE_TTL_SECS + 1)).await;
        assert!(!presence.is_online("u1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_the_window() {
        let presence = tracker();
        presence.mark_online("u1").await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        presence.mark_online("u1").await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(presence.is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn offline_for_unknown_recipient_is_harmless() {
        tracker().mark_offline("ghost").await.unwrap();
    }
}
