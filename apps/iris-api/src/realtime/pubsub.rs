//! Publish/subscribe gateway over the broker.
//!
//! Publishing is fire-and-forget: only subscribers connected at publish time
//! see an event, nothing is buffered for later joiners.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::broker::{Broker, BrokerError};

use super::channel::{user_channel, USER_CHANNEL_PATTERN};
use super::envelope::{Action, Envelope};
use super::subscription::Subscription;
use super::RealtimeError;

/// How long `subscribe` waits for the broker to confirm.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a broadcast to every recipient channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Channels the event was sent to.
    pub channels: usize,
    /// Channels whose publish failed.
    pub failed: usize,
    /// Subscribers reached across all channels.
    pub receivers: usize,
}

/// Cloneable handle for publishing events and opening subscriptions.
#[derive(Clone)]
pub struct EventBus {
    broker: Arc<dyn Broker>,
    subscribe_timeout: Duration,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
        }
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publish to one channel. Returns how many subscribers received it.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        action: Action,
        data: &T,
    ) -> Result<usize, RealtimeError> {
        let envelope = Envelope::from_payload(action, data)?;
        self.publish_envelope(channel, &envelope).await
    }

    pub async fn publish_envelope(
        &self,
        channel: &str,
        envelope: &Envelope,
    ) -> Result<usize, RealtimeError> {
        let payload = envelope.encode()?;
        let receivers = self.broker.publish(channel, &payload).await?;
        tracing::debug!(%channel, action = %envelope.action(), receivers, "event published");
        Ok(receivers)
    }

    pub async fn publish_to_recipient<T: Serialize + ?Sized>(
        &self,
        recipient_id: &str,
        action: Action,
        data: &T,
    ) -> Result<usize, RealtimeError> {
        self.publish(&user_channel(recipient_id), action, data).await
    }

    /// Publish to every recipient channel that currently has a subscriber.
    ///
    /// A failure on one channel is logged and counted; the rest still get the
    /// event. Only failing to list channels (or to encode) is an error.
    pub async fn publish_to_all<T: Serialize + ?Sized>(
        &self,
        action: Action,
        data: &T,
    ) -> Result<BroadcastSummary, RealtimeError> {
        let envelope = Envelope::from_payload(action, data)?;
        let payload = envelope.encode()?;
        let channels = self.broker.channels_matching(USER_CHANNEL_PATTERN).await?;

        let mut summary = BroadcastSummary {
            channels: channels.len(),
            ..Default::default()
        };
        for channel in &channels {
            match self.broker.publish(channel, &payload).await {
                Ok(receivers) => summary.receivers += receivers,
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(%channel, ?err, "broadcast publish failed");
                }
            }
        }

        tracing::info!(
            action = %envelope.action(),
            channels = summary.channels,
            failed = summary.failed,
            "event broadcast"
        );
        Ok(summary)
    }

    /// Open a subscription, failing fast if the broker does not confirm it
    /// within the subscribe timeout.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription, RealtimeError> {
        let raw = tokio::time::timeout(self.subscribe_timeout, self.broker.subscribe(channel))
            .await
            .map_err(|_| BrokerError::SubscribeTimeout {
                channel: channel.to_string(),
                timeout: self.subscribe_timeout,
            })??;

        tracing::debug!(%channel, "subscribed");
        Ok(Subscription::spawn(channel.to_string(), raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(MemoryBroker::new()))
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = bus();
        let mut sub = bus.subscribe(&user_channel("u1")).await.unwrap();

        let reached = bus
            .publish_to_recipient("u1", Action::Notification, &json!({ "n": 1 }))
            .await
            .unwrap();
        assert_eq!(reached, 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.action(), &Action::Notification);
        assert_eq!(event.data(), &json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_backlog() {
        let bus = bus();
        let reached = bus
            .publish("user:u1:events", Action::Notification, &json!("early"))
            .await
            .unwrap();
        assert_eq!(reached, 0);

        let mut sub = bus.subscribe("user:u1:events").await.unwrap();
        bus.publish("user:u1:events", Action::Notification, &json!("late"))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().data(), &json!("late"));
    }

    #[tokio::test]
    async fn events_keep_publish_order() {
        let bus = bus();
        let mut sub = bus.subscribe("ordered").await.unwrap();
        for i in 0..20 {
            bus.publish("ordered", Action::BotTaskProgress, &i).await.unwrap();
        }
        for i in 0..20 {
            assert_eq!(sub.recv().await.unwrap().data(), &json!(i));
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_user_channel_only() {
        let bus = bus();
        let mut a = bus.subscribe(&user_channel("a")).await.unwrap();
        let mut b = bus.subscribe(&user_channel("b")).await.unwrap();
        let _other = bus.subscribe("system").await.unwrap();

        let summary = bus
            .publish_to_all(Action::SystemMessage, &json!({ "msg": "hi" }))
            .await
            .unwrap();
        assert_eq!(summary.channels, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.receivers, 2);

        assert_eq!(a.recv().await.unwrap().action(), &Action::SystemMessage);
        assert_eq!(b.recv().await.unwrap().action(), &Action::SystemMessage);
    }
}
