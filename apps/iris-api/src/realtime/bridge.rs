//! Per-connection pump from a recipient's event channel to a client sink.
//!
//! Lifecycle: `Connecting → Streaming → Closed`. [`StreamBridge::connect`] is
//! the connecting step and fails before anything reaches the client;
//! [`BridgeConnection::run`] streams until the broker ends the subscription,
//! the peer stops accepting writes, or the connection is cancelled. A client
//! that stops reading is detected within one heartbeat interval.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::channel::user_channel;
use super::envelope::Envelope;
use super::presence::{PresenceTracker, PRESENCE_TTL_SECS};
use super::pubsub::EventBus;
use super::subscription::Subscription;
use super::RealtimeError;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How often a streaming connection re-marks its recipient online. Half the
/// marker TTL, independent of the heartbeat interval.
pub const PRESENCE_REFRESH: Duration = Duration::from_secs(PRESENCE_TTL_SECS / 2);

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("peer disconnected")]
    PeerGone,
    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Where framed output goes. Implemented by the HTTP layer.
#[async_trait]
pub trait EventSink: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The broker closed the subscription.
    StreamEnded,
    /// A write failed or did not complete within the heartbeat interval.
    PeerGone,
    /// The owning connection signalled cancellation.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Streaming,
    Closed(CloseReason),
}

/// Builds bridge connections; cheap to clone into request handlers.
#[derive(Clone)]
pub struct StreamBridge {
    bus: EventBus,
    presence: Option<PresenceTracker>,
    heartbeat_interval: Duration,
}

impl StreamBridge {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            presence: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Keep a presence marker alive for the recipient while streaming.
    pub fn with_presence(mut self, presence: PresenceTracker) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Subscribe to the recipient's channel. On error the bridge is closed
    /// and nothing has been written.
    pub async fn connect(&self, recipient_id: &str) -> Result<BridgeConnection, RealtimeError> {
        let channel = user_channel(recipient_id);
        let subscription = self.bus.subscribe(&channel).await.map_err(|err| {
            tracing::error!(%recipient_id, ?err, "stream subscribe failed");
            err
        })?;

        Ok(BridgeConnection {
            recipient_id: recipient_id.to_string(),
            subscription,
            presence: self.presence.clone(),
            heartbeat_interval: self.heartbeat_interval,
            state: BridgeState::Connecting,
        })
    }
}

enum Step {
    Cancelled,
    Presence,
    Event(Option<Envelope>),
    Heartbeat,
}

/// One subscribed client connection, owned by the task serving it.
pub struct BridgeConnection {
    recipient_id: String,
    subscription: Subscription,
    presence: Option<PresenceTracker>,
    heartbeat_interval: Duration,
    state: BridgeState,
}

impl BridgeConnection {
    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn channel(&self) -> &str {
        self.subscription.channel()
    }

    /// Stream until closed, then release the subscription. Returns why the
    /// stream ended.
    pub async fn run<S>(mut self, sink: &mut S, cancel: &CancellationToken) -> CloseReason
    where
        S: EventSink + ?Sized,
    {
        self.state = BridgeState::Streaming;
        tracing::info!(recipient_id = %self.recipient_id, "event stream opened");
        self.refresh_presence().await;

        let reason = self.stream(sink, cancel).await;
        self.close(reason).await;
        reason
    }

    async fn stream<S>(&mut self, sink: &mut S, cancel: &CancellationToken) -> CloseReason
    where
        S: EventSink + ?Sized,
    {
        if let Err(reason) = self.send(sink, &Envelope::connected(Utc::now()), cancel).await {
            return reason;
        }

        let period = self.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Ahead of events in the select so a busy stream cannot starve it.
        let mut presence_refresh =
            time::interval_at(Instant::now() + PRESENCE_REFRESH, PRESENCE_REFRESH);
        presence_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = presence_refresh.tick(), if self.presence.is_some() => Step::Presence,
                next = self.subscription.recv() => Step::Event(next),
                _ = heartbeat.tick() => Step::Heartbeat,
            };

            match step {
                Step::Cancelled => return CloseReason::Cancelled,
                Step::Presence => self.refresh_presence().await,
                Step::Event(None) => return CloseReason::StreamEnded,
                Step::Event(Some(envelope)) => {
                    if let Err(reason) = self.send(sink, &envelope, cancel).await {
                        return reason;
                    }
                }
                Step::Heartbeat => {
                    let beat = Envelope::heartbeat(Utc::now());
                    if let Err(reason) = self.send(sink, &beat, cancel).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// Write one frame. A write is abandoned on cancellation or if it takes
    /// longer than a heartbeat interval.
    async fn send<S>(
        &self,
        sink: &mut S,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), CloseReason>
    where
        S: EventSink + ?Sized,
    {
        let frame = match envelope.to_sse_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(recipient_id = %self.recipient_id, ?err, "skipping unencodable event");
                return Ok(());
            }
        };

        let write = async {
            sink.write_frame(&frame).await?;
            sink.flush().await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CloseReason::Cancelled),
            written = time::timeout(self.heartbeat_interval, write) => match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    tracing::debug!(recipient_id = %self.recipient_id, ?err, "stream write failed");
                    Err(CloseReason::PeerGone)
                }
                Err(_) => {
                    tracing::debug!(recipient_id = %self.recipient_id, "stream write timed out");
                    Err(CloseReason::PeerGone)
                }
            },
        }
    }

    async fn refresh_presence(&self) {
        if let Some(presence) = &self.presence {
            if let Err(err) = presence.mark_online(&self.recipient_id).await {
                tracing::warn!(recipient_id = %self.recipient_id, ?err, "presence refresh failed");
            }
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        if matches!(self.state, BridgeState::Closed(_)) {
            return;
        }
        self.state = BridgeState::Closed(reason);
        self.subscription.close().await;

        if let Some(presence) = &self.presence {
            if let Err(err) = presence.mark_offline(&self.recipient_id).await {
                tracing::warn!(recipient_id = %self.recipient_id, ?err, "presence clear failed");
            }
        }

        tracing::info!(recipient_id = %self.recipient_id, ?reason, "event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::realtime::envelope::Action;

    struct ChannelSink(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl EventSink for ChannelSink {
        async fn write_frame(&mut self, frame: &[u8]) -> Result<(), SinkError> {
            self.0.send(frame.to_vec()).map_err(|_| SinkError::PeerGone)
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl EventSink for ClosedSink {
        async fn write_frame(&mut self, _frame: &[u8]) -> Result<(), SinkError> {
            Err(SinkError::PeerGone)
        }
    }

    fn parse(frame: &[u8]) -> Value {
        let text = std::str::from_utf8(frame).unwrap();
        let body = text
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(body).unwrap()
    }

    fn setup() -> (Arc<MemoryBroker>, EventBus, PresenceTracker) {
        let broker = Arc::new(MemoryBroker::new());
        let bus = EventBus::new(broker.clone());
        let presence = PresenceTracker::new(broker.clone());
        (broker, bus, presence)
    }

    #[tokio::test]
    async fn streams_ack_then_events_until_cancelled() {
        let (broker, bus, presence) = setup();
        let bridge = StreamBridge::new(bus.clone()).with_presence(presence.clone());

        let conn = bridge.connect("u1").await.unwrap();
        assert_eq!(conn.state(), BridgeState::Connecting);
        assert_eq!(conn.channel(), "user:u1:events");

        let (tx, mut frames) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { conn.run(&mut ChannelSink(tx), &cancel).await }
        });

        let ack = parse(&frames.recv().await.unwrap());
        assert_eq!(ack["action"], "SYSTEM_MESSAGE");
        assert_eq!(ack["data"]["message"], "Connected to real-time events");
        assert!(presence.is_online("u1").await.unwrap());

        bus.publish_to_recipient("u1", Action::Notification, &json!({ "n": 1 }))
            .await
            .unwrap();
        let event = parse(&frames.recv().await.unwrap());
        assert_eq!(event, json!({ "action": "NOTIFICATION", "data": { "n": 1 } }));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), CloseReason::Cancelled);
        assert_eq!(broker.subscriber_count("user:u1:events").await.unwrap(), 0);
        assert!(!presence.is_online("u1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_gets_heartbeats() {
        let (_broker, bus, _presence) = setup();
        let bridge = StreamBridge::new(bus).heartbeat_interval(Duration::from_secs(10));
        let conn = bridge.connect("u1").await.unwrap();

        let (tx, mut frames) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { conn.run(&mut ChannelSink(tx), &cancel).await }
        });

        frames.recv().await.unwrap();
        let started = Instant::now();
        let beat = parse(&frames.recv().await.unwrap());
        assert_eq!(beat["action"], "HEARTBEAT");
        assert!(beat["data"]["timestamp"].is_string());
        assert!(started.elapsed() >= Duration::from_secs(10));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), CloseReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_holds_while_streaming_with_slow_heartbeat() {
        let (_broker, bus, presence) = setup();
        let bridge = StreamBridge::new(bus.clone())
            .heartbeat_interval(Duration::from_secs(60))
            .with_presence(presence.clone());
        let conn = bridge.connect("u1").await.unwrap();

        let (tx, mut frames) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { conn.run(&mut ChannelSink(tx), &cancel).await }
        });
        frames.recv().await.unwrap();

        // Two and a half minutes of steady traffic, checked every 5s.
        for tick in 0..30 {
            time::advance(Duration::from_secs(5)).await;
            bus.publish_to_recipient("u1", Action::Notification, &tick)
                .await
                .unwrap();
            loop {
                let frame = parse(&frames.recv().await.unwrap());
                if frame["action"] == "NOTIFICATION" {
                    break;
                }
            }
            assert!(
                presence.is_online("u1").await.unwrap(),
                "offline after {}s",
                (tick + 1) * 5
            );
        }

        cancel.cancel();
        assert_eq!(task.await.unwrap(), CloseReason::Cancelled);
        assert!(!presence.is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_write_closes_as_peer_gone() {
        let (broker, bus, presence) = setup();
        let bridge = StreamBridge::new(bus).with_presence(presence.clone());
        let conn = bridge.connect("u1").await.unwrap();

        let reason = conn.run(&mut ClosedSink, &CancellationToken::new()).await;
        assert_eq!(reason, CloseReason::PeerGone);
        assert_eq!(broker.subscriber_count("user:u1:events").await.unwrap(), 0);
        assert!(!presence.is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn other_recipients_events_are_not_delivered() {
        let (_broker, bus, _presence) = setup();
        let conn = StreamBridge::new(bus.clone()).connect("u1").await.unwrap();

        let (tx, mut frames) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { conn.run(&mut ChannelSink(tx), &cancel).await }
        });
        frames.recv().await.unwrap();

        bus.publish_to_recipient("u2", Action::Notification, &"not yours")
            .await
            .unwrap();
        bus.publish_to_recipient("u1", Action::Notification, &"yours")
            .await
            .unwrap();
        assert_eq!(parse(&frames.recv().await.unwrap())["data"], "yours");

        cancel.cancel();
        task.await.unwrap();
    }
}
