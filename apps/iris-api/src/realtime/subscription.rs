//! A live, single-consumer subscription to one broker channel.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::MessageStream;

use super::envelope::Envelope;

/// Decoded envelopes buffered between the deliver task and the consumer.
const DELIVER_BUFFER: usize = 64;

/// Decoded events from one channel.
///
/// A background deliver task drains the broker's raw message stream, decodes
/// each payload and hands it over through a bounded queue. Malformed payloads
/// are logged and skipped. The broker-side subscription is released when the
/// deliver task exits: after [`close`](Self::close), on drop, or when the
/// broker ends the stream.
pub struct Subscription {
    channel: String,
    events: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    deliver: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn spawn(channel: String, raw: MessageStream) -> Self {
        let (tx, events) = mpsc::channel(DELIVER_BUFFER);
        let cancel = CancellationToken::new();
        let deliver = tokio::spawn(deliver(channel.clone(), raw, tx, cancel.clone()));

        Self {
            channel,
            events,
            cancel,
            deliver: Some(deliver),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event, or `None` once the broker side has closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    /// Stop delivery and wait until the broker subscription is released.
    /// Calling it again is a no-op.
    pub async fn close(&mut self) {
        let Some(deliver) = self.deliver.take() else {
            return;
        };
        self.cancel.cancel();
        self.events.close();
        if let Err(err) = deliver.await {
            tracing::warn!(channel = %self.channel, ?err, "deliver task ended abnormally");
        }
        tracing::debug!(channel = %self.channel, "subscription closed");
    }

    pub fn is_closed(&self) -> bool {
        self.deliver.is_none()
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn deliver(
    channel: String,
    mut raw: MessageStream,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            next = raw.next() => match next {
                Some(payload) => payload,
                None => {
                    tracing::debug!(%channel, "broker ended subscription");
                    break;
                }
            },
        };

        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(%channel, ?err, "dropping malformed event");
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(envelope) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    // `raw` drops here, which unsubscribes on the broker.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::envelope::Action;

    fn raw_from(payloads: &[&str]) -> MessageStream {
        let owned: Vec<Vec<u8>> = payloads.iter().map(|p| p.as_bytes().to_vec()).collect();
        futures_util::stream::iter(owned).boxed()
    }

    #[tokio::test]
    async fn skips_malformed_payloads() {
        let raw = raw_from(&[
            r#"{"action":"NOTIFICATION","data":1}"#,
            "{broken",
            r#"{"action":"NOTIFICATION","data":2}"#,
        ]);
        let mut sub = Subscription::spawn("c".to_string(), raw);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.data(), &serde_json::json!(1));
        let second = sub.recv().await.unwrap();
        assert_eq!(second.action(), &Action::Notification);
        assert_eq!(second.data(), &serde_json::json!(2));

        // Raw stream exhausted: the subscription ends.
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let raw: MessageStream = futures_util::stream::pending().boxed();
        let mut sub = Subscription::spawn("c".to_string(), raw);
        assert!(!sub.is_closed());

        sub.close().await;
        assert!(sub.is_closed());
        sub.close().await;
        assert!(sub.recv().await.is_none());
    }
}
