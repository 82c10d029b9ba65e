//! In-process broker for tests and single-node runs.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use super::{glob_match, AtomicScript, Broker, BrokerError, MessageStream};
use crate::realtime::admission::ACQUIRE_SLOT;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Keys live in one mutex-guarded map so scripts run indivisibly; expiry is
/// evaluated lazily against the tokio clock.
pub struct MemoryBroker {
    keys: Mutex<HashMap<String, Entry>>,
    channels: DashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            channels: DashMap::new(),
        }
    }

    /// Drop closed senders on `channel`, and the channel itself once nobody
    /// is left. Returns the live subscriber count.
    fn prune_channel(&self, channel: &str) -> usize {
        let live = match self.channels.get_mut(channel) {
            Some(mut subs) => {
                subs.retain(|tx| !tx.is_closed());
                subs.len()
            }
            None => return 0,
        };
        if live == 0 {
            self.channels.remove_if(channel, |_, subs| subs.is_empty());
        }
        live
    }

    fn prune_all(&self) {
        self.channels.retain(|_, subs| {
            subs.retain(|tx| !tx.is_closed());
            !subs.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_channels(&self) -> usize {
        self.channels.len()
    }

    fn acquire_slot(&self, key: &str, max: i64, ttl_secs: i64) -> Result<i64, BrokerError> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        if keys.get(key).is_some_and(|e| e.is_expired(now)) {
            keys.remove(key);
        }

        let current = match keys.get(key) {
            Some(entry) => parse_int(key, &entry.value)?,
            None => 0,
        };
        if current >= max {
            return Ok(0);
        }

        let entry = keys.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let new_value = current + 1;
        entry.value = new_value.to_string();
        if new_value == 1 {
            entry.expires_at = Some(now + Duration::from_secs(ttl_secs.max(0) as u64));
        }
        Ok(1)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_int(key: &str, value: &str) -> Result<i64, BrokerError> {
    value.parse().map_err(|_| BrokerError::NotAnInteger {
        key: key.to_string(),
    })
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        let delivered = match self.channels.get_mut(channel) {
            Some(mut subs) => {
                subs.retain(|tx| tx.send(payload.to_vec()).is_ok());
                subs.len()
            }
            None => return Ok(0),
        };
        if delivered == 0 {
            self.channels.remove_if(channel, |_, subs| subs.is_empty());
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        Ok(stream.boxed())
    }

    async fn channels_matching(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        self.prune_all();
        let mut matched: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        matched.sort();
        Ok(matched)
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, BrokerError> {
        Ok(self.prune_channel(channel))
    }

    async fn run_script(
        &self,
        script: &AtomicScript,
        keys: &[&str],
        args: &[i64],
    ) -> Result<i64, BrokerError> {
        match (script.name, keys, args) {
            (name, [key], [max, ttl_secs]) if name == ACQUIRE_SLOT.name => {
                self.acquire_slot(key, *max, *ttl_secs)
            }
            _ => Err(BrokerError::UnknownScript(script.name)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let now = Instant::now();
        let keys = self.keys.lock();
        Ok(keys
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BrokerError> {
        self.keys.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        self.keys.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BrokerError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn decr(&self, key: &str) -> Result<i64, BrokerError> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        if keys.get(key).is_some_and(|e| e.is_expired(now)) {
            keys.remove(key);
        }

        // Like Redis DECR: an existing TTL survives, a fresh key has none.
        let entry = keys.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let value = parse_int(key, &entry.value)? - 1;
        entry.value = value.to_string();
        Ok(value)
    }
}
