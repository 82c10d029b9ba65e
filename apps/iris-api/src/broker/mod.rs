//! Capability interface over the shared external store.
//!
//! Everything that coordinates across processes (pub/sub fan-out, presence
//! markers, admission counters) goes through a [`Broker`]. Backed by Redis in
//! production and an in-memory map in tests.

pub mod memory;
pub mod redis_broker;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

/// Raw payloads pushed by the broker for one subscription. Ends when the
/// broker side closes the subscription; dropping it unsubscribes.
pub type MessageStream = BoxStream<'static, Vec<u8>>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(#[from] redis::RedisError),
    #[error("broker did not confirm subscription to {channel} within {timeout:?}")]
    SubscribeTimeout { channel: String, timeout: Duration },
    #[error("unknown atomic script `{0}`")]
    UnknownScript(&'static str),
    #[error("value at `{key}` is not an integer")]
    NotAnInteger { key: String },
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// A read-modify-write operation the broker executes indivisibly.
///
/// `source` is the Lua body run by Redis; backends that cannot run Lua
/// dispatch on `name` instead.
#[derive(Debug, Clone, Copy)]
pub struct AtomicScript {
    pub name: &'static str,
    pub source: &'static str,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Push a payload to every current subscriber of `channel`. Returns the
    /// number of subscribers that received it.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError>;

    /// Open a subscription. Resolves only once the broker has acknowledged it.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BrokerError>;

    /// Channels with at least one subscriber whose name matches a glob pattern.
    async fn channels_matching(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;

    async fn subscriber_count(&self, channel: &str) -> Result<usize, BrokerError>;

    async fn run_script(
        &self,
        script: &AtomicScript,
        keys: &[&str],
        args: &[i64],
    ) -> Result<i64, BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BrokerError>;
    async fn del(&self, key: &str) -> Result<(), BrokerError>;
    async fn exists(&self, key: &str) -> Result<bool, BrokerError>;
    /// Atomic decrement; an absent key counts as 0.
    async fn decr(&self, key: &str) -> Result<i64, BrokerError>;
}

/// Redis-style glob match supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
