//! Distributed counting semaphore for rate-limited external resources.
//!
//! One counter per `(provider, key_index)` lives in the broker, so the
//! ceiling holds across every process sharing it. The counter is only ever
//! changed by [`ACQUIRE_SLOT`] (check + increment + first-holder expiry, run
//! atomically) and by the broker's atomic decrement on release.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{AtomicScript, Broker, BrokerError};

/// Grants a slot if the counter is below `ARGV[1]`. Only the holder that
/// takes the counter from empty arms the `ARGV[2]`-second expiry, so a steady
/// stream of acquires cannot keep an abandoned counter alive.
pub const ACQUIRE_SLOT: AtomicScript = AtomicScript {
    name: "acquire_slot",
    source: r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    current = 0
else
    current = tonumber(current)
end

if current < tonumber(ARGV[1]) then
    local new_value = redis.call('INCR', KEYS[1])
    if new_value == 1 then
        redis.call('EXPIRE', KEYS[1], ARGV[2])
    end
    return 1
end
return 0
"#,
};

pub fn slot_key(provider: &str, key_index: u32) -> String {
    format!("{provider}:active_connections:{key_index}")
}

#[derive(Clone)]
pub struct AdmissionController {
    broker: Arc<dyn Broker>,
}

impl AdmissionController {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Try to take one of `max_concurrent` slots.
    ///
    /// An `Err` means the broker could not be reached; treat it as not granted.
    pub async fn try_acquire(
        &self,
        provider: &str,
        key_index: u32,
        max_concurrent: u32,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let key = slot_key(provider, key_index);
        // EXPIRE 0 would delete the key outright.
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let granted = self
            .broker
            .run_script(&ACQUIRE_SLOT, &[key.as_str()], &[i64::from(max_concurrent), ttl_secs])
            .await?
            == 1;

        tracing::debug!(%provider, key_index, max_concurrent, granted, "slot acquire");
        Ok(granted)
    }

    /// Give back a slot taken with [`try_acquire`](Self::try_acquire).
    ///
    /// Must only follow a granted acquire. The counter is not clamped: an
    /// unmatched release, or one landing after the counter expired, drives it
    /// below zero until the key is rewritten.
    pub async fn release(&self, provider: &str, key_index: u32) -> Result<(), BrokerError> {
        let remaining = self.broker.decr(&slot_key(provider, key_index)).await?;
        if remaining < 0 {
            tracing::warn!(%provider, key_index, remaining, "slot counter below zero after release");
        }
        Ok(())
    }

    /// Slots currently held. An absent counter reads as 0.
    pub async fn active_slots(&self, provider: &str, key_index: u32) -> Result<i64, BrokerError> {
        let key = slot_key(provider, key_index);
        match self.broker.get(&key).await? {
            Some(value) => value
                .parse()
                .map_err(|_| BrokerError::NotAnInteger { key }),
            None => Ok(0),
        }
    }

    /// Run `work` while holding a slot. Returns `Ok(None)` without running it
    /// when no slot is free. The slot is released when `work` finishes or when
    /// this future is dropped part-way; a holder whose process dies is covered
    /// by the counter TTL.
    pub async fn with_slot<F, T>(
        &self,
        provider: &str,
        key_index: u32,
        max_concurrent: u32,
        ttl: Duration,
        work: F,
    ) -> Result<Option<T>, BrokerError>
    where
        F: Future<Output = T>,
    {
        if !self
            .try_acquire(provider, key_index, max_concurrent, ttl)
            .await?
        {
            return Ok(None);
        }

        let permit = SlotPermit {
            admission: self.clone(),
            provider: provider.to_string(),
            key_index,
            held: true,
        };
        let output = work.await;
        permit.release().await;
        Ok(Some(output))
    }
}

/// A granted slot. Released explicitly once the work completes; if dropped
/// while still held, the release is handed to a background task.
struct SlotPermit {
    admission: AdmissionController,
    provider: String,
    key_index: u32,
    held: bool,
}

impl SlotPermit {
    async fn release(mut self) {
        self.held = false;
        if let Err(err) = self.admission.release(&self.provider, self.key_index).await {
            tracing::error!(provider = %self.provider, key_index = self.key_index, ?err, "failed to release slot");
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(provider = %self.provider, key_index = self.key_index, "slot abandoned outside a runtime, left to expire");
            return;
        };

        let admission = self.admission.clone();
        let provider = std::mem::take(&mut self.provider);
        let key_index = self.key_index;
        tracing::debug!(%provider, key_index, "slot holder dropped, releasing");
        runtime.spawn(async move {
            if let Err(err) = admission.release(&provider, key_index).await {
                tracing::error!(%provider, key_index, ?err, "failed to release abandoned slot");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    const TTL: Duration = Duration::from_secs(60);

    fn controller() -> AdmissionController {
        AdmissionController::new(Arc::new(MemoryBroker::new()))
    }

    #[test]
    fn slot_key_format() {
        assert_eq!(slot_key("openai", 2), "openai:active_connections:2");
    }

    #[tokio::test]
    async fn grants_up_to_ceiling() {
        let admission = controller();
        assert!(admission.try_acquire("p", 0, 2, TTL).await.unwrap());
        assert!(admission.try_acquire("p", 0, 2, TTL).await.unwrap());
        assert!(!admission.try_acquire("p", 0, 2, TTL).await.unwrap());
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn key_indexes_are_independent() {
        let admission = controller();
        assert!(admission.try_acquire("p", 0, 1, TTL).await.unwrap());
        assert!(admission.try_acquire("p", 1, 1, TTL).await.unwrap());
        assert!(admission.try_acquire("q", 0, 1, TTL).await.unwrap());
        assert!(!admission.try_acquire("p", 0, 1, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_exactly_one_slot() {
        let admission = controller();
        admission.try_acquire("p", 0, 3, TTL).await.unwrap();
        admission.try_acquire("p", 0, 3, TTL).await.unwrap();
        let after_grant = admission.active_slots("p", 0).await.unwrap();

        admission.release("p", 0).await.unwrap();
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), after_grant - 1);
    }

    #[tokio::test]
    async fn zero_ceiling_never_grants() {
        let admission = controller();
        assert!(!admission.try_acquire("p", 0, 0, TTL).await.unwrap());
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn absent_counter_reads_zero() {
        assert_eq!(controller().active_slots("p", 9).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unmatched_release_is_not_clamped() {
        let admission = controller();
        admission.release("p", 0).await.unwrap();
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_expires_after_ttl_when_holders_vanish() {
        let admission = controller();
        assert!(admission.try_acquire("p", 0, 2, TTL).await.unwrap());
        assert!(admission.try_acquire("p", 0, 2, TTL).await.unwrap());

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), 0);
        assert!(admission.try_acquire("p", 0, 2, TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn later_acquires_do_not_extend_expiry() {
        let admission = controller();
        assert!(admission.try_acquire("p", 0, 5, TTL).await.unwrap());

        tokio::time::advance(TTL - Duration::from_secs(5)).await;
        assert!(admission.try_acquire("p", 0, 5, TTL).await.unwrap());

        // Still measured from the first acquire.
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn with_slot_runs_and_releases() {
        let admission = controller();
        let out = admission
            .with_slot("p", 0, 1, TTL, async { 7 })
            .await
            .unwrap();
        assert_eq!(out, Some(7));
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn with_slot_skips_work_when_full() {
        let admission = controller();
        assert!(admission.try_acquire("p", 0, 1, TTL).await.unwrap());

        let out = admission
            .with_slot("p", 0, 1, TTL, async { unreachable!("must not run") })
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_slot_releases_when_cancelled_mid_work() {
        let admission = controller();
        let long_ttl = Duration::from_secs(600);

        let cut_short = tokio::time::timeout(
            Duration::from_millis(50),
            admission.with_slot("p", 0, 1, long_ttl, tokio::time::sleep(Duration::from_secs(10))),
        )
        .await;
        assert!(cut_short.is_err());

        // The release runs on a spawned task.
        for _ in 0..10 {
            if admission.active_slots("p", 0).await.unwrap() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(admission.active_slots("p", 0).await.unwrap(), 0);
        assert!(admission.try_acquire("p", 0, 1, long_ttl).await.unwrap());
    }
}
