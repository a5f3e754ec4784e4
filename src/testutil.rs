//! Shared fixtures for in-crate tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use parking_lot::Mutex;

use crate::clock::{Clock, ManualClock};
use crate::delivery::{DeliveryChannel, DeliveryError, DeliveryReceipt};
use crate::error::{PacerError, Result};
use crate::model::{Campaign, Recipient};
use crate::queue::QueueProcessor;
use crate::ratelimit::{RateLimitSettings, RateLimiter};
use crate::store::{CampaignStore, MemoryStateStore, MemoryStore, StateStore};

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

/// Default pacing with the daily reset pinned to UTC midnight.
pub(crate) fn test_settings() -> RateLimitSettings {
    RateLimitSettings {
        reset_offset: FixedOffset::east_opt(0),
        ..RateLimitSettings::default()
    }
}

/// A delivery channel that succeeds unless told otherwise per address.
#[derive(Default)]
pub(crate) struct ScriptedChannel {
    failures: Mutex<HashMap<String, VecDeque<String>>>,
    attempts: Mutex<Vec<String>>,
}

impl ScriptedChannel {
    /// Queue failure reasons returned by the next attempts to `address`.
    pub(crate) fn fail(&self, address: &str, reasons: &[&str]) {
        self.failures
            .lock()
            .entry(address.to_string())
            .or_default()
            .extend(reasons.iter().map(|r| r.to_string()));
    }

    pub(crate) fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    async fn deliver(&self, address: &str, _content: &str) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        self.attempts.lock().push(address.to_string());
        let scripted = self
            .failures
            .lock()
            .get_mut(address)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(reason) => Err(DeliveryError::new(reason)),
            None => Ok(DeliveryReceipt {
                provider_id: Some(format!("provider-{}", address)),
                delivered_at: Utc::now(),
            }),
        }
    }
}

/// A state store whose writes can be switched off.
#[derive(Default)]
pub(crate) struct FlakyStateStore {
    inner: MemoryStateStore,
    failing: AtomicBool,
}

impl FlakyStateStore {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PacerError::StoreUnavailable("disk offline".into()));
        }
        self.inner.set(key, value).await
    }
}

/// A processor wired to in-memory collaborators and a virtual clock.
pub(crate) struct Harness {
    pub processor: Arc<QueueProcessor>,
    pub store: Arc<dyn CampaignStore>,
    pub channel: Arc<ScriptedChannel>,
    pub clock: Arc<ManualClock>,
    pub persistence: Arc<MemoryStateStore>,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub(crate) async fn with_settings(settings: RateLimitSettings) -> Self {
        Self::with_store(settings, Arc::new(MemoryStore::new())).await
    }

    pub(crate) async fn with_store(settings: RateLimitSettings, store: Arc<dyn CampaignStore>) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let persistence = Arc::new(MemoryStateStore::new());
        let channel = Arc::new(ScriptedChannel::default());
        let processor = Self::build(&store, &channel, &clock, &persistence, settings).await;
        Self {
            processor,
            store,
            channel,
            clock,
            persistence,
        }
    }

    /// A fresh processor over the same store, clock and persisted state,
    /// as after a process restart.
    pub(crate) async fn restart(&self) -> Arc<QueueProcessor> {
        Self::build(
            &self.store,
            &self.channel,
            &self.clock,
            &self.persistence,
            test_settings(),
        )
        .await
    }

    async fn build(
        store: &Arc<dyn CampaignStore>,
        channel: &Arc<ScriptedChannel>,
        clock: &Arc<ManualClock>,
        persistence: &Arc<MemoryStateStore>,
        settings: RateLimitSettings,
    ) -> Arc<QueueProcessor> {
        let clock: Arc<dyn Clock> = clock.clone();
        let persistence: Arc<dyn StateStore> = persistence.clone();
        let limiter = RateLimiter::load(settings, clock.clone(), persistence.clone())
            .await
            .unwrap();
        QueueProcessor::new(
            store.clone(),
            channel.clone(),
            Arc::new(limiter),
            clock,
            persistence,
        )
        .open()
        .await
        .unwrap()
    }

    /// Create a draft campaign with one recipient per address, enqueued.
    pub(crate) async fn campaign(&self, addresses: &[&str]) -> Campaign {
        let campaign = self
            .processor
            .create_campaign("spring sale", "Hi {{firstName}}")
            .await
            .unwrap();
        let mut ids = Vec::new();
        for address in addresses {
            let recipient = Recipient::new(*address).with_name("Sam", "Doe");
            ids.push(self.processor.add_recipient(recipient).await.unwrap());
        }
        self.processor.enqueue(campaign.id, &ids).await.unwrap();
        self.processor.get_campaign(campaign.id).await.unwrap()
    }
}
