//! In-process campaign store with optional snapshot persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::state::{load_json, save_json, StateStore, CAMPAIGN_STORE_KEY};
use super::{CampaignStore, Outcome};
use crate::error::{PacerError, Result};
use crate::model::{
    AnalyticsEvent, Campaign, CampaignId, CampaignStatus, Message, MessageId, MessageStatus,
    Recipient, RecipientId,
};

#[derive(Debug, Default)]
struct Tables {
    campaigns: HashMap<CampaignId, Campaign>,
    messages: HashMap<MessageId, Message>,
    recipients: HashMap<RecipientId, Recipient>,
    events: Vec<AnalyticsEvent>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    campaigns: Vec<Campaign>,
    messages: Vec<Message>,
    recipients: Vec<Recipient>,
    events: Vec<AnalyticsEvent>,
}

impl From<&Tables> for Snapshot {
    fn from(tables: &Tables) -> Self {
        Self {
            campaigns: tables.campaigns.values().cloned().collect(),
            messages: tables.messages.values().cloned().collect(),
            recipients: tables.recipients.values().cloned().collect(),
            events: tables.events.clone(),
        }
    }
}

impl From<Snapshot> for Tables {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            campaigns: snapshot.campaigns.into_iter().map(|c| (c.id, c)).collect(),
            messages: snapshot.messages.into_iter().map(|m| (m.id, m)).collect(),
            recipients: snapshot.recipients.into_iter().map(|r| (r.id, r)).collect(),
            events: snapshot.events,
        }
    }
}

/// A campaign store held in memory.
///
/// When opened over a [`StateStore`] every mutation is followed by a full
/// snapshot write, so the store can be rebuilt after a restart. A failed
/// snapshot is reported as [`PacerError::StoreUnavailable`]; the in-memory
/// change is kept, except for `enqueue_messages`, which is rolled back.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    persistence: Option<Arc<dyn StateStore>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an ephemeral store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            persistence: None,
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a store backed by `persistence`, restoring the last snapshot.
    pub async fn open(persistence: Arc<dyn StateStore>) -> Result<Self> {
        let tables = match load_json::<Snapshot>(persistence.as_ref(), CAMPAIGN_STORE_KEY).await? {
            Some(snapshot) => {
                let tables = Tables::from(snapshot);
                info!(
                    campaigns = tables.campaigns.len(),
                    messages = tables.messages.len(),
                    "Restored campaign store snapshot"
                );
                tables
            }
            None => Tables::default(),
        };

        Ok(Self {
            tables: RwLock::new(tables),
            persistence: Some(persistence),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn flush(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        // Serialize under the flush lock so writes land in mutation order.
        let _guard = self.flush_lock.lock().await;
        let bytes = {
            let tables = self.tables.read();
            serde_json::to_vec(&Snapshot::from(&*tables))?
        };
        persistence
            .set(CAMPAIGN_STORE_KEY, bytes)
            .await
            .map_err(|e| match e {
                PacerError::StoreUnavailable(_) => e,
                other => PacerError::StoreUnavailable(other.to_string()),
            })
    }

    fn with_campaign<F>(&self, id: CampaignId, mutate: F) -> Result<Campaign>
    where
        F: FnOnce(&mut Campaign) -> Result<()>,
    {
        let mut tables = self.tables.write();
        let campaign = tables
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| PacerError::not_found("campaign", id))?;
        mutate(campaign)?;
        Ok(campaign.clone())
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert_campaign(&self, campaign: Campaign) -> Result<()> {
        self.tables.write().campaigns.insert(campaign.id, campaign);
        self.flush().await
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.tables.read().campaigns.get(&id).cloned())
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> = self.tables.read().campaigns.values().cloned().collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(campaigns)
    }

    async fn campaigns_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        Ok(self
            .tables
            .read()
            .campaigns
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }

    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<Campaign> {
        let campaign = self.with_campaign(id, |campaign| {
            if !campaign.status.can_transition_to(status) {
                return Err(PacerError::invalid_state(
                    "change campaign status",
                    format!("{} -> {}", campaign.status, status),
                ));
            }
            campaign.status = status;
            campaign.updated_at = at;
            if status == CampaignStatus::Active && campaign.started_at.is_none() {
                campaign.started_at = Some(at);
            }
            if status.is_terminal() {
                campaign.completed_at = Some(at);
            }
            Ok(())
        })?;
        debug!(campaign_id = %id, status = %status, "Campaign status updated");
        self.flush().await?;
        Ok(campaign)
    }

    async fn enqueue_messages(
        &self,
        id: CampaignId,
        messages: Vec<Message>,
        at: DateTime<Utc>,
    ) -> Result<Campaign> {
        if messages.iter().any(|m| m.campaign_id != id) {
            return Err(PacerError::invalid_state(
                "enqueue messages",
                "message belongs to another campaign",
            ));
        }
        let count = messages
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .count() as u64;
        let inserted: Vec<MessageId> = messages.iter().map(|m| m.id).collect();

        let (campaign, previous_update) = {
            let mut tables = self.tables.write();
            let campaign = tables
                .campaigns
                .get_mut(&id)
                .ok_or_else(|| PacerError::not_found("campaign", id))?;
            let previous_update = campaign.updated_at;
            campaign.total += count;
            campaign.pending += count;
            campaign.updated_at = at;
            let campaign = campaign.clone();
            for message in messages {
                tables.messages.insert(message.id, message);
            }
            (campaign, previous_update)
        };

        if let Err(e) = self.flush().await {
            let mut tables = self.tables.write();
            for message_id in &inserted {
                tables.messages.remove(message_id);
            }
            if let Some(campaign) = tables.campaigns.get_mut(&id) {
                campaign.total -= count;
                campaign.pending -= count;
                campaign.updated_at = previous_update;
            }
            return Err(e);
        }
        debug!(campaign_id = %id, enqueued = count, "Messages enqueued");
        Ok(campaign)
    }

    async fn record_outcome(
        &self,
        id: CampaignId,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<Campaign> {
        let campaign = self.with_campaign(id, |campaign| {
            if campaign.pending == 0 {
                return Err(PacerError::invalid_state(
                    "record an outcome",
                    "campaign has no pending messages",
                ));
            }
            campaign.pending -= 1;
            match outcome {
                Outcome::Sent => campaign.sent += 1,
                Outcome::Failed => campaign.failed += 1,
            }
            campaign.updated_at = at;
            Ok(())
        })?;
        self.flush().await?;
        Ok(campaign)
    }

    async fn delete_campaign(&self, id: CampaignId) -> Result<bool> {
        let removed = {
            let mut tables = self.tables.write();
            let removed = tables.campaigns.remove(&id).is_some();
            if removed {
                tables.messages.retain(|_, m| m.campaign_id != id);
                tables.events.retain(|e| e.campaign_id != id);
            }
            removed
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.tables.read().messages.get(&id).cloned())
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        {
            let mut tables = self.tables.write();
            let slot = tables
                .messages
                .get_mut(&message.id)
                .ok_or_else(|| PacerError::not_found("message", message.id))?;
            *slot = message.clone();
        }
        self.flush().await
    }

    async fn next_pending_message(&self, campaign_id: CampaignId) -> Result<Option<Message>> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| m.campaign_id == campaign_id && m.status == MessageStatus::Pending)
            .min_by_key(|m| m.priority)
            .cloned())
    }

    async fn messages_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| m.campaign_id == campaign_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.priority);
        Ok(messages)
    }

    async fn insert_recipient(&self, recipient: Recipient) -> Result<()> {
        self.tables.write().recipients.insert(recipient.id, recipient);
        self.flush().await
    }

    async fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>> {
        Ok(self.tables.read().recipients.get(&id).cloned())
    }

    async fn mark_contacted(&self, id: RecipientId, at: DateTime<Utc>) -> Result<()> {
        {
            let mut tables = self.tables.write();
            let recipient = tables
                .recipients
                .get_mut(&id)
                .ok_or_else(|| PacerError::not_found("recipient", id))?;
            recipient.last_contacted_at = Some(at);
        }
        self.flush().await
    }

    async fn record_event(&self, event: AnalyticsEvent) -> Result<()> {
        self.tables.write().events.push(event);
        self.flush().await
    }

    async fn events_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<AnalyticsEvent>> {
        Ok(self
            .tables
            .read()
            .events
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;
    use crate::store::MemoryStateStore;
    use crate::testutil::FlakyStateStore;

    async fn seeded(store: &MemoryStore, count: u64) -> (Campaign, Vec<Message>) {
        let now = Utc::now();
        let campaign = Campaign::new("launch", "Hi {{firstName}}", now);
        store.insert_campaign(campaign.clone()).await.unwrap();

        let mut messages = Vec::new();
        for priority in (0..count).rev() {
            let recipient = Recipient::new(format!("+1555010{}", priority));
            store.insert_recipient(recipient.clone()).await.unwrap();
            messages.push(Message::new(campaign.id, &recipient, "hi".into(), priority));
        }
        let campaign = store
            .enqueue_messages(campaign.id, messages.clone(), now)
            .await
            .unwrap();
        (campaign, messages)
    }

    #[tokio::test]
    async fn test_next_pending_follows_priority() {
        let store = MemoryStore::new();
        let (campaign, _) = seeded(&store, 3).await;

        let first = store.next_pending_message(campaign.id).await.unwrap().unwrap();
        assert_eq!(first.priority, 0);

        let mut claimed = first.clone();
        claimed.status = MessageStatus::Queued;
        store.update_message(&claimed).await.unwrap();

        let next = store.next_pending_message(campaign.id).await.unwrap().unwrap();
        assert_eq!(next.priority, 1);
    }

    #[tokio::test]
    async fn test_record_outcome_keeps_counters_balanced() {
        let store = MemoryStore::new();
        let (campaign, _) = seeded(&store, 2).await;
        assert_eq!((campaign.total, campaign.pending), (2, 2));

        let now = Utc::now();
        let c = store.record_outcome(campaign.id, Outcome::Sent, now).await.unwrap();
        assert!(c.counters_balanced());
        let c = store.record_outcome(campaign.id, Outcome::Failed, now).await.unwrap();
        assert_eq!((c.sent, c.failed, c.pending), (1, 1, 0));
        assert!(c.counters_balanced());

        let err = store
            .record_outcome(campaign.id, Outcome::Sent, now)
            .await
            .unwrap_err();
        assert!(matches!(err, PacerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_status_stamps_timestamps() {
        let store = MemoryStore::new();
        let (campaign, _) = seeded(&store, 1).await;
        let now = Utc::now();

        let active = store
            .set_campaign_status(campaign.id, CampaignStatus::Active, now)
            .await
            .unwrap();
        assert_eq!(active.started_at, Some(now));
        assert!(active.completed_at.is_none());

        let done = store
            .set_campaign_status(campaign.id, CampaignStatus::Completed, now)
            .await
            .unwrap();
        assert_eq!(done.completed_at, Some(now));
    }

    #[tokio::test]
    async fn test_status_change_follows_state_machine() {
        let store = MemoryStore::new();
        let (campaign, _) = seeded(&store, 1).await;
        let now = Utc::now();

        let err = store
            .set_campaign_status(campaign.id, CampaignStatus::Paused, now)
            .await
            .unwrap_err();
        assert!(matches!(err, PacerError::InvalidState { .. }));

        store
            .set_campaign_status(campaign.id, CampaignStatus::Active, now)
            .await
            .unwrap();
        store
            .set_campaign_status(campaign.id, CampaignStatus::Completed, now)
            .await
            .unwrap();
        let err = store
            .set_campaign_status(campaign.id, CampaignStatus::Active, now)
            .await
            .unwrap_err();
        assert!(matches!(err, PacerError::InvalidState { .. }));

        let stored = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn test_enqueue_rolled_back_when_snapshot_fails() {
        let persistence = Arc::new(FlakyStateStore::default());
        let store = MemoryStore::open(persistence.clone()).await.unwrap();
        let campaign = Campaign::new("launch", "hi", Utc::now());
        store.insert_campaign(campaign.clone()).await.unwrap();
        let recipient = Recipient::new("+15550100");
        let message = Message::new(campaign.id, &recipient, "hi".into(), 0);

        persistence.set_failing(true);
        let err = store
            .enqueue_messages(campaign.id, vec![message.clone()], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PacerError::StoreUnavailable(_)));

        let stored = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored, campaign);
        assert!(store.get_message(message.id).await.unwrap().is_none());
        assert!(store.next_pending_message(campaign.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = MemoryStore::new();
        let (campaign, messages) = seeded(&store, 2).await;
        store
            .record_event(AnalyticsEvent::campaign(
                campaign.id,
                EventKind::CampaignCompleted,
                Utc::now(),
            ))
            .await
            .unwrap();

        assert!(store.delete_campaign(campaign.id).await.unwrap());
        assert!(store.get_message(messages[0].id).await.unwrap().is_none());
        assert!(store.events_for_campaign(campaign.id).await.unwrap().is_empty());
        assert!(!store.delete_campaign(campaign.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_restores_after_reopen() {
        let persistence: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let campaign_id = {
            let store = MemoryStore::open(persistence.clone()).await.unwrap();
            let (campaign, _) = seeded(&store, 2).await;
            campaign.id
        };

        let store = MemoryStore::open(persistence).await.unwrap();
        let campaign = store.get_campaign(campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.total, 2);
        assert_eq!(store.messages_for_campaign(campaign_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_campaign_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .enqueue_messages(uuid::Uuid::new_v4(), Vec::new(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PacerError::NotFound { kind: "campaign", .. }));
    }
}
