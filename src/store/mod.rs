//! Campaign, message and recipient storage.

mod memory;
mod state;

pub use memory::MemoryStore;
pub use state::{
    load_json, save_json, FileStateStore, MemoryStateStore, StateStore, CAMPAIGN_STORE_KEY,
    QUEUE_STATE_KEY, RATE_LIMITER_KEY,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    AnalyticsEvent, Campaign, CampaignId, CampaignStatus, Message, MessageId, Recipient,
    RecipientId,
};

/// Final result of one message, applied to its campaign's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Failed,
}

/// Trait for campaign store implementations.
///
/// Counter updates are atomic with respect to each other: one call moves
/// exactly one message from `pending` to `sent` or `failed`.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert_campaign(&self, campaign: Campaign) -> Result<()>;

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// All campaigns, newest first.
    async fn list_campaigns(&self) -> Result<Vec<Campaign>>;

    async fn campaigns_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;

    /// Set the status, stamping `started_at` on first activation and
    /// `completed_at` when the campaign reaches a terminal status.
    ///
    /// Fails with `InvalidState` when the campaign state machine does not
    /// allow the move.
    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<Campaign>;

    /// Insert a campaign's new messages and grow `total` and `pending` by
    /// the number of them that are `pending`. All or nothing: on error
    /// neither the messages nor the counters are kept.
    async fn enqueue_messages(
        &self,
        id: CampaignId,
        messages: Vec<Message>,
        at: DateTime<Utc>,
    ) -> Result<Campaign>;

    /// Move one message's worth of `pending` into `sent` or `failed`.
    async fn record_outcome(
        &self,
        id: CampaignId,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<Campaign>;

    /// Remove a campaign and all of its messages and events.
    async fn delete_campaign(&self, id: CampaignId) -> Result<bool>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>>;

    async fn update_message(&self, message: &Message) -> Result<()>;

    /// The lowest-priority pending message of a campaign.
    async fn next_pending_message(&self, campaign_id: CampaignId) -> Result<Option<Message>>;

    /// All messages of a campaign in enqueue order.
    async fn messages_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Message>>;

    async fn insert_recipient(&self, recipient: Recipient) -> Result<()>;

    async fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>>;

    async fn mark_contacted(&self, id: RecipientId, at: DateTime<Utc>) -> Result<()>;

    async fn record_event(&self, event: AnalyticsEvent) -> Result<()>;

    async fn events_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<AnalyticsEvent>>;
}
