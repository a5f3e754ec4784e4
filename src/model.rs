//! Campaign, message and recipient records.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for messages
pub type MessageId = Uuid;

/// Unique identifier for recipients
pub type RecipientId = Uuid;

/// Lifecycle of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Paused, Completed)
                | (Active, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch broadcast job: one template, many recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub template: String,
    pub status: CampaignStatus,
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub pending: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(name: impl Into<String>, template: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            template: template.into(),
            status: CampaignStatus::Draft,
            total: 0,
            sent: 0,
            failed: 0,
            pending: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// `sent + failed + pending == total`
    pub fn counters_balanced(&self) -> bool {
        self.sent + self.failed + self.pending == self.total
    }

    /// Share of processed messages, rounded to a whole percent.
    pub fn percent_complete(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let done = (self.sent + self.failed) as f64 / self.total as f64;
        (done * 100.0).round().min(100.0) as u8
    }
}

/// Per-recipient unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Failed,
    Skipped,
}

impl MessageStatus {
    /// Terminal messages are never revisited by the processor.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Skipped
        )
    }

    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Sending)
                | (Queued, Pending)
                | (Sending, Sent)
                | (Sending, Pending)
                | (Sending, Failed)
                | (Queued, Failed)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    /// Target address, denormalized from the recipient
    pub address: String,
    /// Rendered content
    pub content: String,
    pub status: MessageStatus,
    /// Enqueue order within the campaign
    pub priority: u64,
    pub retry_attempt: u32,
    pub error: Option<String>,
    pub provider_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        campaign_id: CampaignId,
        recipient: &Recipient,
        content: String,
        priority: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            recipient_id: recipient.id,
            address: recipient.address.clone(),
            content,
            status: MessageStatus::Pending,
            priority,
            retry_attempt: 0,
            error: None,
            provider_id: None,
            sent_at: None,
            failed_at: None,
        }
    }
}

/// Someone a campaign can be delivered to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub address: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub last_contacted_at: Option<DateTime<Utc>>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            first_name: None,
            last_name: None,
            custom_fields: HashMap::new(),
            blocked: false,
            last_contacted_at: None,
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn full_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageSent,
    MessageFailed,
    CampaignCompleted,
    CampaignFailed,
}

/// Analytics record emitted by the queue loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub campaign_id: CampaignId,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub message_id: Option<MessageId>,
    pub address: Option<String>,
    pub error: Option<String>,
    pub retry_attempt: Option<u32>,
}

impl AnalyticsEvent {
    pub fn campaign(campaign_id: CampaignId, kind: EventKind, at: DateTime<Utc>) -> Self {
        Self {
            campaign_id,
            kind,
            at,
            message_id: None,
            address: None,
            error: None,
            retry_attempt: None,
        }
    }

    pub fn message(message: &Message, kind: EventKind, at: DateTime<Utc>) -> Self {
        Self {
            campaign_id: message.campaign_id,
            kind,
            at,
            message_id: Some(message.id),
            address: Some(message.address.clone()),
            error: message.error.clone(),
            retry_attempt: Some(message.retry_attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Completed));
        assert!(Active.can_transition_to(Failed));

        assert!(!Draft.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Active));
    }

    #[test]
    fn test_terminal_messages_never_move() {
        for terminal in [MessageStatus::Sent, MessageStatus::Failed, MessageStatus::Skipped] {
            assert!(terminal.is_terminal());
            for next in [
                MessageStatus::Pending,
                MessageStatus::Queued,
                MessageStatus::Sending,
                MessageStatus::Sent,
                MessageStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_percent_complete() {
        let mut campaign = Campaign::new("c", "hi", Utc::now());
        assert_eq!(campaign.percent_complete(), 0);

        campaign.total = 3;
        campaign.sent = 1;
        campaign.failed = 1;
        campaign.pending = 1;
        assert!(campaign.counters_balanced());
        assert_eq!(campaign.percent_complete(), 67);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&CampaignStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        let json = serde_json::to_string(&EventKind::MessageSent).unwrap();
        assert_eq!(json, "\"message_sent\"");
    }
}
