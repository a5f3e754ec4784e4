//! Fire-and-forget progress notifications.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::trace;

use crate::model::{Campaign, CampaignId};

/// Counters of a campaign after one processed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub campaign_id: CampaignId,
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub pending: u64,
    pub percent_complete: u8,
}

impl From<&Campaign> for Progress {
    fn from(campaign: &Campaign) -> Self {
        Self {
            campaign_id: campaign.id,
            total: campaign.total,
            sent: campaign.sent,
            failed: campaign.failed,
            pending: campaign.pending,
            percent_complete: campaign.percent_complete(),
        }
    }
}

/// Broadcast channel for [`Progress`]; publishing never fails.
#[derive(Debug, Clone)]
pub struct ProgressFeed {
    sender: broadcast::Sender<Progress>,
}

impl ProgressFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, progress: Progress) {
        if self.sender.send(progress).is_err() {
            trace!("No progress listeners");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.sender.subscribe()
    }

    /// Stream of progress updates; lagged updates are skipped.
    pub fn stream(&self) -> impl Stream<Item = Progress> + Send + 'static {
        stream::unfold(self.sender.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(progress) => return Some((progress, receiver)),
                    Err(RecvError::Lagged(skipped)) => trace!(skipped, "Progress listener lagged"),
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }
}

impl Default for ProgressFeed {
    fn default() -> Self {
        Self::new(64)
    }
}
