//! Serializable control surface over a [`QueueProcessor`].
//!
//! Requests and responses are internally tagged JSON objects, so a thin
//! transport (a socket, an HTTP handler, a CLI) only has to shuttle bytes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::processor::QueueProcessor;
use crate::error::Result;
use crate::model::{Campaign, CampaignId, Recipient, RecipientId};
use crate::ratelimit::LimiterStatus;

/// Snapshot of the processor and its rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub is_processing: bool,
    pub current_campaign_id: Option<CampaignId>,
    pub rate_limiter: LimiterStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    CreateCampaign {
        name: String,
        template: String,
    },
    AddRecipient {
        recipient: Recipient,
    },
    GetCampaign {
        campaign_id: CampaignId,
    },
    ListCampaigns,
    DeleteCampaign {
        campaign_id: CampaignId,
    },
    Enqueue {
        campaign_id: CampaignId,
        recipient_ids: Vec<RecipientId>,
    },
    Start {
        campaign_id: CampaignId,
    },
    Pause,
    Resume,
    Stop,
    Status,
    Recover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Campaign { campaign: Campaign },
    Campaigns { campaigns: Vec<Campaign> },
    Recipient { recipient_id: RecipientId },
    Enqueued { count: u64 },
    Status { status: QueueStatus },
    Recovered { campaign_id: Option<CampaignId> },
    Ok,
}

impl QueueProcessor {
    /// Dispatch one control request.
    pub async fn handle(self: &Arc<Self>, request: ControlRequest) -> Result<ControlResponse> {
        debug!(request = ?request, "Handling control request");
        let response = match request {
            ControlRequest::CreateCampaign { name, template } => ControlResponse::Campaign {
                campaign: self.create_campaign(&name, &template).await?,
            },
            ControlRequest::AddRecipient { recipient } => ControlResponse::Recipient {
                recipient_id: self.add_recipient(recipient).await?,
            },
            ControlRequest::GetCampaign { campaign_id } => ControlResponse::Campaign {
                campaign: self.get_campaign(campaign_id).await?,
            },
            ControlRequest::ListCampaigns => ControlResponse::Campaigns {
                campaigns: self.list_campaigns().await?,
            },
            ControlRequest::DeleteCampaign { campaign_id } => {
                self.delete_campaign(campaign_id).await?;
                ControlResponse::Ok
            }
            ControlRequest::Enqueue {
                campaign_id,
                recipient_ids,
            } => ControlResponse::Enqueued {
                count: self.enqueue(campaign_id, &recipient_ids).await?,
            },
            ControlRequest::Start { campaign_id } => {
                self.start(campaign_id).await?;
                ControlResponse::Ok
            }
            ControlRequest::Pause => {
                self.pause().await?;
                ControlResponse::Ok
            }
            ControlRequest::Resume => {
                self.resume().await?;
                ControlResponse::Ok
            }
            ControlRequest::Stop => {
                self.stop().await?;
                ControlResponse::Ok
            }
            ControlRequest::Status => ControlResponse::Status {
                status: self.status(),
            },
            ControlRequest::Recover => ControlResponse::Recovered {
                campaign_id: self.recover_and_resume().await?,
            },
        };
        Ok(response)
    }
}
