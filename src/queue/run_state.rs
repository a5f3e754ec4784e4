//! The processor's own bookkeeping, persisted for crash recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::CampaignId;
use crate::store::{load_json, save_json, StateStore, QUEUE_STATE_KEY};

/// Which campaign owns the queue and whether its loop is running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub is_processing: bool,
    pub current_campaign_id: Option<CampaignId>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub async fn load(store: &dyn StateStore) -> Result<Self> {
        Ok(load_json(store, QUEUE_STATE_KEY).await?.unwrap_or_default())
    }

    pub async fn save(&self, store: &dyn StateStore) -> Result<()> {
        save_json(store, QUEUE_STATE_KEY, self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    #[tokio::test]
    async fn test_missing_state_loads_idle() {
        let store = MemoryStateStore::new();
        let state = RunState::load(&store).await.unwrap();
        assert_eq!(state, RunState::default());
        assert!(!state.is_processing);
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let store = MemoryStateStore::new();
        let state = RunState {
            is_processing: true,
            current_campaign_id: Some(uuid::Uuid::new_v4()),
            last_processed_at: Some(Utc::now()),
        };
        state.save(&store).await.unwrap();
        assert_eq!(RunState::load(&store).await.unwrap(), state);
    }
}
