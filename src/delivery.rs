//! Delivery channel abstraction.
//!
//! The queue never knows how a message physically reaches its recipient.
//! It hands the rendered content to a [`DeliveryChannel`] and classifies
//! whatever comes back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Proof that a delivery attempt succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Identifier assigned by the delivery provider, if any
    pub provider_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

/// Failure reported by a delivery channel.
///
/// Only the reason text is carried; retry classification works on it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}")]
pub struct DeliveryError {
    pub reason: String,
}

impl DeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Trait for delivery channel implementations.
///
/// Each call is exactly one attempt. Implementations must not retry
/// internally; the queue owns retry decisions.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, address: &str, content: &str) -> Result<DeliveryReceipt, DeliveryError>;
}

/// A dry-run channel that logs every send and always succeeds.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    async fn deliver(&self, address: &str, content: &str) -> Result<DeliveryReceipt, DeliveryError> {
        let provider_id = Uuid::new_v4().to_string();
        info!(
            address = %address,
            provider_id = %provider_id,
            bytes = content.len(),
            "Delivered message (dry run)"
        );
        Ok(DeliveryReceipt {
            provider_id: Some(provider_id),
            delivered_at: Utc::now(),
        })
    }
}
