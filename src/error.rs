//! Error types for the Pacer delivery queue.

use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::model::CampaignId;

/// Main error type for Pacer operations.
#[derive(Error, Debug)]
pub enum PacerError {
    /// A campaign, message or recipient does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The operation is not legal for the current status
    #[error("Invalid state: cannot {operation} while {current}")]
    InvalidState {
        operation: &'static str,
        current: String,
    },

    /// Another campaign already owns the processing loop
    #[error("Queue is already processing campaign {0}")]
    AlreadyProcessing(CampaignId),

    /// The daily send cap has been reached
    #[error("Daily limit of {limit} messages reached")]
    RateLimitExceeded { limit: u32 },

    /// A single delivery attempt failed
    #[error("Delivery failed: {0}")]
    DeliveryFailed(DeliveryError),

    /// A retried operation never succeeded
    #[error("Failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: DeliveryError },

    /// The campaign store or state persistence could not be used
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PacerError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        PacerError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, current: impl ToString) -> Self {
        PacerError::InvalidState {
            operation,
            current: current.to_string(),
        }
    }
}

/// Result type alias for Pacer operations.
pub type Result<T> = std::result::Result<T, PacerError>;
