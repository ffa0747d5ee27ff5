use thiserror::Error;

use beacon_common::error::AppError;
use beacon_common::types::Channel;

/// Errors raised by the dispatch engine.
///
/// `Delivery` is per-recipient and only ever recorded in a job's results;
/// `JobProcessing` and `Persistence` raised while a job runs go to the retry
/// manager; `Validation` and `RecipientResolution` reach the submitter.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Recipient resolution failed: {0}")]
    RecipientResolution(String),

    #[error("Delivery failed on {channel}: {reason}")]
    Delivery { channel: Channel, reason: String },

    #[error("Job processing failed: {0}")]
    JobProcessing(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] AppError),
}

impl NotifierError {
    pub fn delivery(channel: Channel, reason: impl Into<String>) -> Self {
        Self::Delivery {
            channel,
            reason: reason.into(),
        }
    }
}
