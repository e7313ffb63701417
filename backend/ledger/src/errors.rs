//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required")]
    Unauthorized,

    /// A terminal donation was asked to move to the opposite terminal state.
    #[error("Invalid state transition for donation {donation_id}: {from} -> {to}")]
    InvalidStateTransition {
        donation_id: i64,
        from: &'static str,
        to: &'static str,
    },

    #[error("Payment declined: {reason}")]
    PaymentDeclined { donation_id: i64, reason: String },

    /// Another request holds the donation's latest charge attempt.
    #[error("Payment for donation {donation_id} is still being processed")]
    PaymentInProgress { donation_id: i64 },

    #[error("Payment gateway unavailable")]
    GatewayUnavailable { donation_id: i64 },

    #[error("Payment gateway rejected the charge: {reason}")]
    GatewayRejected { donation_id: i64, reason: String },
}

impl LedgerError {
    /// The donation a payment failure refers to, if any.
    pub fn donation_id(&self) -> Option<i64> {
        match self {
            Self::InvalidStateTransition { donation_id, .. }
            | Self::PaymentDeclined { donation_id, .. }
            | Self::PaymentInProgress { donation_id }
            | Self::GatewayUnavailable { donation_id }
            | Self::GatewayRejected { donation_id, .. } => Some(*donation_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
