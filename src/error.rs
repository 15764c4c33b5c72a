//! Domain error types.
//!
//! Transport plumbing (HTTP, SQLite, CLI) stays on `anyhow`; the errors
//! here are the ones callers branch on.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::models::TradeStatus;

/// Why a user decision could not be applied to a trade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("trade {0} is not in the feed")]
    UnknownTrade(String),

    #[error("trade {id} is {status}, only PENDING trades accept a decision")]
    NotPending { id: String, status: TradeStatus },

    #[error("trade {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TradeStatus,
        to: TradeStatus,
    },

    #[error("sync session is closed")]
    SessionClosed,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Why a replication did not complete.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("insufficient balance: order needs {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("execution venue rejected the order: {0}")]
    Rejected(String),

    #[error("execution request failed: {0}")]
    Transport(String),

    #[error("execution request timed out after {0:?}")]
    Timeout(Duration),

    #[error("trade {0} was already submitted or is no longer in flight")]
    DuplicateSubmission(String),

    #[error("session closed before trade {0} settled")]
    SessionClosed(String),
}

impl ExecutionError {
    /// Whether the trade should be marked FAILED for this error.
    ///
    /// Duplicate submissions and closed sessions leave the trade alone.
    pub fn fails_trade(&self) -> bool {
        !matches!(
            self,
            ExecutionError::DuplicateSubmission(_) | ExecutionError::SessionClosed(_)
        )
    }
}

/// A feed record that could not be turned into a trade.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("malformed trade payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("trade {id}: invalid {field}: {reason}")]
    InvalidField {
        id: String,
        field: &'static str,
        reason: String,
    },
}
