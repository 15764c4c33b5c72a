//! Trade model representing one order observed on the mirrored party's feed.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::FeedError;

use super::RiskAssessment;

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lifecycle status of a mirrored trade.
///
/// PENDING -> {ACCEPTED_IN_FLIGHT, REJECTED}; ACCEPTED_IN_FLIGHT -> {COMPLETED, FAILED}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    #[default]
    #[serde(alias = "PENDING_USER_ACTION", alias = "PENDING_RISK_ASSESSMENT")]
    Pending,
    #[serde(alias = "PENDING_REPLICATION")]
    AcceptedInFlight,
    Completed,
    Rejected,
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::AcceptedInFlight => "ACCEPTED_IN_FLIGHT",
            TradeStatus::Completed => "COMPLETED",
            TradeStatus::Rejected => "REJECTED",
            TradeStatus::Failed => "FAILED",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Completed | TradeStatus::Rejected | TradeStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        matches!(
            (self, next),
            (TradeStatus::Pending, TradeStatus::AcceptedInFlight)
                | (TradeStatus::Pending, TradeStatus::Rejected)
                | (TradeStatus::AcceptedInFlight, TradeStatus::Completed)
                | (TradeStatus::AcceptedInFlight, TradeStatus::Failed)
        )
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// An order placed by the mirrored party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    /// Opaque identifier, stable across the poll and push channels
    pub id: String,

    /// Instrument symbol (e.g. "NIFTY_FUT_JUL")
    pub ticker: String,

    pub action: TradeAction,

    /// Number of units, always positive
    pub quantity: u64,

    /// Price per unit, always positive
    pub price: Decimal,

    /// When the order was placed (Unix milliseconds on the wire)
    #[serde(with = "feed_millis")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub status: TradeStatus,

    /// Human-readable reason attached to a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
}

impl Trade {
    /// Monetary size of the trade: price x quantity.
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    /// Parse and validate one feed record.
    ///
    /// A feed-provided ACCEPTED_IN_FLIGHT has no local execution behind it,
    /// so it enters the book as PENDING.
    pub fn from_feed_value(value: serde_json::Value) -> Result<Self, FeedError> {
        let mut trade: Trade = serde_json::from_value(value)?;
        trade.validate()?;
        if trade.status == TradeStatus::AcceptedInFlight {
            trade.status = TradeStatus::Pending;
        }
        trade.risk_assessment = None;
        Ok(trade)
    }

    /// Parse one push-channel message.
    pub fn from_feed_str(message: &str) -> Result<Self, FeedError> {
        let value: serde_json::Value = serde_json::from_str(message)?;
        Self::from_feed_value(value)
    }

    fn validate(&self) -> Result<(), FeedError> {
        let invalid = |field: &'static str, reason: &str| FeedError::InvalidField {
            id: self.id.clone(),
            field,
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id", "must not be empty"));
        }
        if self.ticker.trim().is_empty() {
            return Err(invalid("ticker", "must not be empty"));
        }
        if self.quantity == 0 {
            return Err(invalid("quantity", "must be positive"));
        }
        if self.price <= Decimal::ZERO {
            return Err(invalid("price", "must be positive"));
        }
        Ok(())
    }
}

/// Unix milliseconds; feeds may send fractional values, truncated toward zero.
mod feed_millis {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Int(i64),
        UInt(u64),
        Float(f64),
    }

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        chrono::serde::ts_milliseconds::serialize(timestamp, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = match Millis::deserialize(deserializer)? {
            Millis::Int(v) => Some(v),
            Millis::UInt(v) => i64::try_from(v).ok(),
            Millis::Float(v) if v.is_finite() => Some(v.trunc() as i64),
            Millis::Float(_) => None,
        };

        millis
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| D::Error::custom("timestamp out of range"))
    }
}

/// Parse a feed batch, dropping (and logging) records that fail validation.
pub fn parse_feed_batch(values: Vec<serde_json::Value>) -> Vec<Trade> {
    let total = values.len();
    let trades: Vec<Trade> = values
        .into_iter()
        .filter_map(|value| match Trade::from_feed_value(value) {
            Ok(trade) => Some(trade),
            Err(e) => {
                warn!(error = %e, "Dropping malformed feed record");
                None
            }
        })
        .collect();

    if trades.len() < total {
        warn!(
            dropped = total - trades.len(),
            kept = trades.len(),
            "Feed batch partially merged"
        );
    }

    trades
}
