//! A trade placed in the user's own account, derived from an accepted mirrored trade.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{TradeAction, TradeStatus};

/// Record of a successful replication. Newest-first history, persisted in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedTrade {
    /// `UT-` prefixed identifier
    pub id: String,

    /// Mirrored trade this replication came from
    pub source_trade_id: String,

    pub ticker: String,
    pub action: TradeAction,

    /// Quantity after sizing, may be below the source quantity
    pub quantity: u64,

    pub price: Decimal,

    /// Execution instant
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    pub status: TradeStatus,
}

impl ReplicatedTrade {
    pub fn new(
        source_trade_id: String,
        ticker: String,
        action: TradeAction,
        quantity: u64,
        price: Decimal,
    ) -> Self {
        Self {
            id: format!("UT-{}", uuid::Uuid::new_v4().simple()),
            source_trade_id,
            ticker,
            action,
            quantity,
            price,
            timestamp: Utc::now(),
            status: TradeStatus::Completed,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    /// Signed effect on available balance: BUY spends, SELL credits.
    pub fn balance_delta(&self) -> Decimal {
        match self.action {
            TradeAction::Buy => -self.notional(),
            TradeAction::Sell => self.notional(),
        }
    }
}
