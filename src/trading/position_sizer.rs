//! Position sizing against the configured per-trade notional cap.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::Trade;

/// Caps replicated quantity so that price x quantity stays within the trade size limit.
#[derive(Debug, Clone, Copy)]
pub struct PositionSizer {
    trade_size_limit: Decimal,
}

impl PositionSizer {
    pub fn new(trade_size_limit: Decimal) -> Self {
        Self { trade_size_limit }
    }

    /// Quantity to replicate for `trade`.
    ///
    /// Unchanged when the notional fits the limit, otherwise `floor(limit / price)`.
    /// Zero means the limit cannot buy a single unit.
    pub fn size(&self, trade: &Trade) -> u64 {
        if trade.notional() <= self.trade_size_limit {
            return trade.quantity;
        }
        if trade.price <= Decimal::ZERO || self.trade_size_limit <= Decimal::ZERO {
            return 0;
        }

        (self.trade_size_limit / trade.price)
            .floor()
            .to_u64()
            .unwrap_or(0)
            .min(trade.quantity)
    }
}
