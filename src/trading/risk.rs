//! Pluggable risk advisory step, consulted before a trade is accepted.
//!
//! The engine runs the same with no advisor (pass-through approval). An advisor
//! can only make a decision more conservative: reject, or lower the quantity.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{Recommendation, RiskAssessment, RiskLevel, Trade, TradeAction};

/// What the advisor knows about the account.
#[derive(Debug, Clone)]
pub struct RiskContext {
    pub available_balance: Decimal,
    pub trade_size_limit: Decimal,
    /// Short summary of recent replications
    pub trade_history: String,
}

#[async_trait]
pub trait RiskAdvisor: Send + Sync {
    async fn assess(&self, trade: &Trade, context: &RiskContext) -> Result<RiskAssessment>;
}

/// Local heuristic: scores a trade by the share of available balance it would commit.
#[derive(Debug, Clone)]
pub struct ExposureAdvisor {
    /// Share of balance at or above which a trade is Medium risk
    pub medium_ratio: Decimal,
    /// Share of balance at or above which a trade is High risk and rejected
    pub high_ratio: Decimal,
}

impl Default for ExposureAdvisor {
    fn default() -> Self {
        Self {
            medium_ratio: dec!(0.10),
            high_ratio: dec!(0.50),
        }
    }
}

#[async_trait]
impl RiskAdvisor for ExposureAdvisor {
    async fn assess(&self, trade: &Trade, context: &RiskContext) -> Result<RiskAssessment> {
        let committed = trade.notional().min(context.trade_size_limit);

        // Selling frees cash; only buys commit balance.
        if trade.action == TradeAction::Sell {
            return Ok(RiskAssessment {
                risk_score: 10,
                risk_level: RiskLevel::Low,
                justification: format!(
                    "SELL of {} credits the account; no balance at risk",
                    trade.ticker
                ),
                recommendation: Recommendation::Approve,
                adjusted_quantity: None,
            });
        }

        if context.available_balance <= Decimal::ZERO {
            return Ok(RiskAssessment {
                risk_score: 100,
                risk_level: RiskLevel::High,
                justification: "No available balance".to_string(),
                recommendation: Recommendation::Reject,
                adjusted_quantity: None,
            });
        }

        let ratio = committed / context.available_balance;
        let risk_score = (ratio * dec!(100))
            .round()
            .to_u8()
            .unwrap_or(100)
            .min(100);

        let assessment = if ratio >= self.high_ratio {
            RiskAssessment {
                risk_score,
                risk_level: RiskLevel::High,
                justification: format!(
                    "Trade commits {:.1}% of available balance",
                    ratio * dec!(100)
                ),
                recommendation: Recommendation::Reject,
                adjusted_quantity: None,
            }
        } else if ratio >= self.medium_ratio {
            // Shrink to what the medium threshold allows
            let budget = context.available_balance * self.medium_ratio;
            let adjusted = (budget / trade.price).floor().to_u64().unwrap_or(0);
            RiskAssessment {
                risk_score,
                risk_level: RiskLevel::Medium,
                justification: format!(
                    "Trade commits {:.1}% of available balance; reducing to {} units",
                    ratio * dec!(100),
                    adjusted
                ),
                recommendation: Recommendation::ReduceSize,
                adjusted_quantity: Some(adjusted),
            }
        } else {
            RiskAssessment {
                risk_score,
                risk_level: RiskLevel::Low,
                justification: format!(
                    "Trade commits {:.1}% of available balance",
                    ratio * dec!(100)
                ),
                recommendation: Recommendation::Approve,
                adjusted_quantity: None,
            }
        };

        Ok(assessment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::TradeStatus;

    fn make_trade(action: TradeAction, quantity: u64, price: Decimal) -> Trade {
        Trade {
            id: "FT".to_string(),
            ticker: "NIFTY_FUT_JUL".to_string(),
            action,
            quantity,
            price,
            timestamp: Utc::now(),
            status: TradeStatus::Pending,
            reason: None,
            risk_assessment: None,
        }
    }

    fn context(balance: Decimal) -> RiskContext {
        RiskContext {
            available_balance: balance,
            trade_size_limit: dec!(100000),
            trade_history: String::new(),
        }
    }

    #[tokio::test]
    async fn test_small_buy_is_approved() {
        let advisor = ExposureAdvisor::default();
        let result = advisor
            .assess(&make_trade(TradeAction::Buy, 5, dec!(170)), &context(dec!(50000)))
            .await
            .unwrap();

        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.recommendation, Recommendation::Approve);
        assert_eq!(result.risk_score, 2);
    }

    #[tokio::test]
    async fn test_medium_buy_is_reduced() {
        let advisor = ExposureAdvisor::default();
        let result = advisor
            .assess(&make_trade(TradeAction::Buy, 10, dec!(1000)), &context(dec!(50000)))
            .await
            .unwrap();

        assert_eq!(result.risk_level, RiskLevel::Medium);
        assert_eq!(result.recommendation, Recommendation::ReduceSize);
        assert_eq!(result.adjusted_quantity, Some(5));
    }

    #[tokio::test]
    async fn test_large_buy_is_rejected() {
        let advisor = ExposureAdvisor::default();
        let result = advisor
            .assess(&make_trade(TradeAction::Buy, 1, dec!(23500)), &context(dec!(40000)))
            .await
            .unwrap();

        assert_eq!(result.risk_level, RiskLevel::High);
        assert_eq!(result.recommendation, Recommendation::Reject);
    }

    #[tokio::test]
    async fn test_sell_is_low_risk() {
        let advisor = ExposureAdvisor::default();
        let result = advisor
            .assess(&make_trade(TradeAction::Sell, 100, dec!(23500)), &context(dec!(10)))
            .await
            .unwrap();
        assert_eq!(result.recommendation, Recommendation::Approve);
    }
}
