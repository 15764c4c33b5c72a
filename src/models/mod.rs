//! Data models for mirrored trades, replicated trades, and risk assessments.

mod assessment;
mod replicated;
mod trade;

pub use assessment::{Recommendation, RiskAssessment, RiskLevel};
pub use replicated::ReplicatedTrade;
pub use trade::{parse_feed_batch, Trade, TradeAction, TradeStatus};
