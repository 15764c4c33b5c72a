//! Risk assessment attached to a trade by a risk advisor.

use serde::{Deserialize, Serialize};

/// Qualitative risk bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// What the advisor suggests doing with the trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    Approve,
    ReduceSize,
    Reject,
}

/// Advisory output; never binding except for `Reject` and a smaller quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    /// 0 (no risk) to 100 (maximum risk)
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub justification: String,
    pub recommendation: Recommendation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_quantity: Option<u64>,
}
