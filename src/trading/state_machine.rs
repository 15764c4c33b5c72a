//! Trade lifecycle: owns the merged trade set and validates every status change.

use std::mem;

use tracing::{info, warn};

use crate::error::DecisionError;
use crate::models::{RiskAssessment, Trade, TradeStatus};

use super::feed_merger::FeedMerger;

/// A user's decision on a pending trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// What one feed merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub inserted: Vec<String>,
    pub newest_inserted: Option<String>,
}

/// Holds the merged feed. All status writes go through here.
#[derive(Debug, Default)]
pub struct TradeStateMachine {
    trades: Vec<Trade>,
}

impl TradeStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current merged set, newest first.
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn get(&self, id: &str) -> Option<&Trade> {
        self.trades.iter().find(|t| t.id == id)
    }

    pub fn status(&self, id: &str) -> Result<TradeStatus, DecisionError> {
        self.get(id)
            .map(|t| t.status)
            .ok_or_else(|| DecisionError::UnknownTrade(id.to_string()))
    }

    /// Merge a feed batch. Known ids keep their status.
    pub fn ingest(&mut self, incoming: Vec<Trade>) -> IngestOutcome {
        let existing = mem::take(&mut self.trades);
        let report = FeedMerger::merge_with_report(existing, incoming);
        let newest_inserted = report.newest_inserted().map(|t| t.id.clone());
        self.trades = report.trades;

        IngestOutcome {
            inserted: report.inserted,
            newest_inserted,
        }
    }

    /// PENDING -> REJECTED.
    pub fn reject(&mut self, id: &str, reason: impl Into<String>) -> Result<&Trade, DecisionError> {
        self.require_pending(id)?;
        self.transition(id, TradeStatus::Rejected, Some(reason.into()))
    }

    /// PENDING -> ACCEPTED_IN_FLIGHT. Returns a copy of the trade as accepted.
    ///
    /// A second accept for the same id fails here, so only one caller ever
    /// reaches the executor.
    pub fn begin_accept(&mut self, id: &str) -> Result<Trade, DecisionError> {
        self.require_pending(id)?;
        self.transition(id, TradeStatus::AcceptedInFlight, None)
            .map(Clone::clone)
    }

    /// ACCEPTED_IN_FLIGHT -> COMPLETED.
    pub fn complete(&mut self, id: &str) -> Result<&Trade, DecisionError> {
        self.transition(id, TradeStatus::Completed, None)
    }

    /// ACCEPTED_IN_FLIGHT -> FAILED. Terminal; a retry is a new user action.
    pub fn fail(&mut self, id: &str, reason: impl Into<String>) -> Result<&Trade, DecisionError> {
        self.transition(id, TradeStatus::Failed, Some(reason.into()))
    }

    /// Attach an advisor's assessment to a trade that is still pending.
    pub fn attach_assessment(
        &mut self,
        id: &str,
        assessment: RiskAssessment,
    ) -> Result<(), DecisionError> {
        self.require_pending(id)?;
        if let Some(trade) = self.trades.iter_mut().find(|t| t.id == id) {
            trade.risk_assessment = Some(assessment);
        }
        Ok(())
    }

    fn require_pending(&self, id: &str) -> Result<(), DecisionError> {
        match self.status(id)? {
            TradeStatus::Pending => Ok(()),
            status => {
                warn!(trade_id = %id, status = %status, "Decision ignored, trade is not pending");
                Err(DecisionError::NotPending {
                    id: id.to_string(),
                    status,
                })
            }
        }
    }

    fn transition(
        &mut self,
        id: &str,
        next: TradeStatus,
        reason: Option<String>,
    ) -> Result<&Trade, DecisionError> {
        let trade = self
            .trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| DecisionError::UnknownTrade(id.to_string()))?;

        if !trade.status.can_transition_to(next) {
            warn!(trade_id = %id, from = %trade.status, to = %next, "Invalid status transition");
            return Err(DecisionError::InvalidTransition {
                id: id.to_string(),
                from: trade.status,
                to: next,
            });
        }

        info!(
            trade_id = %id,
            from = %trade.status,
            to = %next,
            reason = reason.as_deref().unwrap_or(""),
            "Trade status changed"
        );
        trade.status = next;
        if reason.is_some() {
            trade.reason = reason;
        }
        Ok(trade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    use crate::models::TradeAction;

    fn make_trade(id: &str, minutes_ago: i64) -> Trade {
        Trade {
            id: id.to_string(),
            ticker: "BANKNIFTY_OPT".to_string(),
            action: TradeAction::Buy,
            quantity: 2,
            price: dec!(150.50),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            status: TradeStatus::Pending,
            reason: None,
            risk_assessment: None,
        }
    }

    fn machine_with(ids: &[&str]) -> TradeStateMachine {
        let mut machine = TradeStateMachine::new();
        let trades = ids
            .iter()
            .enumerate()
            .map(|(i, id)| make_trade(id, i as i64))
            .collect();
        machine.ingest(trades);
        machine
    }

    #[test]
    fn test_reject_pending_trade() {
        let mut machine = machine_with(&["FT001"]);
        let trade = machine.reject("FT001", "Rejected by user").unwrap();
        assert_eq!(trade.status, TradeStatus::Rejected);
        assert_eq!(trade.reason.as_deref(), Some("Rejected by user"));
    }

    #[test]
    fn test_reject_non_pending_is_noop() {
        let mut machine = machine_with(&["FT001"]);
        machine.begin_accept("FT001").unwrap();

        let err = machine.reject("FT001", "late").unwrap_err();
        assert_eq!(
            err,
            DecisionError::NotPending {
                id: "FT001".to_string(),
                status: TradeStatus::AcceptedInFlight
            }
        );
        assert_eq!(machine.status("FT001").unwrap(), TradeStatus::AcceptedInFlight);
    }

    #[test]
    fn test_second_accept_is_rejected_at_gate() {
        let mut machine = machine_with(&["FT001"]);
        let accepted = machine.begin_accept("FT001").unwrap();
        assert_eq!(accepted.status, TradeStatus::AcceptedInFlight);

        assert!(matches!(
            machine.begin_accept("FT001"),
            Err(DecisionError::NotPending { .. })
        ));
    }

    #[test]
    fn test_execution_outcomes() {
        let mut machine = machine_with(&["OK", "BAD"]);
        machine.begin_accept("OK").unwrap();
        machine.begin_accept("BAD").unwrap();

        machine.complete("OK").unwrap();
        machine.fail("BAD", "venue down").unwrap();

        assert_eq!(machine.status("OK").unwrap(), TradeStatus::Completed);
        assert_eq!(machine.status("BAD").unwrap(), TradeStatus::Failed);

        // terminal stays terminal
        assert!(machine.fail("OK", "again").is_err());
        assert!(machine.complete("BAD").is_err());
        assert!(machine.begin_accept("BAD").is_err());
    }

    #[test]
    fn test_complete_requires_in_flight() {
        let mut machine = machine_with(&["FT001"]);
        assert_eq!(
            machine.complete("FT001").unwrap_err(),
            DecisionError::InvalidTransition {
                id: "FT001".to_string(),
                from: TradeStatus::Pending,
                to: TradeStatus::Completed
            }
        );
    }

    #[test]
    fn test_unknown_trade() {
        let mut machine = machine_with(&["FT001"]);
        assert_eq!(
            machine.reject("NOPE", "x").unwrap_err(),
            DecisionError::UnknownTrade("NOPE".to_string())
        );
    }

    #[test]
    fn test_redelivery_keeps_terminal_status() {
        let mut machine = machine_with(&["FT001", "FT002"]);
        machine.reject("FT001", "no").unwrap();
        machine.begin_accept("FT002").unwrap();
        machine.fail("FT002", "timeout").unwrap();

        let outcome = machine.ingest(vec![make_trade("FT001", 0), make_trade("FT002", 1)]);
        assert!(outcome.inserted.is_empty());
        assert_eq!(outcome.newest_inserted, None);
        assert_eq!(machine.status("FT001").unwrap(), TradeStatus::Rejected);
        assert_eq!(machine.status("FT002").unwrap(), TradeStatus::Failed);
    }

    #[test]
    fn test_ingest_reports_newest_insert() {
        let mut machine = machine_with(&["OLD"]);
        let outcome = machine.ingest(vec![make_trade("N2", 5), make_trade("N1", 1)]);
        assert_eq!(outcome.inserted, vec!["N2".to_string(), "N1".to_string()]);
        assert_eq!(outcome.newest_inserted.as_deref(), Some("N1"));
    }
}
