//! Merges feed batches from the poll and push channels into one ordered trade set.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::debug;

use crate::models::Trade;

/// Result of merging one batch.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Merged set, newest first
    pub trades: Vec<Trade>,

    /// Ids inserted by this batch, in batch order
    pub inserted: Vec<String>,
}

impl MergeReport {
    /// Newest trade (by timestamp, then id) among those this batch inserted.
    pub fn newest_inserted(&self) -> Option<&Trade> {
        // `trades` is already sorted, so the first inserted hit is the newest
        self.trades
            .iter()
            .find(|t| self.inserted.iter().any(|id| id == &t.id))
    }
}

/// Additive-only merge keyed by trade id.
///
/// A known id keeps its existing record untouched; later sightings never edit
/// status or payload.
pub struct FeedMerger;

impl FeedMerger {
    pub fn merge_with_report(existing: Vec<Trade>, incoming: Vec<Trade>) -> MergeReport {
        let mut known: HashSet<String> = existing.iter().map(|t| t.id.clone()).collect();
        let mut trades = existing;
        let mut inserted = Vec::new();

        for trade in incoming {
            if known.contains(&trade.id) {
                debug!(trade_id = %trade.id, "Trade already known, keeping existing record");
                continue;
            }
            known.insert(trade.id.clone());
            inserted.push(trade.id.clone());
            trades.push(trade);
        }

        trades.sort_by(feed_order);

        MergeReport { trades, inserted }
    }
}

/// Timestamp descending, ties broken by id ascending.
pub fn feed_order(a: &Trade, b: &Trade) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    use crate::models::{TradeAction, TradeStatus};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn make_trade(id: &str, timestamp: DateTime<Utc>, status: TradeStatus) -> Trade {
        Trade {
            id: id.to_string(),
            ticker: "NIFTY_FUT_JUL".to_string(),
            action: TradeAction::Buy,
            quantity: 1,
            price: dec!(100),
            timestamp,
            status,
            reason: None,
            risk_assessment: None,
        }
    }

    fn ids(trades: &[Trade]) -> Vec<&str> {
        trades.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn test_orders_by_timestamp_descending() {
        let batch = vec![
            make_trade("FT003", now() - Duration::minutes(30), TradeStatus::Pending),
            make_trade("FT001", now() - Duration::hours(2), TradeStatus::Pending),
            make_trade("FT002", now() - Duration::hours(1), TradeStatus::Pending),
        ];

        let merged = FeedMerger::merge_with_report(Vec::new(), batch).trades;
        assert_eq!(ids(&merged), vec!["FT003", "FT002", "FT001"]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let batch = vec![
            make_trade("B", now(), TradeStatus::Pending),
            make_trade("C", now(), TradeStatus::Pending),
            make_trade("A", now(), TradeStatus::Pending),
        ];

        let merged = FeedMerger::merge_with_report(Vec::new(), batch).trades;
        assert_eq!(ids(&merged), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let existing = vec![make_trade("S1", now() - Duration::hours(3), TradeStatus::Rejected)];
        let batch = vec![
            make_trade("A1", now() - Duration::hours(1), TradeStatus::Pending),
            make_trade("A2", now(), TradeStatus::Pending),
        ];

        let once = FeedMerger::merge_with_report(existing, batch.clone()).trades;
        let twice = FeedMerger::merge_with_report(once.clone(), batch).trades;
        assert_eq!(once, twice);
    }

    #[test]
    fn test_known_trade_is_never_overwritten() {
        let mut decided = make_trade("FT001", now(), TradeStatus::Completed);
        decided.reason = Some("replicated".to_string());
        let existing = vec![decided.clone()];

        let mut redelivered = make_trade("FT001", now(), TradeStatus::Pending);
        redelivered.price = dec!(999);

        let report = FeedMerger::merge_with_report(existing, vec![redelivered]);
        assert!(report.inserted.is_empty());
        assert_eq!(report.trades, vec![decided]);
    }

    #[test]
    fn test_first_sighting_within_batch_wins() {
        let first = make_trade("FT009", now(), TradeStatus::Pending);
        let mut second = first.clone();
        second.quantity = 42;

        let report = FeedMerger::merge_with_report(Vec::new(), vec![first.clone(), second]);
        assert_eq!(report.trades, vec![first]);
        assert_eq!(report.inserted, vec!["FT009".to_string()]);
    }

    #[test]
    fn test_poll_then_push_scenario() {
        let ft001 = make_trade("FT001", now() - Duration::hours(1), TradeStatus::Pending);
        let ft004 = make_trade("FT004", now(), TradeStatus::Pending);

        let polled = FeedMerger::merge_with_report(Vec::new(), vec![ft001.clone()]).trades;
        let after_push = FeedMerger::merge_with_report(polled, vec![ft001.clone()]).trades;
        let report = FeedMerger::merge_with_report(after_push, vec![ft004]);

        assert_eq!(report.trades.len(), 2);
        assert_eq!(ids(&report.trades), vec!["FT004", "FT001"]);
        assert!(report.trades.iter().all(|t| t.status == TradeStatus::Pending));
        assert_eq!(report.newest_inserted().map(|t| t.id.as_str()), Some("FT004"));
    }
}
