//! Replication executor: submits an accepted trade once and settles the outcome.
//!
//! Settlement is all-or-nothing. On success the replicated trade is recorded,
//! the balance delta applied and the trade completed under one lock; on any
//! failure none of that happens and the trade is marked FAILED.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::error::Elapsed;
use tracing::{error, info, warn};

use crate::api::{ExecuteTradeRequest, ExecuteTradeResponse, ExecutionVenue, OrderType};
use crate::error::ExecutionError;
use crate::models::{ReplicatedTrade, Trade, TradeAction, TradeStatus};

use super::session::{Session, SharedSession};

/// An accepted trade with its sized quantity, ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationOrder {
    pub trade_id: String,
    pub ticker: String,
    pub action: TradeAction,
    pub quantity: u64,
    pub price: Decimal,
}

impl ReplicationOrder {
    pub fn from_trade(trade: &Trade, quantity: u64) -> Self {
        Self {
            trade_id: trade.id.clone(),
            ticker: trade.ticker.clone(),
            action: trade.action,
            quantity,
            price: trade.price,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    fn to_request(&self, order_type: OrderType) -> ExecuteTradeRequest {
        ExecuteTradeRequest {
            ticker: self.ticker.clone(),
            action: self.action,
            quantity: self.quantity,
            price: self.price,
            order_type,
        }
    }
}

/// A settled replication.
#[derive(Debug, Clone, PartialEq)]
pub struct Replication {
    pub trade: ReplicatedTrade,

    /// Venue reported the post-trade balance; no separate refresh needed
    pub balance_confirmed: bool,
}

pub struct ReplicationExecutor {
    venue: Arc<dyn ExecutionVenue>,
    order_type: OrderType,
    submit_timeout: Duration,
}

impl ReplicationExecutor {
    pub fn new(venue: Arc<dyn ExecutionVenue>, order_type: OrderType, submit_timeout: Duration) -> Self {
        Self {
            venue,
            order_type,
            submit_timeout,
        }
    }

    /// Submit `order` for a trade already in ACCEPTED_IN_FLIGHT.
    pub async fn execute(
        &self,
        session: &SharedSession,
        order: ReplicationOrder,
    ) -> Result<Replication, ExecutionError> {
        {
            let mut s = session.lock();
            Self::preflight(&mut s, &order)?;
        }

        info!(
            trade_id = %order.trade_id,
            ticker = %order.ticker,
            action = %order.action,
            quantity = order.quantity,
            price = %order.price,
            "Submitting replication"
        );

        let request = order.to_request(self.order_type);
        let submitted = tokio::time::timeout(self.submit_timeout, self.venue.execute_trade(&request)).await;

        let mut s = session.lock();
        Self::settle(&mut s, order, submitted, self.submit_timeout)
    }

    /// Idempotency guard and local balance check. Runs before any network call.
    fn preflight(s: &mut Session, order: &ReplicationOrder) -> Result<(), ExecutionError> {
        if s.closed {
            return Err(ExecutionError::SessionClosed(order.trade_id.clone()));
        }

        let in_flight = matches!(
            s.machine.status(&order.trade_id),
            Ok(TradeStatus::AcceptedInFlight)
        );
        if !in_flight || s.submitted.contains(&order.trade_id) {
            warn!(trade_id = %order.trade_id, "Duplicate submission refused");
            return Err(ExecutionError::DuplicateSubmission(order.trade_id.clone()));
        }

        let available = s.ledger.available();
        if order.action == TradeAction::Buy && order.notional() > available {
            let err = ExecutionError::InsufficientBalance {
                required: order.notional(),
                available,
            };
            warn!(trade_id = %order.trade_id, error = %err, "Replication refused");
            let _ = s.machine.fail(&order.trade_id, err.to_string());
            return Err(err);
        }

        s.submitted.insert(order.trade_id.clone());
        Ok(())
    }

    fn settle(
        s: &mut Session,
        order: ReplicationOrder,
        submitted: Result<anyhow::Result<ExecuteTradeResponse>, Elapsed>,
        submit_timeout: Duration,
    ) -> Result<Replication, ExecutionError> {
        // A torn-down session or a trade that moved on keeps no trace of a late result
        let still_in_flight = matches!(
            s.machine.status(&order.trade_id),
            Ok(TradeStatus::AcceptedInFlight)
        );
        if s.closed || !still_in_flight {
            let filled = matches!(submitted, Ok(Ok(ref r)) if r.success);
            warn!(
                trade_id = %order.trade_id,
                filled,
                "Discarding execution result for closed session"
            );
            return Err(ExecutionError::SessionClosed(order.trade_id));
        }

        let response = match submitted {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(Self::fail(s, &order, ExecutionError::Transport(format!("{:#}", e))));
            }
            Err(_) => {
                return Err(Self::fail(s, &order, ExecutionError::Timeout(submit_timeout)));
            }
        };

        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "no reason given".to_string());
            return Err(Self::fail(s, &order, ExecutionError::Rejected(message)));
        }

        let replicated = ReplicatedTrade::new(
            order.trade_id.clone(),
            order.ticker,
            order.action,
            order.quantity,
            order.price,
        );

        s.ledger.apply_delta(replicated.balance_delta());
        let balance_confirmed = match response.new_balance {
            Some(balance) => {
                s.ledger.refresh(balance);
                true
            }
            None => false,
        };
        s.history.push_front(replicated.clone());
        if let Err(e) = s.machine.complete(&order.trade_id) {
            // checked in flight above, under the same lock
            error!(trade_id = %order.trade_id, error = %e, "Failed to complete trade");
        }

        info!(
            trade_id = %order.trade_id,
            replicated_id = %replicated.id,
            available = %s.ledger.available(),
            "Replication completed"
        );

        Ok(Replication {
            trade: replicated,
            balance_confirmed,
        })
    }

    fn fail(s: &mut Session, order: &ReplicationOrder, err: ExecutionError) -> ExecutionError {
        error!(trade_id = %order.trade_id, error = %err, "Replication failed");
        let _ = s.machine.fail(&order.trade_id, err.to_string());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    /// Venue that answers with a fixed response and counts calls.
    struct ScriptedVenue {
        response: Option<ExecuteTradeResponse>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedVenue {
        fn ok(new_balance: Option<Decimal>) -> Self {
            Self {
                response: Some(ExecuteTradeResponse {
                    success: true,
                    message: None,
                    new_balance,
                }),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn rejecting(message: &str) -> Self {
            Self {
                response: Some(ExecuteTradeResponse {
                    success: false,
                    message: Some(message.to_string()),
                    new_balance: None,
                }),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn unreachable() -> Self {
            Self {
                response: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExecutionVenue for ScriptedVenue {
        async fn execute_trade(&self, _request: &ExecuteTradeRequest) -> Result<ExecuteTradeResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.response
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    fn make_trade(id: &str, action: TradeAction, quantity: u64, price: Decimal) -> Trade {
        Trade {
            id: id.to_string(),
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

    /// Session holding one accepted trade, plus the order for it.
    fn accepted(balance: Decimal, trade: Trade) -> (SharedSession, ReplicationOrder) {
        let mut session = Session::new(balance, Vec::new());
        session.machine.ingest(vec![trade.clone()]);
        session.machine.begin_accept(&trade.id).unwrap();
        let order = ReplicationOrder::from_trade(&trade, trade.quantity);
        (session.shared(), order)
    }

    fn executor(venue: Arc<ScriptedVenue>) -> ReplicationExecutor {
        ReplicationExecutor::new(venue, OrderType::Market, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_success_records_trade_and_applies_delta() {
        let venue = Arc::new(ScriptedVenue::ok(None));
        let (session, order) = accepted(dec!(50000), make_trade("FT1", TradeAction::Buy, 5, dec!(170)));

        let replication = assert_ok!(executor(venue.clone()).execute(&session, order).await);
        assert!(!replication.balance_confirmed);
        assert_eq!(replication.trade.quantity, 5);

        let s = session.lock();
        assert_eq!(s.ledger.available(), dec!(49150));
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].source_trade_id, "FT1");
        assert_eq!(s.machine.status("FT1").unwrap(), TradeStatus::Completed);
    }

    #[tokio::test]
    async fn test_reported_balance_overrides_delta() {
        let venue = Arc::new(ScriptedVenue::ok(Some(dec!(49100))));
        let (session, order) = accepted(dec!(50000), make_trade("FT1", TradeAction::Buy, 5, dec!(170)));

        let replication = assert_ok!(executor(venue).execute(&session, order).await);
        assert!(replication.balance_confirmed);
        assert_eq!(session.lock().ledger.available(), dec!(49100));
    }

    #[tokio::test]
    async fn test_sell_credits_balance() {
        let venue = Arc::new(ScriptedVenue::ok(None));
        let (session, order) = accepted(dec!(1000), make_trade("FT2", TradeAction::Sell, 2, dec!(150.50)));

        assert_ok!(executor(venue).execute(&session, order).await);
        assert_eq!(session.lock().ledger.available(), dec!(1301));
    }

    #[tokio::test]
    async fn test_venue_rejection_leaves_balance_untouched() {
        let venue = Arc::new(ScriptedVenue::rejecting("market closed"));
        let (session, order) = accepted(dec!(50000), make_trade("FT1", TradeAction::Buy, 5, dec!(170)));

        let err = assert_err!(executor(venue).execute(&session, order).await);
        assert_eq!(err, ExecutionError::Rejected("market closed".to_string()));

        let s = session.lock();
        assert_eq!(s.ledger.available(), dec!(50000));
        assert!(s.history.is_empty());
        let trade = s.machine.get("FT1").unwrap();
        assert_eq!(trade.status, TradeStatus::Failed);
        assert!(trade.reason.as_deref().unwrap().contains("market closed"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_terminal() {
        let venue = Arc::new(ScriptedVenue::unreachable());
        let (session, order) = accepted(dec!(50000), make_trade("FT1", TradeAction::Buy, 1, dec!(100)));

        let err = assert_err!(executor(venue).execute(&session, order).await);
        assert!(matches!(err, ExecutionError::Transport(_)));
        assert_eq!(session.lock().machine.status("FT1").unwrap(), TradeStatus::Failed);
        assert_eq!(session.lock().ledger.available(), dec!(50000));
    }

    #[tokio::test]
    async fn test_timeout_fails_trade() {
        let venue = Arc::new(ScriptedVenue {
            delay: Duration::from_secs(60),
            ..ScriptedVenue::ok(None)
        });
        let (session, order) = accepted(dec!(50000), make_trade("FT1", TradeAction::Buy, 1, dec!(100)));
        let executor = ReplicationExecutor::new(venue, OrderType::Market, Duration::from_millis(20));

        let err = assert_err!(executor.execute(&session, order).await);
        assert_eq!(err, ExecutionError::Timeout(Duration::from_millis(20)));
        assert_eq!(session.lock().machine.status("FT1").unwrap(), TradeStatus::Failed);
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_without_network_call() {
        let venue = Arc::new(ScriptedVenue::ok(None));
        let (session, order) = accepted(dec!(500), make_trade("FT1", TradeAction::Buy, 5, dec!(170)));

        let err = assert_err!(executor(venue.clone()).execute(&session, order).await);
        assert_eq!(
            err,
            ExecutionError::InsufficientBalance {
                required: dec!(850),
                available: dec!(500)
            }
        );
        assert_eq!(venue.calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.lock().machine.status("FT1").unwrap(), TradeStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_submission_refused() {
        let venue = Arc::new(ScriptedVenue::ok(None));
        let (session, order) = accepted(dec!(50000), make_trade("FT1", TradeAction::Buy, 1, dec!(100)));
        let executor = executor(venue.clone());

        assert_ok!(executor.execute(&session, order.clone()).await);
        let err = assert_err!(executor.execute(&session, order).await);
        assert_eq!(err, ExecutionError::DuplicateSubmission("FT1".to_string()));
        assert_eq!(venue.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.lock().ledger.available(), dec!(49900));
    }

    #[tokio::test]
    async fn test_late_result_after_teardown_is_discarded() {
        let venue = Arc::new(ScriptedVenue {
            delay: Duration::from_millis(50),
            ..ScriptedVenue::ok(None)
        });
        let (session, order) = accepted(dec!(50000), make_trade("FT1", TradeAction::Buy, 1, dec!(100)));
        let executor = executor(venue);

        let closer = {
            let session = session.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                session.lock().closed = true;
            }
        };
        let (result, ()) = tokio::join!(executor.execute(&session, order), closer);

        assert_eq!(result, Err(ExecutionError::SessionClosed("FT1".to_string())));
        let s = session.lock();
        assert_eq!(s.ledger.available(), dec!(50000));
        assert!(s.history.is_empty());
        assert_eq!(s.machine.status("FT1").unwrap(), TradeStatus::AcceptedInFlight);
    }
}
