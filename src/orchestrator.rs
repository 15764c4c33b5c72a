//! Sync orchestrator: owns the session and every trigger that mutates it.
//!
//! Handles:
//! - Polling the feed on a fixed interval
//! - Keeping the push channel subscribed, with reconnect backoff
//! - Merging both channels into one trade set
//! - User decisions: advisory, sizing, the accept gate, execution
//! - Balance refreshes and the durable snapshot
//! - Notifying observers of every change

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{BalanceSource, ExecutionVenue, FeedSource, PushChannel};
use crate::db::{Database, Snapshot};
use crate::error::{DecisionError, ExecutionError};
use crate::models::{parse_feed_batch, Recommendation, ReplicatedTrade, Trade, TradeStatus};
use crate::trading::{
    BalanceLedger, Decision, IngestOutcome, PositionSizer, PushEvent, PushSubscription,
    ReplicationExecutor, ReplicationOrder, RiskAdvisor, RiskContext, Session, SharedSession,
    SyncConfig,
};

const EVENT_CAPACITY: usize = 256;
const HISTORY_CONTEXT_LEN: usize = 5;

/// Change notifications published to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A feed batch was merged; `inserted` lists ids seen for the first time
    TradesUpdated { inserted: Vec<String> },
    NewTradeAvailable { trade_id: String },
    /// A trade reached a terminal status
    TradeSettled {
        trade_id: String,
        status: TradeStatus,
        reason: Option<String>,
    },
    BalanceChanged { available: Decimal },
    Connectivity { connected: bool },
}

/// Point-in-time copy of everything the orchestrator exposes.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub trades: Vec<Trade>,
    pub replicated: Vec<ReplicatedTrade>,
    pub available_balance: Decimal,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub connected: bool,
    pub last_seen_trade_id: Option<String>,
}

/// How a decision ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Rejected { reason: String },
    Completed(ReplicatedTrade),
    Failed { reason: String },
}

pub struct SyncOrchestrator {
    config: RwLock<SyncConfig>,
    session: SharedSession,
    feed: Arc<dyn FeedSource>,
    push: Option<Arc<dyn PushChannel>>,
    balance_source: Option<Arc<dyn BalanceSource>>,
    executor: ReplicationExecutor,
    advisor: Option<Arc<dyn RiskAdvisor>>,
    store: Option<Database>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    /// Create an orchestrator polling `feed` and executing on `venue`.
    pub fn new(config: SyncConfig, feed: Arc<dyn FeedSource>, venue: Arc<dyn ExecutionVenue>) -> Self {
        let executor = ReplicationExecutor::new(venue, config.order_type, config.submit_timeout());
        let session = Session::new(config.starting_balance, Vec::new()).shared();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config: RwLock::new(config),
            session,
            feed,
            push: None,
            balance_source: None,
            executor,
            advisor: None,
            store: None,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_push(mut self, push: Arc<dyn PushChannel>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn with_balance_source(mut self, source: Arc<dyn BalanceSource>) -> Self {
        self.balance_source = Some(source);
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn RiskAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_store(mut self, store: Database) -> Self {
        self.store = Some(store);
        self
    }

    /// Restore the stored snapshot, then ask the balance source for the truth.
    pub async fn initialize(&self) -> Result<()> {
        if let Some(store) = &self.store {
            if let Some(snapshot) = store.load_snapshot().await? {
                info!(
                    available = %snapshot.available_balance,
                    replicated = snapshot.replicated_trades.len(),
                    "Resuming from stored snapshot"
                );
                let mut s = self.session.lock();
                s.ledger = BalanceLedger::new(snapshot.available_balance);
                s.history = snapshot.replicated_trades.into();
            }
        }

        if self.balance_source.is_some() {
            if let Err(e) = self.refresh_balance().await {
                warn!(error = %format!("{:#}", e), "Initial balance refresh failed, using cached balance");
            }
        }

        info!(available = %self.session.lock().ledger.available(), "Orchestrator initialized");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let s = self.session.lock();
        SyncSnapshot {
            trades: s.machine.trades().to_vec(),
            replicated: s.history.iter().cloned().collect(),
            available_balance: s.ledger.available(),
            last_refreshed_at: s.ledger.last_refreshed_at(),
            connected: s.connected(),
            last_seen_trade_id: s.last_seen_trade_id.clone(),
        }
    }

    /// The only runtime settings change.
    pub fn update_trade_size_limit(&self, limit: Decimal) -> Result<(), DecisionError> {
        if limit <= Decimal::ZERO {
            return Err(DecisionError::InvalidSettings(format!(
                "trade size limit must be positive, got {}",
                limit
            )));
        }
        let previous = std::mem::replace(&mut self.config.write().trade_size_limit, limit);
        info!(previous = %previous, limit = %limit, "Trade size limit updated");
        Ok(())
    }

    // ==================== Feed ====================

    /// Fetch one poll batch and merge it.
    pub async fn poll_once(&self) -> Result<IngestOutcome> {
        let fetched = self.feed.fetch_pending_trades().await;
        let values = match fetched {
            Ok(values) => {
                self.set_poll_healthy(true);
                values
            }
            Err(e) => {
                self.set_poll_healthy(false);
                return Err(e).context("Feed poll failed");
            }
        };

        debug!(records = values.len(), "Poll batch received");
        Ok(self.ingest_batch(parse_feed_batch(values)))
    }

    /// Merge one push message. A malformed message is dropped.
    pub fn ingest_push_message(&self, message: &str) -> IngestOutcome {
        match Trade::from_feed_str(message) {
            Ok(trade) => self.ingest_batch(vec![trade]),
            Err(e) => {
                warn!(error = %e, "Dropping malformed push message");
                IngestOutcome::default()
            }
        }
    }

    /// Merge already-validated trades from either channel.
    pub fn ingest_batch(&self, trades: Vec<Trade>) -> IngestOutcome {
        let outcome = {
            let mut s = self.session.lock();
            if s.closed {
                debug!("Ignoring feed batch for closed session");
                return IngestOutcome::default();
            }
            let outcome = s.machine.ingest(trades);
            if let Some(newest) = &outcome.newest_inserted {
                s.last_seen_trade_id = Some(newest.clone());
            }
            outcome
        };

        if !outcome.inserted.is_empty() {
            info!(inserted = outcome.inserted.len(), "New trades merged");
        }
        self.emit(SyncEvent::TradesUpdated {
            inserted: outcome.inserted.clone(),
        });
        if let Some(newest) = &outcome.newest_inserted {
            self.emit(SyncEvent::NewTradeAvailable {
                trade_id: newest.clone(),
            });
        }

        outcome
    }

    // ==================== Decisions ====================

    /// Apply a user decision to a pending trade.
    pub async fn decide(&self, id: &str, decision: Decision) -> Result<DecisionOutcome, DecisionError> {
        match decision {
            Decision::Reject => self.reject(id, "Rejected by user"),
            Decision::Accept => self.accept(id).await,
        }
    }

    fn reject(&self, id: &str, reason: &str) -> Result<DecisionOutcome, DecisionError> {
        {
            let mut s = self.session.lock();
            if s.closed {
                return Err(DecisionError::SessionClosed);
            }
            s.machine.reject(id, reason)?;
        }

        self.emit_settled(id, TradeStatus::Rejected, Some(reason.to_string()));
        Ok(DecisionOutcome::Rejected {
            reason: reason.to_string(),
        })
    }

    async fn accept(&self, id: &str) -> Result<DecisionOutcome, DecisionError> {
        let limit = self.config.read().trade_size_limit;

        let (trade, context) = {
            let s = self.session.lock();
            if s.closed {
                return Err(DecisionError::SessionClosed);
            }
            let status = s.machine.status(id)?;
            let trade = match s.machine.get(id) {
                Some(trade) if status == TradeStatus::Pending => trade.clone(),
                _ => {
                    return Err(DecisionError::NotPending {
                        id: id.to_string(),
                        status,
                    })
                }
            };
            let context = RiskContext {
                available_balance: s.ledger.available(),
                trade_size_limit: limit,
                trade_history: summarize_history(s.history.iter()),
            };
            (trade, context)
        };

        // Advisory may suspend; the gate below re-checks status under the lock.
        let assessment = match &self.advisor {
            Some(advisor) => match advisor.assess(&trade, &context).await {
                Ok(assessment) => {
                    info!(
                        trade_id = %id,
                        risk_level = ?assessment.risk_level,
                        recommendation = ?assessment.recommendation,
                        "Risk assessment received"
                    );
                    Some(assessment)
                }
                Err(e) => {
                    warn!(trade_id = %id, error = %format!("{:#}", e), "Risk advisor failed, proceeding without assessment");
                    None
                }
            },
            None => None,
        };

        let order = {
            let mut s = self.session.lock();
            if s.closed {
                return Err(DecisionError::SessionClosed);
            }

            let mut quantity = PositionSizer::new(limit).size(&trade);
            let mut rejection = None;

            if let Some(assessment) = assessment {
                match assessment.recommendation {
                    Recommendation::Reject => {
                        rejection = Some(format!("Risk advisor rejected: {}", assessment.justification));
                    }
                    Recommendation::ReduceSize => {
                        if let Some(adjusted) = assessment.adjusted_quantity {
                            quantity = quantity.min(adjusted);
                        }
                    }
                    Recommendation::Approve => {}
                }
                s.machine.attach_assessment(id, assessment)?;
            }

            if rejection.is_none() && quantity == 0 {
                rejection = Some(format!(
                    "Trade size limit {} is below the price of one unit ({})",
                    limit, trade.price
                ));
            }

            if let Some(reason) = rejection {
                s.machine.reject(id, reason.clone())?;
                drop(s);
                self.emit_settled(id, TradeStatus::Rejected, Some(reason.clone()));
                return Ok(DecisionOutcome::Rejected { reason });
            }

            let accepted = s.machine.begin_accept(id)?;
            if quantity < accepted.quantity {
                info!(
                    trade_id = %id,
                    requested = accepted.quantity,
                    sized = quantity,
                    "Quantity reduced to fit limits"
                );
            }
            ReplicationOrder::from_trade(&accepted, quantity)
        };

        match self.executor.execute(&self.session, order).await {
            Ok(replication) => {
                self.emit_settled(id, TradeStatus::Completed, None);
                self.emit_balance();

                if !replication.balance_confirmed && self.balance_source.is_some() {
                    if let Err(e) = self.refresh_balance().await {
                        warn!(error = %format!("{:#}", e), "Post-execution balance refresh failed");
                    }
                }
                if let Err(e) = self.persist().await {
                    error!(error = %format!("{:#}", e), "Failed to persist snapshot");
                }

                Ok(DecisionOutcome::Completed(replication.trade))
            }
            Err(err) if err.fails_trade() => {
                let reason = err.to_string();
                self.emit_settled(id, TradeStatus::Failed, Some(reason.clone()));
                Ok(DecisionOutcome::Failed { reason })
            }
            Err(ExecutionError::SessionClosed(_)) => Err(DecisionError::SessionClosed),
            Err(_) => {
                let status = self.session.lock().machine.status(id)?;
                Err(DecisionError::NotPending {
                    id: id.to_string(),
                    status,
                })
            }
        }
    }

    // ==================== Balance ====================

    /// Fetch the authoritative balance. Deltas applied while the request was
    /// outstanding are kept on top of the answer.
    pub async fn refresh_balance(&self) -> Result<Decimal> {
        let source = self
            .balance_source
            .as_ref()
            .context("No balance source configured")?;

        let ticket = self.session.lock().ledger.begin_refresh();
        let balance = source.fetch_balance().await?;

        let (applied, available) = {
            let mut s = self.session.lock();
            if s.closed {
                anyhow::bail!("Session closed during balance refresh");
            }
            let applied = s.ledger.complete_refresh(ticket, balance);
            (applied, s.ledger.available())
        };

        if applied {
            self.emit(SyncEvent::BalanceChanged { available });
            self.persist().await?;
        }
        Ok(available)
    }

    /// Save balance and replicated trades to the store, if one is attached.
    pub async fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let snapshot = {
            let s = self.session.lock();
            Snapshot {
                available_balance: s.ledger.available(),
                replicated_trades: s.history.iter().cloned().collect(),
            }
        };
        store.save_snapshot(&snapshot).await
    }

    // ==================== Lifecycle ====================

    /// Poll on a fixed interval and keep the push channel subscribed until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let config = self.config();
        info!(
            poll_interval_ms = config.poll_interval_ms,
            push = self.push.is_some(),
            "Starting sync loop"
        );

        let push_task = self.push.clone().map(|channel| {
            let subscription =
                PushSubscription::new(channel, config.reconnect.clone(), self.shutdown.child_token());
            let this = self.clone();
            subscription.start(move |event| this.handle_push_event(event))
        });

        let mut ticker = interval(config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %format!("{:#}", e), "Poll failed, retrying next interval");
                    }
                }
            }
        }

        if let Some(handle) = push_task {
            if let Err(e) = handle.await {
                error!(error = %e, "Push task ended abnormally");
            }
        }

        info!("Sync loop stopped");
        Ok(())
    }

    /// Stop polling and the push channel. In-flight executions finish, but
    /// their results are discarded.
    pub fn shutdown(&self) {
        info!("Shutting down sync session");
        self.shutdown.cancel();

        let was_connected = {
            let mut s = self.session.lock();
            let was_connected = s.connected();
            s.closed = true;
            s.push_connected = false;
            s.poll_healthy = false;
            was_connected
        };
        if was_connected {
            self.emit(SyncEvent::Connectivity { connected: false });
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn handle_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::Connected => self.set_push_connected(true),
            PushEvent::Disconnected => self.set_push_connected(false),
            PushEvent::Message(message) => {
                self.ingest_push_message(&message);
            }
            PushEvent::Error(message) => debug!(error = %message, "Push channel error"),
        }
    }

    fn set_push_connected(&self, connected: bool) {
        self.update_connectivity(|s| s.push_connected = connected);
    }

    fn set_poll_healthy(&self, healthy: bool) {
        self.update_connectivity(|s| s.poll_healthy = healthy);
    }

    fn update_connectivity(&self, apply: impl FnOnce(&mut Session)) {
        let change = {
            let mut s = self.session.lock();
            if s.closed {
                return;
            }
            let before = s.connected();
            apply(&mut s);
            let after = s.connected();
            (before != after).then_some(after)
        };

        if let Some(connected) = change {
            info!(connected, "Feed connectivity changed");
            self.emit(SyncEvent::Connectivity { connected });
        }
    }

    fn emit_settled(&self, trade_id: &str, status: TradeStatus, reason: Option<String>) {
        self.emit(SyncEvent::TradeSettled {
            trade_id: trade_id.to_string(),
            status,
            reason,
        });
    }

    fn emit_balance(&self) {
        let available = self.session.lock().ledger.available();
        self.emit(SyncEvent::BalanceChanged { available });
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn summarize_history<'a>(history: impl Iterator<Item = &'a ReplicatedTrade>) -> String {
    let recent: Vec<String> = history
        .take(HISTORY_CONTEXT_LEN)
        .map(|t| format!("{} {} {} @ {}", t.action, t.quantity, t.ticker, t.price))
        .collect();

    if recent.is_empty() {
        "No previous replications".to_string()
    } else {
        recent.join("; ")
    }
}
