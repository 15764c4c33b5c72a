//! Mutable session state shared by the poll timer, the push handler, and user decisions.
//!
//! Every mutation happens under one synchronous lock with no `.await` inside
//! the critical section, so a status read and the status write that depends
//! on it can never interleave with another trigger.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::models::ReplicatedTrade;

use super::ledger::BalanceLedger;
use super::state_machine::TradeStateMachine;

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug)]
pub struct Session {
    pub machine: TradeStateMachine,
    pub ledger: BalanceLedger,

    /// Replicated trades, newest first. Written only by the executor.
    pub history: VecDeque<ReplicatedTrade>,

    /// Trade ids handed to the execution venue, ever
    pub submitted: HashSet<String>,

    /// Latest-arrival marker for "new trade" notifications. Not used for dedup.
    pub last_seen_trade_id: Option<String>,

    pub push_connected: bool,
    pub poll_healthy: bool,

    /// Set on teardown; late execution results are discarded once closed
    pub closed: bool,
}

impl Session {
    pub fn new(available_balance: Decimal, history: Vec<ReplicatedTrade>) -> Self {
        Self {
            machine: TradeStateMachine::new(),
            ledger: BalanceLedger::new(available_balance),
            history: history.into(),
            submitted: HashSet::new(),
            last_seen_trade_id: None,
            push_connected: false,
            poll_healthy: false,
            closed: false,
        }
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Feed reachable over either channel.
    pub fn connected(&self) -> bool {
        self.push_connected || self.poll_healthy
    }
}
