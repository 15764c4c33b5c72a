//! Locally cached account balance.
//!
//! Two writers only: the executor's optimistic delta after a confirmed
//! replication, and a refresh from the balance endpoint, which wins unless a
//! newer refresh has already landed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

// Oldest deltas are dropped past this; only outstanding tickets ever read them
const MAX_TRACKED_DELTAS: usize = 256;

/// Marks the ledger position at the moment a balance request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct LedgerDelta {
    seq: u64,
    amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct BalanceLedger {
    available: Decimal,
    last_refreshed_at: Option<DateTime<Utc>>,
    // Optimistic deltas applied since the last refresh
    deltas: Vec<LedgerDelta>,
    next_seq: u64,
    // Position of the newest authoritative value applied
    refreshed_seq: u64,
}

impl BalanceLedger {
    pub fn new(available: Decimal) -> Self {
        Self {
            available,
            last_refreshed_at: None,
            deltas: Vec::new(),
            next_seq: 0,
            refreshed_seq: 0,
        }
    }

    pub fn available(&self) -> Decimal {
        self.available
    }

    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed_at
    }

    /// Apply a signed amount after a confirmed replication.
    pub fn apply_delta(&mut self, amount: Decimal) {
        self.next_seq += 1;
        self.deltas.push(LedgerDelta {
            seq: self.next_seq,
            amount,
        });
        if self.deltas.len() > MAX_TRACKED_DELTAS {
            let excess = self.deltas.len() - MAX_TRACKED_DELTAS;
            self.deltas.drain(..excess);
        }
        self.available += amount;
        debug!(delta = %amount, available = %self.available, "Applied balance delta");
    }

    /// Overwrite with an authoritative value and drop the delta history.
    ///
    /// Any request issued before this call is stale once it answers.
    pub fn refresh(&mut self, authoritative: Decimal) {
        self.next_seq += 1;
        self.refreshed_seq = self.next_seq;
        self.deltas.clear();
        self.available = authoritative;
        self.last_refreshed_at = Some(Utc::now());
        info!(available = %authoritative, "Balance refreshed");
    }

    /// Record the ledger position before a balance request goes out.
    pub fn begin_refresh(&mut self) -> RefreshTicket {
        self.next_seq += 1;
        RefreshTicket { seq: self.next_seq }
    }

    /// Apply the answer to a request issued at `ticket`.
    ///
    /// Deltas accrued before the request are superseded by the answer; deltas
    /// applied while the request was outstanding are kept on top of it. An
    /// answer older than the last applied refresh is discarded; returns
    /// whether the answer was applied.
    pub fn complete_refresh(&mut self, ticket: RefreshTicket, authoritative: Decimal) -> bool {
        if ticket.seq < self.refreshed_seq {
            warn!(
                stale = %authoritative,
                available = %self.available,
                "Discarding balance answer older than the last refresh"
            );
            return false;
        }
        self.refreshed_seq = ticket.seq;
        self.deltas.retain(|d| d.seq > ticket.seq);
        let carried: Decimal = self.deltas.iter().map(|d| d.amount).sum();
        self.available = authoritative + carried;
        self.last_refreshed_at = Some(Utc::now());
        info!(
            authoritative = %authoritative,
            carried = %carried,
            available = %self.available,
            "Balance refreshed"
        );
        true
    }
}
