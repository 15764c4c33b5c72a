//! Sync configuration.

use std::time::Duration;

use anyhow::{bail, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::api::OrderType;

/// Reconnect policy for the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt
    pub initial_delay_ms: u64,

    /// Upper bound for the delay between attempts
    pub max_delay_ms: u64,

    /// Growth factor applied after each failed attempt
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Build a backoff that never gives up.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_delay_ms))
            .with_max_interval(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.1)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Process-wide configuration for the sync engine.
///
/// Loaded once at startup. Only `trade_size_limit` changes at runtime, through
/// `SyncOrchestrator::update_trade_size_limit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum notional per replicated trade
    pub trade_size_limit: Decimal,

    /// Interval between feed polls
    pub poll_interval_ms: u64,

    /// Push channel reconnect policy
    pub reconnect: ReconnectPolicy,

    /// Deadline for one execution request
    pub submit_timeout_ms: u64,

    /// Order type sent to the execution endpoint
    pub order_type: OrderType,

    /// Balance used when there is no snapshot and no balance source answers
    pub starting_balance: Decimal,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            trade_size_limit: dec!(1000),
            poll_interval_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            submit_timeout_ms: 15_000,
            order_type: OrderType::Market,
            starting_balance: dec!(50000),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.trade_size_limit <= Decimal::ZERO {
            bail!("trade size limit must be positive, got {}", self.trade_size_limit);
        }
        if self.poll_interval_ms == 0 {
            bail!("poll interval must be positive");
        }
        if self.submit_timeout_ms == 0 {
            bail!("submit timeout must be positive");
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            bail!(
                "reconnect delays must satisfy 0 < initial ({}) <= max ({})",
                self.reconnect.initial_delay_ms,
                self.reconnect.max_delay_ms
            );
        }
        if self.reconnect.multiplier < 1.0 {
            bail!("reconnect multiplier must be at least 1.0");
        }
        if self.starting_balance < Decimal::ZERO {
            bail!("starting balance must not be negative");
        }
        Ok(())
    }
}
