//! External collaborators: feed source, push channel, execution venue, balance source.
//!
//! The sync engine only sees the traits below; `BrokerClient` and
//! `WsPushChannel` are the HTTP / WebSocket implementations and `PaperVenue`
//! is the dry-run venue.

mod broker_client;
mod paper;
mod push_client;
mod types;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;

pub use broker_client::BrokerClient;
pub use paper::PaperVenue;
pub use push_client::WsPushChannel;
pub use types::*;

/// Poll side of the feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Raw trade records; validation happens at merge time so one bad record
    /// does not sink the batch.
    async fn fetch_pending_trades(&self) -> Result<Vec<serde_json::Value>>;
}

/// Endpoint that places an order in the user's own account.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn execute_trade(&self, request: &ExecuteTradeRequest) -> Result<ExecuteTradeResponse>;
}

/// Source of truth for the account balance.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch_balance(&self) -> Result<Decimal>;
}

/// One raw message per item; the stream ending means the connection closed.
pub type PushStream = BoxStream<'static, Result<String>>;

/// Push side of the feed. Reconnecting is the caller's job.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self) -> Result<PushStream>;
}
