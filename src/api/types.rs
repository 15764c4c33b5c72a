//! Wire types for the broker endpoints.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::TradeAction;

/// Order type sent with an execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => f.pad("MARKET"),
            OrderType::Limit => f.pad("LIMIT"),
        }
    }
}

/// Body of `POST /execute-trade`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTradeRequest {
    pub ticker: String,
    pub action: TradeAction,
    pub quantity: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub order_type: OrderType,
}

/// Response of `POST /execute-trade`.
///
/// No `new_balance` means the caller has to refresh the balance itself.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTradeResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub new_balance: Option<Decimal>,
}

/// Response of `GET /balance`.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    pub balance: Decimal,
}
