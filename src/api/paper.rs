//! Dry-run execution venue: accepts every order, moves no money.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::types::{ExecuteTradeRequest, ExecuteTradeResponse};
use super::ExecutionVenue;

/// Fills every order locally. No `new_balance`, so the optimistic delta stands.
#[derive(Debug, Default, Clone, Copy)]
pub struct PaperVenue;

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn execute_trade(&self, request: &ExecuteTradeRequest) -> Result<ExecuteTradeResponse> {
        info!(
            ticker = %request.ticker,
            action = %request.action,
            quantity = request.quantity,
            price = %request.price,
            "[DRY RUN] Would execute trade"
        );

        Ok(ExecuteTradeResponse {
            success: true,
            message: Some("Simulated fill".to_string()),
            new_balance: None,
        })
    }
}
