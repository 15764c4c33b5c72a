//! HTTP client for the broker bridge: pending feed trades, order execution, balance.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::types::*;
use super::{BalanceSource, ExecutionVenue, FeedSource};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the broker bridge REST API.
#[derive(Clone)]
pub struct BrokerClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl BrokerClient {
    /// Create a client against `base_url` (no trailing slash needed).
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl FeedSource for BrokerClient {
    async fn fetch_pending_trades(&self) -> Result<Vec<serde_json::Value>> {
        let url = self.url("/pending-trades");
        debug!(url = %url, "Fetching pending trades");

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .context("Failed to fetch pending trades")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Pending trades request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse pending trades response")
    }
}

#[async_trait]
impl ExecutionVenue for BrokerClient {
    async fn execute_trade(&self, request: &ExecuteTradeRequest) -> Result<ExecuteTradeResponse> {
        let url = self.url("/execute-trade");
        debug!(
            url = %url,
            ticker = %request.ticker,
            action = %request.action,
            quantity = request.quantity,
            "Submitting trade"
        );

        let response = self
            .authorize(self.client.post(&url))
            .json(request)
            .send()
            .await
            .context("Failed to submit trade")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read execution response")?;

        if status.is_success() {
            return serde_json::from_str(&body).context("Failed to parse execution response");
        }

        // The bridge reports order-level rejections with a non-2xx status and a
        // regular response body; anything else is a transport failure.
        match serde_json::from_str::<ExecuteTradeResponse>(&body) {
            Ok(parsed) if !parsed.success => {
                warn!(status = %status, message = ?parsed.message, "Execution rejected by venue");
                Ok(parsed)
            }
            _ => anyhow::bail!("Execution request failed: {} - {}", status, body),
        }
    }
}

#[async_trait]
impl BalanceSource for BrokerClient {
    async fn fetch_balance(&self) -> Result<Decimal> {
        let url = self.url("/balance");
        debug!(url = %url, "Fetching balance");

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .context("Failed to fetch balance")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Balance request failed: {} - {}", status, body);
        }

        let balance: BalanceResponse = response
            .json()
            .await
            .context("Failed to parse balance response")?;

        Ok(balance.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalised() {
        let client = BrokerClient::new("http://localhost:4000/api/", None).unwrap();
        assert_eq!(client.url("/balance"), "http://localhost:4000/api/balance");
    }
}
