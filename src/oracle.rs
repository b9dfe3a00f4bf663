use std::time::Duration;

use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::config::FALLBACK_SOL_USD;

/// Spot-price client for the chain's native asset. Quotes are best effort:
/// a stale fallback rate is preferred over blocking the purchase flow, so
/// this never returns an error.
pub struct PriceOracle {
    client: Client,
    url: String,
}

impl PriceOracle {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url: url.into() }
    }

    /// Current SOL/USD rate, or [`FALLBACK_SOL_USD`] on any failure.
    pub async fn sol_usd_rate(&self) -> Decimal {
        match self.try_fetch().await {
            Some(rate) if rate > Decimal::ZERO => rate,
            _ => {
                log::warn!("price fetch failed, using fallback rate {FALLBACK_SOL_USD}");
                FALLBACK_SOL_USD
            }
        }
    }

    async fn try_fetch(&self) -> Option<Decimal> {
        let res = self.client.get(&self.url).send().await.ok()?;
        if !res.status().is_success() {
            return None;
        }
        let body: serde_json::Value = res.json().await.ok()?;
        let rate = body["solana"]["usd"].as_f64()?;
        Decimal::from_f64(rate)
    }
}
