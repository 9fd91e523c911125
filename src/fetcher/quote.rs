//! Secondary quote source used only to score confidence in the primary price.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde_json::Value;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::QuoteSource;
use crate::config::{Config, HTTP_TIMEOUT_SECS};

/// Confidence when the two sources disagree.
pub const DISAGREEMENT_CONFIDENCE: u8 = 50;

/// Calls used today. Resets when the local calendar date rolls over.
#[derive(Debug)]
pub struct DailyQuota {
    limit: u32,
    state: Mutex<(NaiveDate, u32)>,
}

impl DailyQuota {
    pub fn new(limit: u32) -> Self {
        Self { limit, state: Mutex::new((Local::now().date_naive(), 0)) }
    }

    /// Claim one call for `today`. False once the day's quota is spent.
    pub fn try_take(&self, today: NaiveDate) -> bool {
        let Ok(mut state) = self.state.lock() else { return false };
        if state.0 != today {
            *state = (today, 0);
        }
        if state.1 >= self.limit {
            return false;
        }
        state.1 += 1;
        true
    }

    #[cfg(test)]
    pub fn used(&self) -> u32 {
        self.state.lock().map(|s| s.1).unwrap_or(0)
    }
}

pub struct QuoteClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    quota: DailyQuota,
}

impl QuoteClient {
    pub fn new(cfg: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        if cfg.quote_api_key.is_none() {
            info!("[QUOTE] QUOTE_API_KEY not set, cross-validation disabled");
        }
        Ok(Self {
            client,
            base_url: cfg.quote_api_url.clone(),
            api_key: cfg.quote_api_key.clone(),
            quota: DailyQuota::new(cfg.quote_daily_quota),
        })
    }
}

#[async_trait]
impl QuoteSource for QuoteClient {
    async fn latest_price(&self, ticker: &str) -> Option<f64> {
        let key = self.api_key.as_deref()?;
        if !self.quota.try_take(Local::now().date_naive()) {
            debug!(ticker, "[QUOTE] daily quota exhausted");
            return None;
        }
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[("function", "GLOBAL_QUOTE"), ("symbol", ticker), ("apikey", key)])
            .send()
            .await;
        let body = match resp {
            Ok(r) if r.status().is_success() => r.text().await.ok()?,
            Ok(r) => {
                warn!(ticker, "[QUOTE] HTTP {}", r.status());
                return None;
            }
            Err(e) => {
                warn!(ticker, "[QUOTE] request failed: {e}");
                return None;
            }
        };
        parse_global_quote(&body)
    }
}

/// Accepts both `{"Global Quote":{"05. price":"1.23"}}` and the compact
/// `{"GlobalQuote":{"price":1.23}}` shapes.
pub fn parse_global_quote(body: &str) -> Option<f64> {
    let v: Value = serde_json::from_str(body).ok()?;
    let quote = v.get("Global Quote").or_else(|| v.get("GlobalQuote"))?;
    let price = quote.get("05. price").or_else(|| quote.get("price"))?;
    price
        .as_f64()
        .or_else(|| price.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|p| p.is_finite() && *p > 0.0)
}

/// 100 with a single source or when both agree within `tolerance` (relative
/// to the primary); [`DISAGREEMENT_CONFIDENCE`] otherwise.
pub fn confidence(primary: f64, secondary: Option<f64>, tolerance: f64) -> u8 {
    match secondary {
        None => 100,
        Some(_) if primary <= 0.0 => DISAGREEMENT_CONFIDENCE,
        Some(other) => {
            if ((primary - other) / primary).abs() <= tolerance {
                100
            } else {
                DISAGREEMENT_CONFIDENCE
            }
        }
    }
}
