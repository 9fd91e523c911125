pub mod history;
pub mod quote;
pub mod screener;
pub mod symbols;

use async_trait::async_trait;

use crate::error::ScanError;
use crate::types::Bar;

pub use history::HistoryClient;
pub use quote::{confidence, QuoteClient};
pub use screener::{fetch_markets, MarketRequest, ScreenerClient, ScreenerPage, ScreenerQuery};

/// One page of screener rows for one market.
#[async_trait]
pub trait ScreenerApi: Send + Sync {
    async fn scan_page(
        &self,
        market: &str,
        query: &ScreenerQuery,
        offset: usize,
        limit: usize,
    ) -> Result<ScreenerPage, ScanError>;
}

/// Daily bars for one ticker. An empty vector means "no data", not failure.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn daily_bars(&self, ticker: &str, years: u32) -> Result<Vec<Bar>, ScanError>;
}

/// Opportunistic second opinion on the latest price. `None` = unavailable.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn latest_price(&self, ticker: &str) -> Option<f64>;
}
