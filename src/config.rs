use std::collections::HashMap;
use std::str::FromStr;

use tracing::warn;

use crate::error::{AppError, Result};

pub const SCREENER_API_URL: &str = "https://scanner.tradingview.com";
pub const HISTORY_PRIMARY_HOST: &str = "https://query1.finance.yahoo.com";
pub const HISTORY_FALLBACK_HOST: &str = "https://query2.finance.yahoo.com";
pub const HISTORY_COOKIE_URL: &str = "https://fc.yahoo.com";
pub const QUOTE_API_URL: &str = "https://www.alphavantage.co/query";

/// Per-request HTTP timeout for every upstream client.
pub const HTTP_TIMEOUT_SECS: u64 = 20;

/// Hard ceiling on one ticker's deep scan (history fetch + analysis + quote).
pub const PER_TICKER_TIMEOUT_SECS: u64 = 45;

/// Screener rows requested per page.
pub const SCREENER_PAGE_SIZE: usize = 1500;

/// Markets fetched concurrently while sourcing.
pub const SOURCE_CONCURRENCY: usize = 4;

/// Deep-scan batch sizes.
pub const ATH_SCAN_CONCURRENCY: usize = 5;
pub const SPIKE_SCAN_CONCURRENCY: usize = 8;

/// ATH variant: stop when no ticker completes for this long.
pub const ATH_STALL_SECS: u64 = 180;

/// ATH variant: absolute wall-clock ceiling for the deep-scan phase.
pub const ATH_TOTAL_BUDGET_SECS: u64 = 50 * 60;

/// Pause between deep-scan batches (backpressure toward upstreams).
pub const INTER_BATCH_SLEEP_MS: u64 = 250;

/// Pause between sourcing batches.
pub const INTER_SOURCE_BATCH_SLEEP_MS: u64 = 500;

/// Progress is written to the run row every N processed tickers.
pub const CHECKPOINT_EVERY: usize = 25;

/// Detail rows kept per run.
pub const MAX_DETAILS_PER_RUN: usize = 5000;

/// Error strings kept on the run row.
pub const MAX_RUN_ERRORS: usize = 50;

/// Rows retained in the global error log.
pub const ERROR_LOG_MAX_ROWS: i64 = 1000;

/// Retry helper defaults.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Cross-validation defaults.
pub const QUOTE_DAILY_QUOTA: u32 = 25;
pub const PRICE_AGREEMENT_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub screener_api_url: String,
    pub history_primary_host: String,
    pub history_fallback_host: String,
    pub history_cookie_url: String,
    pub quote_api_url: String,
    /// Secondary quote key (QUOTE_API_KEY). Cross-validation is disabled without it.
    pub quote_api_key: Option<String>,
    /// Calls allowed per local calendar day (QUOTE_DAILY_QUOTA)
    pub quote_daily_quota: u32,
    /// Run a single scan and exit instead of serving (SCAN_ONESHOT=ath|spike)
    pub oneshot: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "scanner.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            screener_api_url: std::env::var("SCREENER_API_URL")
                .unwrap_or_else(|_| SCREENER_API_URL.to_string()),
            history_primary_host: std::env::var("HISTORY_PRIMARY_HOST")
                .unwrap_or_else(|_| HISTORY_PRIMARY_HOST.to_string()),
            history_fallback_host: std::env::var("HISTORY_FALLBACK_HOST")
                .unwrap_or_else(|_| HISTORY_FALLBACK_HOST.to_string()),
            history_cookie_url: std::env::var("HISTORY_COOKIE_URL")
                .unwrap_or_else(|_| HISTORY_COOKIE_URL.to_string()),
            quote_api_url: std::env::var("QUOTE_API_URL")
                .unwrap_or_else(|_| QUOTE_API_URL.to_string()),
            quote_api_key: std::env::var("QUOTE_API_KEY")
                .ok()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            quote_daily_quota: std::env::var("QUOTE_DAILY_QUOTA")
                .unwrap_or_else(|_| QUOTE_DAILY_QUOTA.to_string())
                .parse::<u32>()
                .unwrap_or(QUOTE_DAILY_QUOTA),
            oneshot: std::env::var("SCAN_ONESHOT")
                .ok()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty()),
        })
    }

    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            log_level: "debug".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            screener_api_url: "http://127.0.0.1:9".to_string(),
            history_primary_host: "http://127.0.0.1:9".to_string(),
            history_fallback_host: "http://127.0.0.1:9".to_string(),
            history_cookie_url: "http://127.0.0.1:9".to_string(),
            quote_api_url: "http://127.0.0.1:9".to_string(),
            quote_api_key: None,
            quote_daily_quota: QUOTE_DAILY_QUOTA,
            oneshot: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scan settings: typed view over the `settings` table
// ---------------------------------------------------------------------------

/// A screener market id plus the exchanges sourced from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeGroup {
    pub market: String,
    pub exchanges: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AthSettings {
    pub groups: Vec<ExchangeGroup>,
    pub excluded_sectors: Vec<String>,
    pub min_price: f64,
    pub min_avg_volume: f64,
    pub max_per_market: usize,
    /// Accepted ATH decline band, percent below the all-time high.
    pub min_decline_pct: f64,
    pub max_decline_pct: f64,
    /// Widening applied to the band in the network-free pre-filter.
    pub decline_slack_pct: f64,
    pub growth_threshold_pct: f64,
    pub min_consecutive_days: usize,
    pub min_events: usize,
    pub history_years: u32,
    pub stall_secs: u64,
    pub total_budget_secs: u64,
}

impl Default for AthSettings {
    fn default() -> Self {
        Self {
            groups: vec![
                ExchangeGroup {
                    market: "america".to_string(),
                    exchanges: vec!["NYSE".into(), "NASDAQ".into(), "AMEX".into()],
                },
                ExchangeGroup {
                    market: "canada".to_string(),
                    exchanges: vec!["TSX".into(), "TSXV".into(), "CSE".into()],
                },
                ExchangeGroup {
                    market: "uk".to_string(),
                    exchanges: vec!["LSE".into()],
                },
            ],
            excluded_sectors: Vec::new(),
            min_price: 0.10,
            min_avg_volume: 50_000.0,
            max_per_market: 6000,
            min_decline_pct: 80.0,
            max_decline_pct: 99.9,
            decline_slack_pct: 10.0,
            growth_threshold_pct: 200.0,
            min_consecutive_days: 5,
            min_events: 2,
            history_years: 20,
            stall_secs: ATH_STALL_SECS,
            total_budget_secs: ATH_TOTAL_BUDGET_SECS,
        }
    }
}

impl AthSettings {
    pub fn allowed_exchanges(&self) -> Vec<String> {
        self.groups.iter().flat_map(|g| g.exchanges.iter().cloned()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SpikeSettings {
    pub markets: Vec<String>,
    pub excluded_countries: Vec<String>,
    pub excluded_sectors: Vec<String>,
    pub min_price: f64,
    pub min_avg_volume: f64,
    pub max_per_market: usize,
    pub spike_threshold_pct: f64,
    pub min_duration_days: usize,
    pub lookback_months: u32,
    /// Reject when the base price fell more than this over the lookback window.
    pub max_base_decline_pct: f64,
    pub min_score: f64,
    pub time_budget_secs: u64,
}

impl Default for SpikeSettings {
    fn default() -> Self {
        let markets = [
            "america", "canada", "uk", "germany", "france", "netherlands", "belgium", "italy",
            "spain", "switzerland", "sweden", "norway", "denmark", "finland", "poland",
            "austria", "australia", "newzealand", "hongkong", "japan", "korea", "taiwan",
            "india", "singapore", "malaysia", "thailand", "indonesia", "brazil", "mexico",
            "southafrica", "israel", "turkey",
        ];
        Self {
            markets: markets.iter().map(|m| m.to_string()).collect(),
            excluded_countries: Vec::new(),
            excluded_sectors: Vec::new(),
            min_price: 0.01,
            min_avg_volume: 10_000.0,
            max_per_market: 5000,
            spike_threshold_pct: 75.0,
            min_duration_days: 3,
            lookback_months: 24,
            max_base_decline_pct: 60.0,
            min_score: 0.0,
            time_budget_secs: 25 * 60,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanSettings {
    pub ath: AthSettings,
    pub spike: SpikeSettings,
    pub price_tolerance: PriceTolerance,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceTolerance(pub f64);

impl Default for PriceTolerance {
    fn default() -> Self {
        Self(PRICE_AGREEMENT_TOLERANCE)
    }
}

impl ScanSettings {
    /// Build settings from `settings` table rows. Unknown keys are ignored;
    /// a value that fails to parse leaves that field at its default.
    pub fn from_rows(rows: &[(String, String)]) -> Self {
        let map: HashMap<&str, &str> = rows.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let mut s = ScanSettings::default();

        let a = &mut s.ath;
        apply(&map, "ath.min_price", &mut a.min_price);
        apply(&map, "ath.min_avg_volume", &mut a.min_avg_volume);
        apply(&map, "ath.max_per_market", &mut a.max_per_market);
        apply(&map, "ath.min_decline_pct", &mut a.min_decline_pct);
        apply(&map, "ath.max_decline_pct", &mut a.max_decline_pct);
        apply(&map, "ath.decline_slack_pct", &mut a.decline_slack_pct);
        apply(&map, "ath.growth_threshold_pct", &mut a.growth_threshold_pct);
        apply(&map, "ath.min_consecutive_days", &mut a.min_consecutive_days);
        apply(&map, "ath.min_events", &mut a.min_events);
        apply(&map, "ath.history_years", &mut a.history_years);
        apply(&map, "ath.stall_secs", &mut a.stall_secs);
        apply(&map, "ath.total_budget_secs", &mut a.total_budget_secs);
        apply_list(&map, "ath.excluded_sectors", &mut a.excluded_sectors);
        if let Some(raw) = map.get("ath.groups") {
            match parse_groups(raw) {
                Some(groups) => a.groups = groups,
                None => warn!(key = "ath.groups", raw = %raw, "[SETTINGS] unparseable, keeping default"),
            }
        }

        let p = &mut s.spike;
        apply_list(&map, "spike.markets", &mut p.markets);
        apply_list(&map, "spike.excluded_countries", &mut p.excluded_countries);
        apply_list(&map, "spike.excluded_sectors", &mut p.excluded_sectors);
        apply(&map, "spike.min_price", &mut p.min_price);
        apply(&map, "spike.min_avg_volume", &mut p.min_avg_volume);
        apply(&map, "spike.max_per_market", &mut p.max_per_market);
        apply(&map, "spike.threshold_pct", &mut p.spike_threshold_pct);
        apply(&map, "spike.min_duration_days", &mut p.min_duration_days);
        apply(&map, "spike.lookback_months", &mut p.lookback_months);
        apply(&map, "spike.max_base_decline_pct", &mut p.max_base_decline_pct);
        apply(&map, "spike.min_score", &mut p.min_score);
        apply(&map, "spike.time_budget_secs", &mut p.time_budget_secs);

        apply(&map, "quote.tolerance", &mut s.price_tolerance.0);
        s
    }
}

fn apply<T: FromStr>(map: &HashMap<&str, &str>, key: &str, field: &mut T) {
    let Some(raw) = map.get(key) else { return };
    match raw.trim().parse::<T>() {
        Ok(v) => *field = v,
        Err(_) => warn!(key, raw = %raw, "[SETTINGS] unparseable, keeping default"),
    }
}

fn apply_list(map: &HashMap<&str, &str>, key: &str, field: &mut Vec<String>) {
    if let Some(raw) = map.get(key) {
        *field = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

/// `america:NYSE|NASDAQ;canada:TSX|TSXV`
fn parse_groups(raw: &str) -> Option<Vec<ExchangeGroup>> {
    let mut groups = Vec::new();
    for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (market, exchanges) = part.split_once(':')?;
        let exchanges: Vec<String> = exchanges
            .split('|')
            .map(|e| e.trim().to_uppercase())
            .filter(|e| !e.is_empty())
            .collect();
        if market.trim().is_empty() || exchanges.is_empty() {
            return None;
        }
        groups.push(ExchangeGroup { market: market.trim().to_string(), exchanges });
    }
    if groups.is_empty() { None } else { Some(groups) }
}
