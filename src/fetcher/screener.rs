use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::symbols::{is_excluded_instrument, normalize_ticker, split_symbol};
use super::ScreenerApi;
use crate::config::{HTTP_TIMEOUT_SECS, INTER_SOURCE_BATCH_SLEEP_MS, SCREENER_PAGE_SIZE, SOURCE_CONCURRENCY};
use crate::error::ScanError;
use crate::retry::{with_retry_when, RetryPolicy};
use crate::types::Candidate;

/// Requested columns, in the order rows report them.
const COLUMNS: &[&str] = &[
    "name",
    "description",
    "close",
    "price_52_week_high",
    "price_52_week_low",
    "High.All",
    "sector",
    "country",
    "volume",
    "average_volume_30d_calc",
    "market_cap_basic",
    "exchange",
    "type",
];

mod col {
    pub const DESCRIPTION: usize = 1;
    pub const CLOSE: usize = 2;
    pub const HIGH_52W: usize = 3;
    pub const LOW_52W: usize = 4;
    pub const ATH: usize = 5;
    pub const SECTOR: usize = 6;
    pub const COUNTRY: usize = 7;
    pub const VOLUME: usize = 8;
    pub const AVG_VOLUME_30D: usize = 9;
    pub const MARKET_CAP: usize = 10;
    pub const EXCHANGE: usize = 11;
    pub const TYPE: usize = 12;
}

/// Broad numeric filters pushed down to the screener.
#[derive(Debug, Clone, Default)]
pub struct ScreenerQuery {
    pub min_price: f64,
    pub min_avg_volume: f64,
    /// Empty = every exchange of the market.
    pub exchanges: Vec<String>,
}

impl ScreenerQuery {
    fn body(&self, market: &str, offset: usize, limit: usize) -> Value {
        let mut filter = vec![
            json!({"left": "close", "operation": "greater", "right": self.min_price}),
            json!({"left": "average_volume_30d_calc", "operation": "greater", "right": self.min_avg_volume}),
            json!({"left": "price_52_week_high", "operation": "nempty"}),
            json!({"left": "price_52_week_low", "operation": "nempty"}),
        ];
        if !self.exchanges.is_empty() {
            filter.push(json!({"left": "exchange", "operation": "in_range", "right": self.exchanges}));
        }
        json!({
            "filter": filter,
            "options": {"lang": "en"},
            "markets": [market],
            "symbols": {"query": {"types": []}, "tickers": []},
            "columns": COLUMNS,
            "sort": {"sortBy": "market_cap_basic", "sortOrder": "desc"},
            "range": [offset, offset + limit],
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScreenerRow {
    pub symbol: String,
    pub columns: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ScreenerPage {
    pub total_count: usize,
    pub rows: Vec<ScreenerRow>,
}

#[derive(Deserialize)]
struct RawPage {
    #[serde(rename = "totalCount", default)]
    total_count: Option<usize>,
    #[serde(default)]
    data: Option<Vec<RawRow>>,
}

#[derive(Deserialize)]
struct RawRow {
    #[serde(alias = "symbol")]
    s: String,
    #[serde(alias = "columns", default)]
    d: Vec<Value>,
}

/// Parse a screener response body. Unknown fields are ignored and a missing
/// `data` array reads as an empty page.
pub fn parse_page(body: &str) -> Result<ScreenerPage, ScanError> {
    let raw: RawPage =
        serde_json::from_str(body).map_err(|e| ScanError::DataShape(format!("screener: {e}")))?;
    Ok(ScreenerPage {
        total_count: raw.total_count.unwrap_or(0),
        rows: raw
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|r| ScreenerRow { symbol: r.s, columns: r.d })
            .collect(),
    })
}

/// HTTP client for the screener scan endpoint.
pub struct ScreenerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ScreenerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, base_url: base_url.into() })
    }
}

#[async_trait]
impl ScreenerApi for ScreenerClient {
    async fn scan_page(
        &self,
        market: &str,
        query: &ScreenerQuery,
        offset: usize,
        limit: usize,
    ) -> Result<ScreenerPage, ScanError> {
        let url = format!("{}/{}/scan", self.base_url, market);
        let resp = self
            .client
            .post(&url)
            .json(&query.body(market, offset, limit))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ScanError::Transport(format!("screener {market} HTTP {status}")));
        }
        let body = resp.text().await?;
        parse_page(&body)
    }
}

// ---------------------------------------------------------------------------
// Row → Candidate
// ---------------------------------------------------------------------------

fn col_f64(row: &ScreenerRow, idx: usize) -> Option<f64> {
    row.columns
        .get(idx)
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .filter(|v| v.is_finite())
}

fn col_str(row: &ScreenerRow, idx: usize) -> Option<String> {
    row.columns
        .get(idx)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

enum Rejection {
    Malformed,
    Instrument,
    Unmapped,
}

fn candidate_from_row(row: &ScreenerRow, market: &str, source: &str) -> Result<Candidate, Rejection> {
    let (prefix, symbol) = split_symbol(&row.symbol);
    let exchange = col_str(row, col::EXCHANGE).unwrap_or_else(|| prefix.to_string());
    let name = col_str(row, col::DESCRIPTION).unwrap_or_else(|| symbol.to_string());

    if is_excluded_instrument(&name, col_str(row, col::TYPE).as_deref()) {
        return Err(Rejection::Instrument);
    }

    let close = col_f64(row, col::CLOSE).ok_or(Rejection::Malformed)?;
    let high_52w = col_f64(row, col::HIGH_52W).ok_or(Rejection::Malformed)?;
    let low_52w = col_f64(row, col::LOW_52W).ok_or(Rejection::Malformed)?;

    let ticker = normalize_ticker(&exchange, symbol).ok_or(Rejection::Unmapped)?;

    Ok(Candidate {
        ticker,
        raw_symbol: row.symbol.clone(),
        name,
        exchange: exchange.to_uppercase(),
        market: market.to_string(),
        close,
        high_52w,
        low_52w,
        ath: col_f64(row, col::ATH).filter(|v| *v > 0.0),
        sector: col_str(row, col::SECTOR),
        country: col_str(row, col::COUNTRY),
        volume: col_f64(row, col::VOLUME),
        avg_volume_30d: col_f64(row, col::AVG_VOLUME_30D),
        market_cap: col_f64(row, col::MARKET_CAP),
        sources: vec![source.to_string()],
    })
}

// ---------------------------------------------------------------------------
// Pagination and fan-out
// ---------------------------------------------------------------------------

/// One market to source, tagged with a provenance label.
#[derive(Debug, Clone)]
pub struct MarketRequest {
    pub market: String,
    pub source: String,
    pub query: ScreenerQuery,
    pub max_rows: usize,
}

/// Knobs for [`fetch_markets`].
#[derive(Debug, Clone, Copy)]
pub struct SourcingPlan {
    pub page_size: usize,
    pub concurrency: usize,
    pub pause: Duration,
    pub retry: RetryPolicy,
}

impl Default for SourcingPlan {
    fn default() -> Self {
        Self {
            page_size: SCREENER_PAGE_SIZE,
            concurrency: SOURCE_CONCURRENCY,
            pause: Duration::from_millis(INTER_SOURCE_BATCH_SLEEP_MS),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchStats {
    pub api_total: usize,
    pub rejected_malformed: usize,
    pub rejected_instrument: usize,
    pub rejected_unmapped: usize,
    pub qualified: usize,
}

/// Page through one market: page 0 learns `totalCount`, then fixed-size pages
/// until the count (capped at `max_rows`) is covered or a page comes back empty.
pub async fn fetch_market(
    api: &dyn ScreenerApi,
    req: &MarketRequest,
    plan: &SourcingPlan,
) -> Result<(Vec<Candidate>, FetchStats), ScanError> {
    let page_size = plan.page_size.max(1);
    let page = |offset: usize| {
        with_retry_when(plan.retry, ScanError::is_transient, move || {
            api.scan_page(&req.market, &req.query, offset, page_size)
        })
    };

    let first = page(0).await?;
    let limit = first.total_count.min(req.max_rows);
    let mut rows = first.rows;
    let mut offset = page_size;

    while !rows.is_empty() && offset < limit {
        let next = page(offset).await?;
        if next.rows.is_empty() {
            break;
        }
        rows.extend(next.rows);
        offset += page_size;
    }
    rows.truncate(req.max_rows);

    let mut stats = FetchStats { api_total: rows.len(), ..Default::default() };
    let mut candidates = Vec::with_capacity(rows.len());
    for row in &rows {
        match candidate_from_row(row, &req.market, &req.source) {
            Ok(c) => candidates.push(c),
            Err(Rejection::Malformed) => stats.rejected_malformed += 1,
            Err(Rejection::Instrument) => stats.rejected_instrument += 1,
            Err(Rejection::Unmapped) => stats.rejected_unmapped += 1,
        }
    }
    stats.qualified = candidates.len();
    Ok((candidates, stats))
}

/// Source every market in small concurrent batches. A failing market is
/// logged and contributes nothing; the result is deduplicated by ticker.
pub async fn fetch_markets(
    api: &dyn ScreenerApi,
    requests: &[MarketRequest],
    plan: &SourcingPlan,
) -> Vec<Candidate> {
    let mut all = Vec::new();
    for (i, batch) in requests.chunks(plan.concurrency.max(1)).enumerate() {
        if i > 0 && !plan.pause.is_zero() {
            tokio::time::sleep(plan.pause).await;
        }
        let results = join_all(batch.iter().map(|req| fetch_market(api, req, plan))).await;
        for (req, result) in batch.iter().zip(results) {
            match result {
                Ok((candidates, stats)) => {
                    info!(
                        market = %req.market,
                        source = %req.source,
                        rows = stats.api_total,
                        qualified = stats.qualified,
                        "[SOURCE] {} rows, {} qualified (malformed={} instrument={} unmapped={})",
                        stats.api_total,
                        stats.qualified,
                        stats.rejected_malformed,
                        stats.rejected_instrument,
                        stats.rejected_unmapped,
                    );
                    all.extend(candidates);
                }
                Err(e) => warn!(market = %req.market, source = %req.source, "[SOURCE] market failed: {e}"),
            }
        }
    }
    let before = all.len();
    let deduped = dedup_candidates(all);
    debug!("[SOURCE] dedup {before} → {}", deduped.len());
    deduped
}

/// Keep one candidate per ticker: the one with the most extreme 52-week range
/// ratio. Provenance from every duplicate is merged onto the survivor.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_ticker: HashMap<String, Candidate> = HashMap::new();
    for c in candidates {
        match by_ticker.get_mut(&c.ticker) {
            None => {
                by_ticker.insert(c.ticker.clone(), c);
            }
            Some(existing) => {
                let mut sources = std::mem::take(&mut existing.sources);
                for s in &c.sources {
                    if !sources.contains(s) {
                        sources.push(s.clone());
                    }
                }
                if c.range_ratio() > existing.range_ratio() {
                    *existing = c;
                }
                existing.sources = sources;
            }
        }
    }
    let mut out: Vec<Candidate> = by_ticker.into_values().collect();
    out.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    use crate::fetcher::testing::serve;

    /// Serves `total` rows in pages, except that pages listed in `empty_at`
    /// come back with zero rows. Records every requested offset.
    struct PagedApi {
        total: usize,
        empty_at: Vec<usize>,
        offsets: Mutex<Vec<usize>>,
    }

    impl PagedApi {
        fn new(total: usize) -> Self {
            Self { total, empty_at: Vec::new(), offsets: Mutex::new(Vec::new()) }
        }
    }

    fn row(exchange: &str, symbol: &str, close: f64, high: f64, low: f64) -> ScreenerRow {
        let mut columns = vec![Value::Null; COLUMNS.len()];
        columns[0] = json!(symbol);
        columns[col::DESCRIPTION] = json!(format!("{symbol} Corp"));
        columns[col::CLOSE] = json!(close);
        columns[col::HIGH_52W] = json!(high);
        columns[col::LOW_52W] = json!(low);
        columns[col::EXCHANGE] = json!(exchange);
        columns[col::TYPE] = json!("stock");
        ScreenerRow { symbol: format!("{exchange}:{symbol}"), columns }
    }

    #[async_trait]
    impl ScreenerApi for PagedApi {
        async fn scan_page(
            &self,
            _market: &str,
            _query: &ScreenerQuery,
            offset: usize,
            limit: usize,
        ) -> Result<ScreenerPage, ScanError> {
            self.offsets.lock().unwrap().push(offset);
            let n = if self.empty_at.contains(&offset) {
                0
            } else {
                self.total.saturating_sub(offset).min(limit)
            };
            let rows = (0..n).map(|i| row("NYSE", &format!("T{}", offset + i), 5.0, 10.0, 2.0)).collect();
            Ok(ScreenerPage { total_count: self.total, rows })
        }
    }

    fn request(max_rows: usize) -> MarketRequest {
        MarketRequest {
            market: "america".into(),
            source: "america".into(),
            query: ScreenerQuery::default(),
            max_rows,
        }
    }

    fn plan() -> SourcingPlan {
        SourcingPlan {
            page_size: 1500,
            concurrency: 4,
            pause: Duration::ZERO,
            retry: RetryPolicy::new(1, Duration::ZERO),
        }
    }

    #[tokio::test]
    async fn pages_until_total_count_is_covered() {
        let api = PagedApi::new(3200);
        let (candidates, stats) = fetch_market(&api, &request(10_000), &plan()).await.unwrap();
        assert_eq!(*api.offsets.lock().unwrap(), vec![0, 1500, 3000]);
        assert_eq!(candidates.len(), 3200);
        assert_eq!(stats.qualified, 3200);
    }

    #[tokio::test]
    async fn stops_on_zero_row_page() {
        let mut api = PagedApi::new(3200);
        api.empty_at = vec![1500];
        let (candidates, _) = fetch_market(&api, &request(10_000), &plan()).await.unwrap();
        assert_eq!(*api.offsets.lock().unwrap(), vec![0, 1500]);
        assert_eq!(candidates.len(), 1500);
    }

    #[tokio::test]
    async fn max_rows_caps_pagination() {
        let api = PagedApi::new(3200);
        let (candidates, _) = fetch_market(&api, &request(2000), &plan()).await.unwrap();
        assert_eq!(*api.offsets.lock().unwrap(), vec![0, 1500]);
        assert_eq!(candidates.len(), 2000);
    }

    struct FailingMarket;

    #[async_trait]
    impl ScreenerApi for FailingMarket {
        async fn scan_page(
            &self,
            market: &str,
            _query: &ScreenerQuery,
            _offset: usize,
            _limit: usize,
        ) -> Result<ScreenerPage, ScanError> {
            if market == "broken" {
                return Err(ScanError::Transport("connection reset".into()));
            }
            Ok(ScreenerPage {
                total_count: 1,
                rows: vec![row("NASDAQ", "GOOD", 3.0, 9.0, 1.0)],
            })
        }
    }

    #[tokio::test]
    async fn failing_market_does_not_abort_fan_out() {
        let mut broken = request(100);
        broken.market = "broken".into();
        let requests = vec![broken, request(100)];
        let out = fetch_markets(&FailingMarket, &requests, &plan()).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ticker, "GOOD");
    }

    #[test]
    fn parses_rows_with_nulls_and_unknown_fields() {
        let body = r#"{"totalCount":2,"extra":{"x":1},"data":[
            {"s":"NASDAQ:ABC","d":["ABC","Abc Inc",4.5,12.0,1.5,null,null,"United States",1000,2000,null,"NASDAQ","stock"]},
            {"s":"NYSE:SPY","d":["SPY","SPDR S&P 500 ETF Trust",500,510,400,600,null,null,1,1,1,"NYSE","fund"]}
        ]}"#;
        let page = parse_page(body).unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.rows.len(), 2);
        let c = candidate_from_row(&page.rows[0], "america", "america").ok().unwrap();
        assert_eq!(c.ticker, "ABC");
        assert_eq!(c.ath, None);
        assert_eq!(c.sector, None);
        assert_eq!(c.country.as_deref(), Some("United States"));
        assert!(matches!(candidate_from_row(&page.rows[1], "america", "america"), Err(Rejection::Instrument)));
    }

    #[test]
    fn missing_data_reads_as_empty_page() {
        let page = parse_page(r#"{"totalCount":0}"#).unwrap();
        assert!(page.rows.is_empty());
        assert!(parse_page("<html>").is_err());
    }

    #[test]
    fn dedup_keeps_most_extreme_range_and_merges_sources() {
        let mut a = candidate_from_row(&row("NYSE", "DUP", 5.0, 10.0, 5.0), "america", "us").ok().unwrap();
        let mut b = candidate_from_row(&row("NYSE", "DUP", 5.0, 40.0, 2.0), "america", "otc").ok().unwrap();
        a.market = "first".into();
        b.market = "second".into();
        let out = dedup_candidates(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].market, "second");
        assert_eq!(out[0].sources, vec!["us".to_string(), "otc".to_string()]);
    }

    // -----------------------------------------------------------------------
    // Against a local upstream
    // -----------------------------------------------------------------------

    /// `/{market}/scan`: `america` answers with one page and records each
    /// request body, `broken` answers 502, `html` answers a login page.
    async fn screener_upstream(bodies: Arc<Mutex<Vec<Value>>>) -> ScreenerClient {
        let app = Router::new().route(
            "/:market/scan",
            post(move |Path(market): Path<String>, Json(body): Json<Value>| {
                let bodies = Arc::clone(&bodies);
                async move {
                    bodies.lock().unwrap().push(body);
                    match market.as_str() {
                        "america" => (
                            StatusCode::OK,
                            r#"{"totalCount":3200,"data":[
                                {"s":"NASDAQ:ABC","d":["ABC","Abc Inc",4.5,12.0,1.5,20.0,"Technology","United States",1000,2000,5e8,"NASDAQ","stock"]},
                                {"s":"NYSE:XYZ","d":["XYZ","Xyz Corp",2.0,3.0,1.0,null,null,null,10,20,null,"NYSE","stock"]}
                            ]}"#,
                        ),
                        "broken" => (StatusCode::BAD_GATEWAY, ""),
                        _ => (StatusCode::OK, "<html>sign in</html>"),
                    }
                }
            }),
        );
        ScreenerClient::new(serve(app).await).unwrap()
    }

    #[tokio::test]
    async fn scan_page_posts_filters_and_range() {
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let client = screener_upstream(Arc::clone(&bodies)).await;
        let query = ScreenerQuery {
            min_price: 0.5,
            min_avg_volume: 10_000.0,
            exchanges: vec!["NYSE".into(), "NASDAQ".into()],
        };

        let page = client.scan_page("america", &query, 1500, 1500).await.unwrap();
        assert_eq!(page.total_count, 3200);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0].symbol, "NASDAQ:ABC");

        let sent = bodies.lock().unwrap()[0].clone();
        assert_eq!(sent["range"], json!([1500, 3000]));
        assert_eq!(sent["markets"], json!(["america"]));
        assert_eq!(sent["columns"].as_array().map(Vec::len), Some(COLUMNS.len()));
        let filters = sent["filter"].as_array().unwrap();
        assert!(filters.iter().any(|f| f["left"] == "close" && f["right"] == json!(0.5)));
        assert!(filters
            .iter()
            .any(|f| f["left"] == "exchange" && f["operation"] == "in_range" && f["right"] == json!(["NYSE", "NASDAQ"])));
    }

    #[tokio::test]
    async fn scan_page_maps_failures() {
        let client = screener_upstream(Arc::new(Mutex::new(Vec::new()))).await;
        let query = ScreenerQuery::default();

        let err = client.scan_page("broken", &query, 0, 10).await.unwrap_err();
        assert!(matches!(err, ScanError::Transport(ref m) if m.contains("502")), "{err}");
        let err = client.scan_page("html", &query, 0, 10).await.unwrap_err();
        assert!(matches!(err, ScanError::DataShape(_)), "{err}");
    }

    #[tokio::test]
    async fn fan_out_over_http_skips_the_failing_market() {
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let client = screener_upstream(Arc::clone(&bodies)).await;
        let mut broken = request(10);
        broken.market = "broken".into();

        let out = fetch_markets(&client, &[broken, request(10)], &plan()).await;
        let tickers: Vec<&str> = out.iter().map(|c| c.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["ABC", "XYZ"]);
        assert_eq!(out[0].ath, Some(20.0));
        // Ten rows requested, the first page already covers them.
        assert_eq!(bodies.lock().unwrap().len(), 2);
    }
}
