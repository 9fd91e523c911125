//! Daily OHLC history from a chart endpoint that wants a session cookie and a
//! matching anti-automation crumb on every request.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{COOKIE, SET_COOKIE, USER_AGENT};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::HistorySource;
use crate::config::{Config, HTTP_TIMEOUT_SECS};
use crate::error::ScanError;
use crate::retry::{with_retry_when, RetryPolicy};
use crate::types::Bar;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

// ---------------------------------------------------------------------------
// Session cache
// ---------------------------------------------------------------------------

struct Slot<T> {
    current: Option<T>,
    generation: u64,
}

/// Holds at most one session. Establishing happens under the lock, so
/// concurrent callers share a single in-flight handshake.
pub struct SessionCache<T: Clone> {
    slot: Mutex<Slot<T>>,
}

impl<T: Clone> Default for SessionCache<T> {
    fn default() -> Self {
        Self { slot: Mutex::new(Slot { current: None, generation: 0 }) }
    }
}

impl<T: Clone> SessionCache<T> {
    /// Current session and its generation, establishing one if absent.
    pub async fn get_or_establish<F, Fut>(&self, establish: F) -> Result<(T, u64), ScanError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ScanError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(s) = &slot.current {
            return Ok((s.clone(), slot.generation));
        }
        let fresh = establish().await?;
        slot.generation += 1;
        slot.current = Some(fresh.clone());
        Ok((fresh, slot.generation))
    }

    /// Drop the session only if it is still the one the caller saw, so a
    /// burst of auth failures triggers one re-handshake, not many.
    pub async fn invalidate(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.generation == generation {
            slot.current = None;
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    cookie: String,
    crumb: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HistoryClient {
    client: reqwest::Client,
    primary_host: String,
    fallback_host: String,
    cookie_url: String,
    sessions: SessionCache<Session>,
    ua_index: AtomicUsize,
    retry: RetryPolicy,
}

impl HistoryClient {
    pub fn new(cfg: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            primary_host: cfg.history_primary_host.clone(),
            fallback_host: cfg.history_fallback_host.clone(),
            cookie_url: cfg.history_cookie_url.clone(),
            sessions: SessionCache::default(),
            ua_index: AtomicUsize::new(0),
            retry: RetryPolicy::default(),
        })
    }

    fn next_user_agent(&self) -> &'static str {
        let i = self.ua_index.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }

    async fn handshake(&self) -> Result<Session, ScanError> {
        let ua = self.next_user_agent();
        let resp = self.client.get(&self.cookie_url).header(USER_AGENT, ua).send().await?;
        // The cookie endpoint answers 404 while still issuing the cookie.
        let cookie = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        if cookie.is_empty() {
            return Err(ScanError::Auth("no session cookie issued".to_string()));
        }

        let crumb_url = format!("{}/v1/test/getcrumb", self.primary_host);
        let resp = self
            .client
            .get(&crumb_url)
            .header(USER_AGENT, ua)
            .header(COOKIE, &cookie)
            .send()
            .await?;
        let status = resp.status();
        let crumb = resp.text().await?.trim().to_string();
        if !status.is_success() || crumb.is_empty() || crumb.contains(['<', '{', ' ']) {
            return Err(ScanError::Auth(format!("crumb exchange failed (HTTP {status})")));
        }

        info!("[HISTORY] session established");
        Ok(Session { cookie, crumb })
    }

    async fn fetch_chart(
        &self,
        host: &str,
        session: &Session,
        ticker: &str,
        years: u32,
    ) -> Result<Vec<Bar>, ScanError> {
        let now = Utc::now().timestamp();
        let from = now - i64::from(years.max(1)) * 366 * 86_400;
        let url = format!("{host}/v8/finance/chart/{ticker}");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("period1", from.to_string()),
                ("period2", now.to_string()),
                ("interval", "1d".to_string()),
                ("events", "div,split".to_string()),
                ("crumb", session.crumb.clone()),
            ])
            .header(USER_AGENT, self.next_user_agent())
            .header(COOKIE, &session.cookie)
            .send()
            .await?;

        let status = resp.status();
        match status.as_u16() {
            401 | 403 => return Err(ScanError::Auth(format!("chart HTTP {status}"))),
            429 => return Err(ScanError::Transport("rate limited (HTTP 429)".to_string())),
            s if s >= 500 => return Err(ScanError::Transport(format!("chart HTTP {status}"))),
            _ => {}
        }
        let body = resp.text().await?;
        if is_auth_error(&body) {
            return Err(ScanError::Auth("crumb rejected".to_string()));
        }
        if !status.is_success() {
            debug!(ticker, "[HISTORY] HTTP {status}, treating as no data");
            return Ok(Vec::new());
        }
        Ok(parse_chart(&body))
    }

    /// Primary host, then the alternate host once on a transport failure.
    async fn fetch_with_fallback(
        &self,
        session: &Session,
        ticker: &str,
        years: u32,
    ) -> Result<Vec<Bar>, ScanError> {
        match self.fetch_chart(&self.primary_host, session, ticker, years).await {
            Err(e) if e.is_transient() => {
                warn!(ticker, "[HISTORY] primary host failed ({e}), trying fallback");
                self.fetch_chart(&self.fallback_host, session, ticker, years).await
            }
            other => other,
        }
    }

    async fn attempt(&self, ticker: &str, years: u32) -> Result<Vec<Bar>, ScanError> {
        let (session, generation) = self.sessions.get_or_establish(|| self.handshake()).await?;
        match self.fetch_with_fallback(&session, ticker, years).await {
            Err(ScanError::Auth(reason)) => {
                debug!(ticker, "[HISTORY] auth rejected ({reason}), re-handshaking");
                self.sessions.invalidate(generation).await;
                let (fresh, _) = self.sessions.get_or_establish(|| self.handshake()).await?;
                self.fetch_with_fallback(&fresh, ticker, years).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl HistorySource for HistoryClient {
    async fn daily_bars(&self, ticker: &str, years: u32) -> Result<Vec<Bar>, ScanError> {
        with_retry_when(self.retry, ScanError::is_transient, || self.attempt(ticker, years)).await
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn is_auth_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("invalid crumb") || lower.contains("\"unauthorized\"")
}

#[derive(Deserialize)]
struct Envelope {
    chart: Option<Chart>,
}

#[derive(Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChartResult {
    meta: Option<Meta>,
    timestamp: Option<Vec<i64>>,
    indicators: Option<Indicators>,
}

#[derive(Deserialize)]
struct Meta {
    gmtoffset: Option<i64>,
}

#[derive(Deserialize)]
struct Indicators {
    quote: Option<Vec<QuoteSeries>>,
}

#[derive(Deserialize, Default)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Decode a chart response. Any embedded error, missing piece or malformed
/// body yields an empty vector.
pub fn parse_chart(body: &str) -> Vec<Bar> {
    let Ok(env) = serde_json::from_str::<Envelope>(body) else {
        return Vec::new();
    };
    let Some(chart) = env.chart else { return Vec::new() };
    if chart.error.as_ref().is_some_and(|e| !e.is_null()) {
        return Vec::new();
    }
    let Some(result) = chart.result.and_then(|r| r.into_iter().next()) else {
        return Vec::new();
    };
    let offset = result.meta.and_then(|m| m.gmtoffset).unwrap_or(0);
    let Some(timestamps) = result.timestamp else { return Vec::new() };
    let Some(q) = result.indicators.and_then(|i| i.quote).and_then(|q| q.into_iter().next()) else {
        return Vec::new();
    };

    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten().filter(|x| x.is_finite());
    timestamps
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let date = DateTime::from_timestamp(ts + offset, 0)?.date_naive();
            Some(Bar {
                date,
                open: at(&q.open, i)?,
                high: at(&q.high, i)?,
                low: at(&q.low, i)?,
                close: at(&q.close, i)?,
                volume: at(&q.volume, i).unwrap_or(0.0),
            })
        })
        .collect()
}
