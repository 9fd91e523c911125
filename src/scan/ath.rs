//! ATH-recovery scan: deep historical crashes followed by repeated strong
//! recoveries.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::prefilter;
use super::run_log::RunLog;
use super::worker::{BoundedWorker, Completed, WorkerPolicy};
use super::{Sources, Verdict};
use crate::config::{
    AthSettings, ScanSettings, ATH_SCAN_CONCURRENCY, INTER_BATCH_SLEEP_MS, PER_TICKER_TIMEOUT_SECS,
};
use crate::db::Store;
use crate::detector::growth::{self, GrowthParams};
use crate::error::{AppError, Result, ScanError};
use crate::fetcher::screener::SourcingPlan;
use crate::fetcher::{confidence, fetch_markets, MarketRequest, ScreenerQuery};
use crate::types::{AthMatch, Candidate, GrowthEvent, Rejection, RunSummary, ScanKind, StopReason};
use crate::validate::{detect_splits, span_days, validate_history};

/// Minimum calendar span of usable history.
const MIN_HISTORY_DAYS: i64 = 365;

#[derive(Debug)]
pub struct AthFinding {
    pub record: AthMatch,
    pub events: Vec<GrowthEvent>,
}

pub struct AthScanner {
    store: Store,
    sources: Sources,
    settings: AthSettings,
    tolerance: f64,
    sourcing: SourcingPlan,
    policy: WorkerPolicy,
}

impl AthScanner {
    pub fn new(store: Store, sources: Sources, settings: &ScanSettings) -> Self {
        let s = settings.ath.clone();
        let policy = WorkerPolicy {
            batch_size: ATH_SCAN_CONCURRENCY,
            per_item_timeout: Duration::from_secs(PER_TICKER_TIMEOUT_SECS),
            stall: Some(Duration::from_secs(s.stall_secs)),
            total: Some(Duration::from_secs(s.total_budget_secs)),
            pause: Duration::from_millis(INTER_BATCH_SLEEP_MS),
        };
        Self {
            store,
            sources,
            settings: s,
            tolerance: settings.price_tolerance.0,
            sourcing: SourcingPlan::default(),
            policy,
        }
    }

    #[cfg(test)]
    fn with_plans(mut self, sourcing: SourcingPlan, policy: WorkerPolicy) -> Self {
        self.sourcing = sourcing;
        self.policy = policy;
        self
    }

    /// Create the run row, then scan to completion.
    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = self.store.create_run(ScanKind::Ath).await?;
        Ok(self.execute(run_id).await)
    }

    /// Scan into an existing run row. Never fails: infrastructure errors end
    /// the run as `failed`.
    pub async fn execute(&self, run_id: i64) -> RunSummary {
        info!(run_id, "[SCAN] ath run started");
        let mut log = RunLog::new(run_id, ScanKind::Ath, self.store.clone());
        match self.scan(&mut log).await {
            Ok(stop) => log.finish(stop).await,
            Err(e) => log.fail(e).await,
        }
    }

    async fn scan(&self, log: &mut RunLog) -> Result<Option<StopReason>> {
        let s = &self.settings;

        // --- Sourcing ---
        let requests: Vec<MarketRequest> = s
            .groups
            .iter()
            .map(|g| MarketRequest {
                market: g.market.clone(),
                source: g.market.clone(),
                query: ScreenerQuery {
                    min_price: s.min_price,
                    min_avg_volume: s.min_avg_volume,
                    exchanges: g.exchanges.clone(),
                },
                max_rows: s.max_per_market,
            })
            .collect();
        let sourced = fetch_markets(self.sources.screener.as_ref(), &requests, &self.sourcing).await;
        if sourced.is_empty() {
            return Err(AppError::Sourcing(format!(
                "no candidates from {} exchange group(s)",
                requests.len()
            )));
        }
        log.counters.sourced = sourced.len();

        // --- Pre-filter ---
        let allowed = s.allowed_exchanges();
        let (queue, stats) = prefilter::apply(sourced, |c| prefilter::ath_check(c, s, &allowed));
        log.counters.prefiltered_out = stats.total();
        log.counters.queued = queue.len();
        info!(
            run_id = log.run_id(),
            "[PREFILTER] {} queued, {} dropped (exchange={} leveraged={} sector={} price={} decline={})",
            queue.len(),
            stats.total(),
            stats.exchange,
            stats.leveraged,
            stats.sector,
            stats.non_positive_price,
            stats.decline_band,
        );
        log.checkpoint().await?;

        // --- Deep scan ---
        let mut worker = BoundedWorker::new(self.policy);
        let batches: Vec<&[Candidate]> = queue.chunks(worker.batch_size()).collect();
        for (i, batch) in batches.iter().enumerate() {
            if let Some(reason) = worker.stop_reason() {
                warn!(run_id = log.run_id(), "[SCAN] stopping before batch {}: {reason}", i + 1);
                return Ok(Some(reason));
            }
            let (done, stop) = worker.run_batch(batch.to_vec(), |c| self.deep_scan(c)).await;
            for c in done {
                self.settle(log, c).await?;
            }
            if log.checkpoint_due() {
                log.checkpoint().await?;
            }
            if let Some(reason) = stop {
                warn!(run_id = log.run_id(), "[SCAN] stopped in batch {}: {reason}", i + 1);
                return Ok(Some(reason));
            }
            if i + 1 < batches.len() {
                worker.pause().await;
            }
        }
        Ok(None)
    }

    async fn settle(&self, log: &mut RunLog, c: Completed<Candidate, Verdict<AthFinding>>) -> Result<()> {
        let ticker = c.item.ticker.as_str();
        match c.result {
            Ok(Verdict::Matched(found)) => {
                self.store
                    .upsert_ath_match(log.run_id(), &found.record, &found.events)
                    .await?;
                let m = &found.record;
                info!(
                    run_id = log.run_id(),
                    ticker,
                    events = m.event_count,
                    score = m.growth_score,
                    "[SCAN] match: decline {:.1}% | {} events | max growth {:.0}%",
                    m.ath_decline_pct,
                    m.event_count,
                    m.max_growth_pct,
                );
                let summary = format!(
                    "events={} score={} decline={:.1}%",
                    m.event_count, m.growth_score, m.ath_decline_pct
                );
                log.matched(ticker, summary, c.elapsed);
            }
            Ok(Verdict::Rejected(why)) => {
                debug!(run_id = log.run_id(), ticker, "[SCAN] rejected: {why}");
                log.rejected(ticker, &why, c.elapsed);
            }
            Err(e) => {
                warn!(run_id = log.run_id(), ticker, kind = e.kind(), "[SCAN] ticker failed: {e}");
                log.errored(ticker, &e, c.elapsed);
            }
        }
        Ok(())
    }

    /// History → validation → strict decline band → growth events →
    /// optional cross-validation.
    async fn deep_scan(&self, c: Candidate) -> std::result::Result<Verdict<AthFinding>, ScanError> {
        let s = &self.settings;
        let raw = self.sources.history.daily_bars(&c.ticker, s.history_years).await?;
        if raw.is_empty() {
            return Ok(Verdict::Rejected(Rejection::NoData));
        }
        let bars = validate_history(raw)?;
        let Some(last) = bars.last() else {
            return Ok(Verdict::Rejected(Rejection::NoData));
        };
        let days = span_days(&bars);
        if days < MIN_HISTORY_DAYS {
            return Ok(Verdict::Rejected(Rejection::ShortHistory { days }));
        }

        let history_ath = bars.iter().map(|b| b.high).fold(0.0_f64, f64::max);
        let ath = c.ath.unwrap_or(0.0).max(history_ath);
        let current = if c.close > 0.0 { c.close } else { last.close };
        let decline_pct = (ath - current) / ath * 100.0;
        if decline_pct < s.min_decline_pct || decline_pct > s.max_decline_pct {
            return Ok(Verdict::Rejected(Rejection::DeclineOutOfBand { decline_pct }));
        }

        let analysis = growth::analyze(
            &bars,
            &GrowthParams {
                threshold_pct: s.growth_threshold_pct,
                min_consecutive_days: s.min_consecutive_days,
                lookback_years: s.history_years,
            },
        );
        if analysis.events.len() < s.min_events {
            return Ok(Verdict::Rejected(Rejection::TooFewEvents {
                found: analysis.events.len(),
                required: s.min_events,
            }));
        }

        let secondary = self.sources.quotes.latest_price(&c.ticker).await;
        let splits = detect_splits(&bars);
        if !splits.is_empty() {
            debug!(ticker = %c.ticker, count = splits.len(), "[SCAN] possible unadjusted split(s)");
        }

        let record = AthMatch {
            ticker: c.ticker,
            name: c.name,
            exchange: c.exchange,
            market: c.market,
            sector: c.sector,
            country: c.country,
            current_price: current,
            ath,
            ath_decline_pct: decline_pct,
            event_count: analysis.events.len(),
            growth_score: analysis.score,
            max_growth_pct: analysis.max_growth_pct,
            max_growth_date: analysis.max_growth_date,
            confidence: confidence(current, secondary, self.tolerance),
            needs_review: !splits.is_empty(),
            sources: c.sources,
        };
        Ok(Verdict::Matched(Box::new(AthFinding { record, events: analysis.events })))
    }
}
