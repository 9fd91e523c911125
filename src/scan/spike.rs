//! Short-lived price spike scan over a broad multi-market universe, with
//! rotation so successive runs reach different tickers first.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::prefilter;
use super::rotation::prioritize;
use super::run_log::RunLog;
use super::worker::{BoundedWorker, Completed, WorkerPolicy};
use super::{Sources, Verdict};
use crate::config::{
    ScanSettings, SpikeSettings, INTER_BATCH_SLEEP_MS, PER_TICKER_TIMEOUT_SECS, SPIKE_SCAN_CONCURRENCY,
};
use crate::db::Store;
use crate::detector::spike::{self, SpikeParams};
use crate::error::{AppError, Result, ScanError};
use crate::fetcher::screener::SourcingPlan;
use crate::fetcher::{confidence, fetch_markets, MarketRequest, ScreenerQuery};
use crate::types::{
    Candidate, HistoryResult, Rejection, RunSummary, ScanKind, SpikeEvent, SpikeMatch, StopReason,
};
use crate::validate::{detect_splits, validate_history};

#[derive(Debug)]
pub struct SpikeFinding {
    pub record: SpikeMatch,
    pub events: Vec<SpikeEvent>,
}

pub struct SpikeScanner {
    store: Store,
    sources: Sources,
    settings: SpikeSettings,
    tolerance: f64,
    sourcing: SourcingPlan,
    policy: WorkerPolicy,
}

impl SpikeScanner {
    pub fn new(store: Store, sources: Sources, settings: &ScanSettings) -> Self {
        let s = settings.spike.clone();
        let policy = WorkerPolicy {
            batch_size: SPIKE_SCAN_CONCURRENCY,
            per_item_timeout: Duration::from_secs(PER_TICKER_TIMEOUT_SECS),
            stall: None,
            total: Some(Duration::from_secs(s.time_budget_secs)),
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

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = self.store.create_run(ScanKind::Spike).await?;
        Ok(self.execute(run_id).await)
    }

    pub async fn execute(&self, run_id: i64) -> RunSummary {
        info!(run_id, "[SCAN] spike run started");
        let mut log = RunLog::new(run_id, ScanKind::Spike, self.store.clone());
        match self.scan(&mut log).await {
            Ok(stop) => log.finish(stop).await,
            Err(e) => log.fail(e).await,
        }
    }

    async fn scan(&self, log: &mut RunLog) -> Result<Option<StopReason>> {
        let s = &self.settings;

        // --- Sourcing ---
        let requests: Vec<MarketRequest> = s
            .markets
            .iter()
            .map(|m| MarketRequest {
                market: m.clone(),
                source: m.clone(),
                query: ScreenerQuery {
                    min_price: s.min_price,
                    min_avg_volume: s.min_avg_volume,
                    exchanges: Vec::new(),
                },
                max_rows: s.max_per_market,
            })
            .collect();
        let sourced = fetch_markets(self.sources.screener.as_ref(), &requests, &self.sourcing).await;
        if sourced.is_empty() {
            return Err(AppError::Sourcing(format!("no candidates from {} market(s)", requests.len())));
        }
        log.counters.sourced = sourced.len();

        // --- Pre-filter + rotation ---
        let (queue, stats) = prefilter::apply(sourced, |c| prefilter::spike_check(c, s));
        let history = self.store.load_scan_history().await?;
        let fresh = queue.iter().filter(|c| !history.contains_key(&c.ticker)).count();
        let queue = prioritize(queue, &history, &mut rand::rng());
        log.counters.prefiltered_out = stats.total();
        log.counters.queued = queue.len();
        info!(
            run_id = log.run_id(),
            "[PREFILTER] {} queued ({} never scanned), {} dropped (country={} sector={} price={})",
            queue.len(),
            fresh,
            stats.total(),
            stats.country,
            stats.sector,
            stats.non_positive_price,
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
                warn!(
                    run_id = log.run_id(),
                    "[SCAN] stopped in batch {}: {reason}, {} ticker(s) left for the next run",
                    i + 1,
                    queue.len().saturating_sub(log.counters.processed),
                );
                return Ok(Some(reason));
            }
            if i + 1 < batches.len() {
                worker.pause().await;
            }
        }
        Ok(None)
    }

    async fn settle(&self, log: &mut RunLog, c: Completed<Candidate, Verdict<SpikeFinding>>) -> Result<()> {
        let ticker = c.item.ticker.as_str();
        let seen = match c.result {
            Ok(Verdict::Matched(found)) => {
                self.store
                    .upsert_spike_match(log.run_id(), &found.record, &found.events)
                    .await?;
                let m = &found.record;
                info!(
                    run_id = log.run_id(),
                    ticker,
                    events = m.event_count,
                    "[SCAN] match: score {:.2} | max spike {:.0}% | base {:.4}",
                    m.spike_score,
                    m.max_spike_pct,
                    m.median_base_price,
                );
                let summary = format!(
                    "events={} score={:.2} max_spike={:.0}%",
                    m.event_count, m.spike_score, m.max_spike_pct
                );
                log.matched(ticker, summary, c.elapsed);
                HistoryResult::Match
            }
            Ok(Verdict::Rejected(why)) => {
                debug!(run_id = log.run_id(), ticker, "[SCAN] rejected: {why}");
                log.rejected(ticker, &why, c.elapsed);
                HistoryResult::Rejected
            }
            Err(e) => {
                warn!(run_id = log.run_id(), ticker, kind = e.kind(), "[SCAN] ticker failed: {e}");
                log.errored(ticker, &e, c.elapsed);
                HistoryResult::Error
            }
        };
        self.store.upsert_scan_history(ticker, seen).await
    }

    async fn deep_scan(&self, c: Candidate) -> std::result::Result<Verdict<SpikeFinding>, ScanError> {
        let s = &self.settings;
        let years = s.lookback_months.div_ceil(12).max(1);
        let raw = self.sources.history.daily_bars(&c.ticker, years).await?;
        if raw.is_empty() {
            return Ok(Verdict::Rejected(Rejection::NoData));
        }
        let bars = validate_history(raw)?;
        let Some(last) = bars.last() else {
            return Ok(Verdict::Rejected(Rejection::NoData));
        };

        let analysis = spike::analyze(
            &bars,
            &SpikeParams {
                threshold_pct: s.spike_threshold_pct,
                min_duration_days: s.min_duration_days,
                lookback_months: s.lookback_months,
            },
        );
        if analysis.events.is_empty() {
            return Ok(Verdict::Rejected(Rejection::NoSpike));
        }
        if analysis.base_decline_pct > s.max_base_decline_pct {
            return Ok(Verdict::Rejected(Rejection::BaseDeclined {
                decline_pct: analysis.base_decline_pct,
            }));
        }
        if analysis.spike_score < s.min_score {
            return Ok(Verdict::Rejected(Rejection::LowScore { score: analysis.spike_score }));
        }

        let current = if c.close > 0.0 { c.close } else { last.close };
        let secondary = self.sources.quotes.latest_price(&c.ticker).await;
        let record = SpikeMatch {
            ticker: c.ticker,
            name: c.name,
            exchange: c.exchange,
            market: c.market,
            sector: c.sector,
            country: c.country,
            current_price: current,
            event_count: analysis.events.len(),
            spike_score: analysis.spike_score,
            max_spike_pct: analysis.max_spike_pct,
            max_spike_date: analysis.max_spike_date,
            median_base_price: analysis.median_base_price,
            change_12m_pct: analysis.change_12m_pct,
            base_decline_pct: analysis.base_decline_pct,
            confidence: confidence(current, secondary, self.tolerance),
            needs_review: !detect_splits(&bars).is_empty(),
        };
        Ok(Verdict::Matched(Box::new(SpikeFinding { record, events: analysis.events })))
    }
}
