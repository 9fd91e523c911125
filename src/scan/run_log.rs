//! Run-scoped bookkeeping: counters, the bounded error list, pending detail
//! rows and the latency histogram. Owned by the orchestrating flow only.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::api::latency::LatencyStats;
use crate::config::{CHECKPOINT_EVERY, MAX_RUN_ERRORS};
use crate::db::Store;
use crate::error::{AppError, Result, ScanError};
use crate::types::{
    DetailEntry, DetailOutcome, Rejection, RunSummary, ScanCounters, ScanKind, ScanStatus, StopReason,
};

pub struct RunLog {
    run_id: i64,
    kind: ScanKind,
    store: Store,
    pub counters: ScanCounters,
    errors: Vec<String>,
    pending_details: Vec<DetailEntry>,
    pending_errors: Vec<(String, ScanError)>,
    next_seq: usize,
    since_checkpoint: usize,
    latency: LatencyStats,
    started: Instant,
}

impl RunLog {
    pub fn new(run_id: i64, kind: ScanKind, store: Store) -> Self {
        Self {
            run_id,
            kind,
            store,
            counters: ScanCounters::default(),
            errors: Vec::new(),
            pending_details: Vec::new(),
            pending_errors: Vec::new(),
            next_seq: 0,
            since_checkpoint: 0,
            latency: LatencyStats::new(),
            started: Instant::now(),
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    fn push(&mut self, ticker: &str, outcome: DetailOutcome, reason: String, elapsed: Duration) {
        self.counters.processed += 1;
        self.since_checkpoint += 1;
        self.latency.record(elapsed);
        self.pending_details.push(DetailEntry {
            ticker: ticker.to_string(),
            outcome,
            reason,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn matched(&mut self, ticker: &str, summary: String, elapsed: Duration) {
        self.counters.matched += 1;
        self.push(ticker, DetailOutcome::Matched, summary, elapsed);
    }

    pub fn rejected(&mut self, ticker: &str, why: &Rejection, elapsed: Duration) {
        self.counters.rejected += 1;
        self.push(ticker, DetailOutcome::Rejected, why.to_string(), elapsed);
    }

    pub fn errored(&mut self, ticker: &str, err: &ScanError, elapsed: Duration) {
        self.counters.errors += 1;
        self.note_error(format!("{ticker}: {err}"));
        self.pending_errors.push((ticker.to_string(), err.clone()));
        self.push(ticker, DetailOutcome::Error, err.to_string(), elapsed);
    }

    /// Oldest entries are kept; later ones are dropped once the list is full.
    pub fn note_error(&mut self, message: String) {
        if self.errors.len() < MAX_RUN_ERRORS {
            self.errors.push(message);
        }
    }

    pub fn checkpoint_due(&self) -> bool {
        self.since_checkpoint >= CHECKPOINT_EVERY
    }

    /// Flush pending detail rows and error-log entries, then snapshot counters.
    pub async fn checkpoint(&mut self) -> Result<()> {
        if !self.pending_details.is_empty() {
            self.store
                .append_details(self.run_id, self.next_seq, &self.pending_details)
                .await?;
            self.next_seq += self.pending_details.len();
            self.pending_details.clear();
        }
        for (ticker, err) in std::mem::take(&mut self.pending_errors) {
            self.store
                .log_error(Some(self.run_id), "ticker", Some(&ticker), err.kind(), &err.to_string())
                .await?;
        }
        self.store.checkpoint(self.run_id, &self.counters, &self.errors).await?;
        self.since_checkpoint = 0;
        Ok(())
    }

    fn summary(&self, status: ScanStatus, stop_reason: Option<StopReason>, failure: Option<String>) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            kind: self.kind,
            status,
            counters: self.counters.clone(),
            errors: self.errors.clone(),
            stop_reason,
            failure,
            latency: self.latency.summary(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// `partial` after any per-ticker error or an early stop, else `completed`.
    pub async fn finish(mut self, stop_reason: Option<StopReason>) -> RunSummary {
        let status = if stop_reason.is_some() || self.counters.errors > 0 {
            ScanStatus::Partial
        } else {
            ScanStatus::Completed
        };
        if let Err(e) = self.checkpoint().await {
            return self.fail(e).await;
        }
        let summary = self.summary(status, stop_reason, None);
        if let Err(e) = self.store.finish_run(&summary).await {
            return self.fail(e).await;
        }

        let c = &summary.counters;
        info!(
            run_id = self.run_id,
            kind = %self.kind,
            status = %status,
            "[SCAN] done in {:.1}s | sourced={} prefiltered={} queued={} processed={} matched={} rejected={} errors={} | stop={} | p50={:?}ms p95={:?}ms p99={:?}ms",
            summary.elapsed_ms as f64 / 1000.0,
            c.sourced,
            c.prefiltered_out,
            c.queued,
            c.processed,
            c.matched,
            c.rejected,
            c.errors,
            stop_reason.map(|r| r.to_string()).unwrap_or_else(|| "none".to_string()),
            summary.latency.p50_ms,
            summary.latency.p95_ms,
            summary.latency.p99_ms,
        );
        summary
    }

    /// Orchestration-level failure. Recording it is best effort.
    pub async fn fail(mut self, err: AppError) -> RunSummary {
        let message = err.to_string();
        error!(run_id = self.run_id, kind = %self.kind, "[SCAN] run failed: {message}");
        self.note_error(message.clone());
        let summary = self.summary(ScanStatus::Failed, None, Some(message.clone()));

        if let Err(e) = self
            .store
            .log_error(Some(self.run_id), "run", None, "infrastructure", &message)
            .await
        {
            warn!(run_id = self.run_id, "[SCAN] could not write error log: {e}");
        }
        if let Err(e) = self.store.finish_run(&summary).await {
            error!(run_id = self.run_id, "[SCAN] could not record failed status: {e}");
        }
        summary
    }
}
