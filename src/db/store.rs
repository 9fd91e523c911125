use std::collections::HashMap;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::models::{ScanDetailRow, ScanHistoryRow, ScanRunRow};
use crate::config::{ERROR_LOG_MAX_ROWS, MAX_DETAILS_PER_RUN};
use crate::error::Result;
use crate::types::{
    AthMatch, DetailEntry, GrowthEvent, HistoryResult, RunSummary, ScanCounters, ScanKind,
    ScanStatus, SpikeEvent, SpikeMatch,
};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Every write the scanner makes goes through here. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready at {db_path}");
        Ok(Self { pool })
    }

    /// Single-connection in-memory database with the schema applied.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    pub async fn create_run(&self, kind: ScanKind) -> Result<i64> {
        let res = sqlx::query("INSERT INTO scan_runs (kind, status, started_at) VALUES (?, ?, ?)")
            .bind(kind.to_string())
            .bind(ScanStatus::Running.to_string())
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(res.last_insert_rowid())
    }

    /// Append detail rows starting at `first_seq`. Rows past
    /// [`MAX_DETAILS_PER_RUN`] are dropped; returns how many were written.
    pub async fn append_details(&self, run_id: i64, first_seq: usize, entries: &[DetailEntry]) -> Result<usize> {
        let room = MAX_DETAILS_PER_RUN.saturating_sub(first_seq);
        let take = entries.len().min(room);
        if take == 0 {
            return Ok(0);
        }
        let recorded_at = now_ms();
        let mut tx = self.pool.begin().await?;
        for (i, e) in entries[..take].iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO scan_details (run_id, seq, ticker, outcome, reason, elapsed_ms, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind((first_seq + i) as i64)
            .bind(&e.ticker)
            .bind(e.outcome.to_string())
            .bind(&e.reason)
            .bind(e.elapsed_ms as i64)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE scan_runs SET detail_count = ? WHERE id = ?")
            .bind((first_seq + take) as i64)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(take)
    }

    /// Progress snapshot while the run is still `running`.
    pub async fn checkpoint(&self, run_id: i64, counters: &ScanCounters, errors: &[String]) -> Result<()> {
        let error_list = serde_json::to_string(errors)?;
        sqlx::query(
            r#"
            UPDATE scan_runs
            SET sourced = ?, prefiltered_out = ?, queued = ?, processed = ?,
                matched = ?, rejected = ?, errors = ?, error_list = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(counters.sourced as i64)
        .bind(counters.prefiltered_out as i64)
        .bind(counters.queued as i64)
        .bind(counters.processed as i64)
        .bind(counters.matched as i64)
        .bind(counters.rejected as i64)
        .bind(counters.errors as i64)
        .bind(error_list)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_run(&self, summary: &RunSummary) -> Result<()> {
        let error_list = serde_json::to_string(&summary.errors)?;
        let c = &summary.counters;
        sqlx::query(
            r#"
            UPDATE scan_runs
            SET status = ?, finished_at = ?,
                sourced = ?, prefiltered_out = ?, queued = ?, processed = ?,
                matched = ?, rejected = ?, errors = ?, error_list = ?,
                stop_reason = ?, failure = ?,
                latency_p50_ms = ?, latency_p95_ms = ?, latency_p99_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(summary.status.to_string())
        .bind(now_ms())
        .bind(c.sourced as i64)
        .bind(c.prefiltered_out as i64)
        .bind(c.queued as i64)
        .bind(c.processed as i64)
        .bind(c.matched as i64)
        .bind(c.rejected as i64)
        .bind(c.errors as i64)
        .bind(error_list)
        .bind(summary.stop_reason.map(|r| r.to_string()))
        .bind(summary.failure.as_deref())
        .bind(summary.latency.p50_ms.map(|v| v as i64))
        .bind(summary.latency.p95_ms.map(|v| v as i64))
        .bind(summary.latency.p99_ms.map(|v| v as i64))
        .bind(summary.run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close runs a crashed process left `running`.
    pub async fn recover_stale_runs(&self) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE scan_runs SET status = 'failed', failure = 'interrupted', finished_at = ? WHERE status = 'running'",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        let n = res.rows_affected();
        if n > 0 {
            warn!("[STORE] closed {n} interrupted run(s) as failed");
        }
        Ok(n)
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<ScanRunRow>> {
        let row = sqlx::query_as::<_, ScanRunRow>("SELECT * FROM scan_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_runs(&self, kind: Option<ScanKind>, limit: i64) -> Result<Vec<ScanRunRow>> {
        let rows = sqlx::query_as::<_, ScanRunRow>(
            r#"
            SELECT * FROM scan_runs
            WHERE ?1 IS NULL OR kind = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(kind.map(|k| k.to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn details_after(&self, run_id: i64, after_seq: i64, limit: i64) -> Result<Vec<ScanDetailRow>> {
        let rows = sqlx::query_as::<_, ScanDetailRow>(
            r#"
            SELECT seq, ticker, outcome, reason, elapsed_ms, recorded_at
            FROM scan_details
            WHERE run_id = ? AND seq > ?
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(run_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Matches: parent upsert and full child replace in one transaction
    // -----------------------------------------------------------------------

    pub async fn upsert_ath_match(&self, run_id: i64, m: &AthMatch, events: &[GrowthEvent]) -> Result<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO ath_matches (
                ticker, name, exchange, market, sector, country,
                current_price, ath, ath_decline_pct, event_count, growth_score,
                max_growth_pct, max_growth_date, confidence, sources, needs_review,
                first_seen_at, last_seen_at, last_run_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (ticker) DO UPDATE SET
                name = excluded.name,
                exchange = excluded.exchange,
                market = excluded.market,
                sector = excluded.sector,
                country = excluded.country,
                current_price = excluded.current_price,
                ath = excluded.ath,
                ath_decline_pct = excluded.ath_decline_pct,
                event_count = excluded.event_count,
                growth_score = excluded.growth_score,
                max_growth_pct = excluded.max_growth_pct,
                max_growth_date = excluded.max_growth_date,
                confidence = excluded.confidence,
                sources = excluded.sources,
                needs_review = MAX(ath_matches.needs_review, excluded.needs_review),
                last_seen_at = excluded.last_seen_at,
                last_run_id = excluded.last_run_id
            "#,
        )
        .bind(&m.ticker)
        .bind(&m.name)
        .bind(&m.exchange)
        .bind(&m.market)
        .bind(m.sector.as_deref())
        .bind(m.country.as_deref())
        .bind(m.current_price)
        .bind(m.ath)
        .bind(m.ath_decline_pct)
        .bind(m.event_count as i64)
        .bind(m.growth_score as i64)
        .bind(m.max_growth_pct)
        .bind(m.max_growth_date.map(|d| d.to_string()))
        .bind(i64::from(m.confidence))
        .bind(m.sources.join(","))
        .bind(m.needs_review)
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM growth_events WHERE ticker = ?")
            .bind(&m.ticker)
            .execute(&mut *tx)
            .await?;
        for e in events {
            sqlx::query(
                r#"
                INSERT INTO growth_events (
                    ticker, start_date, peak_date, end_date,
                    start_price, peak_price, growth_pct, duration_days, valid
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&m.ticker)
            .bind(e.start_date.to_string())
            .bind(e.peak_date.to_string())
            .bind(e.end_date.to_string())
            .bind(e.start_price)
            .bind(e.peak_price)
            .bind(e.growth_pct)
            .bind(e.duration_days)
            .bind(e.valid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_spike_match(&self, run_id: i64, m: &SpikeMatch, events: &[SpikeEvent]) -> Result<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO spike_matches (
                ticker, name, exchange, market, sector, country,
                current_price, event_count, spike_score, max_spike_pct, max_spike_date,
                median_base_price, change_12m_pct, base_decline_pct, confidence, needs_review,
                first_seen_at, last_seen_at, last_run_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (ticker) DO UPDATE SET
                name = excluded.name,
                exchange = excluded.exchange,
                market = excluded.market,
                sector = excluded.sector,
                country = excluded.country,
                current_price = excluded.current_price,
                event_count = excluded.event_count,
                spike_score = excluded.spike_score,
                max_spike_pct = excluded.max_spike_pct,
                max_spike_date = excluded.max_spike_date,
                median_base_price = excluded.median_base_price,
                change_12m_pct = excluded.change_12m_pct,
                base_decline_pct = excluded.base_decline_pct,
                confidence = excluded.confidence,
                needs_review = MAX(spike_matches.needs_review, excluded.needs_review),
                last_seen_at = excluded.last_seen_at,
                last_run_id = excluded.last_run_id
            "#,
        )
        .bind(&m.ticker)
        .bind(&m.name)
        .bind(&m.exchange)
        .bind(&m.market)
        .bind(m.sector.as_deref())
        .bind(m.country.as_deref())
        .bind(m.current_price)
        .bind(m.event_count as i64)
        .bind(m.spike_score)
        .bind(m.max_spike_pct)
        .bind(m.max_spike_date.map(|d| d.to_string()))
        .bind(m.median_base_price)
        .bind(m.change_12m_pct)
        .bind(m.base_decline_pct)
        .bind(i64::from(m.confidence))
        .bind(m.needs_review)
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM spike_events WHERE ticker = ?")
            .bind(&m.ticker)
            .execute(&mut *tx)
            .await?;
        for e in events {
            sqlx::query(
                r#"
                INSERT INTO spike_events (
                    ticker, start_date, peak_date, end_date,
                    base_price, peak_price, spike_pct, duration_days, valid
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&m.ticker)
            .bind(e.start_date.to_string())
            .bind(e.peak_date.to_string())
            .bind(e.end_date.to_string())
            .bind(e.base_price)
            .bind(e.peak_price)
            .bind(e.spike_pct)
            .bind(e.duration_days)
            .bind(e.valid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rotation
    // -----------------------------------------------------------------------

    pub async fn load_scan_history(&self) -> Result<HashMap<String, ScanHistoryRow>> {
        let rows = sqlx::query_as::<_, ScanHistoryRow>(
            "SELECT ticker, last_scanned_at, scan_count, last_result FROM scan_history",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| (r.ticker.clone(), r)).collect())
    }

    pub async fn upsert_scan_history(&self, ticker: &str, result: HistoryResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_history (ticker, last_scanned_at, scan_count, last_result)
            VALUES (?, ?, 1, ?)
            ON CONFLICT (ticker) DO UPDATE SET
                last_scanned_at = excluded.last_scanned_at,
                scan_count = scan_history.scan_count + 1,
                last_result = excluded.last_result
            "#,
        )
        .bind(ticker)
        .bind(now_ms())
        .bind(result.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Error log and settings
    // -----------------------------------------------------------------------

    pub async fn log_error(
        &self,
        run_id: Option<i64>,
        scope: &str,
        ticker: Option<&str>,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO error_log (run_id, scope, ticker, kind, message, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(scope)
        .bind(ticker)
        .bind(kind)
        .bind(message)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM error_log WHERE id NOT IN (SELECT id FROM error_log ORDER BY id DESC LIMIT ?)",
        )
        .bind(ERROR_LOG_MAX_ROWS)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_settings(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    #[cfg(test)]
    pub async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetailOutcome, LatencySummary, StopReason};
    use chrono::NaiveDate;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, day).unwrap()
    }

    fn growth_event(day: u32) -> GrowthEvent {
        GrowthEvent {
            start_date: d(day),
            peak_date: d(day + 1),
            end_date: d(day + 2),
            start_price: 1.0,
            peak_price: 3.5,
            growth_pct: 250.0,
            duration_days: 2,
            valid: true,
        }
    }

    fn ath_match(needs_review: bool) -> AthMatch {
        AthMatch {
            ticker: "ABC.TO".to_string(),
            name: "Abc Mining".to_string(),
            exchange: "TSX".to_string(),
            market: "canada".to_string(),
            sector: Some("Non-Energy Minerals".to_string()),
            country: Some("Canada".to_string()),
            current_price: 0.5,
            ath: 10.0,
            ath_decline_pct: 95.0,
            event_count: 2,
            growth_score: 3,
            max_growth_pct: 250.0,
            max_growth_date: Some(d(2)),
            confidence: 100,
            needs_review,
            sources: vec!["canada".to_string()],
        }
    }

    async fn count(store: &Store, sql: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(sql).fetch_one(store.pool()).await.unwrap()
    }

    #[tokio::test]
    async fn events_are_fully_replaced_and_flags_survive() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_ath_match(1, &ath_match(true), &[growth_event(1), growth_event(10)])
            .await
            .unwrap();
        sqlx::query("UPDATE ath_matches SET archived = 1, reviewed = 1 WHERE ticker = 'ABC.TO'")
            .execute(store.pool())
            .await
            .unwrap();

        store.upsert_ath_match(2, &ath_match(false), &[growth_event(20)]).await.unwrap();

        assert_eq!(count(&store, "SELECT COUNT(*) FROM ath_matches").await, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM growth_events").await, 1);
        let (needs_review, reviewed, archived, deleted): (bool, bool, bool, bool) = sqlx::query_as(
            "SELECT needs_review, reviewed, archived, deleted FROM ath_matches WHERE ticker = 'ABC.TO'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert!(needs_review && reviewed && archived && !deleted);
        assert_eq!(count(&store, "SELECT last_run_id FROM ath_matches").await, 2);
    }

    #[tokio::test]
    async fn details_are_capped_and_polled_incrementally() {
        let store = Store::in_memory().await.unwrap();
        let run = store.create_run(ScanKind::Spike).await.unwrap();
        let entry = |t: &str| DetailEntry {
            ticker: t.to_string(),
            outcome: DetailOutcome::Rejected,
            reason: "no_spike".to_string(),
            elapsed_ms: 12,
        };

        assert_eq!(store.append_details(run, 0, &[entry("A"), entry("B")]).await.unwrap(), 2);
        let after = store.details_after(run, 0, 100).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].ticker, "B");

        let near_cap = MAX_DETAILS_PER_RUN - 1;
        assert_eq!(store.append_details(run, near_cap, &[entry("C"), entry("D")]).await.unwrap(), 1);
        assert_eq!(store.append_details(run, MAX_DETAILS_PER_RUN, &[entry("E")]).await.unwrap(), 0);
        let row = store.get_run(run).await.unwrap().unwrap();
        assert_eq!(row.detail_count, MAX_DETAILS_PER_RUN as i64);
    }

    #[tokio::test]
    async fn finish_and_recover_runs() {
        let store = Store::in_memory().await.unwrap();
        let done = store.create_run(ScanKind::Ath).await.unwrap();
        let stale = store.create_run(ScanKind::Ath).await.unwrap();

        let summary = RunSummary {
            run_id: done,
            kind: ScanKind::Ath,
            status: ScanStatus::Partial,
            counters: ScanCounters { processed: 4, errors: 1, ..Default::default() },
            errors: vec!["XYZ: timed out after 45s".to_string()],
            stop_reason: Some(StopReason::Stalled),
            failure: None,
            latency: LatencySummary { p50_ms: Some(120), p95_ms: Some(900), p99_ms: Some(900) },
            elapsed_ms: 5_000,
        };
        store.finish_run(&summary).await.unwrap();
        assert_eq!(store.recover_stale_runs().await.unwrap(), 1);

        let row = store.get_run(done).await.unwrap().unwrap();
        assert_eq!(row.status, "partial");
        assert_eq!(row.stop_reason.as_deref(), Some("stalled"));
        assert_eq!(row.latency_p95_ms, Some(900));
        let errors: Vec<String> = serde_json::from_str(&row.error_list).unwrap();
        assert_eq!(errors.len(), 1);

        let row = store.get_run(stale).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.failure.as_deref(), Some("interrupted"));

        let listed = store.list_runs(Some(ScanKind::Ath), 10).await.unwrap();
        assert_eq!(listed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![stale, done]);
        assert!(store.list_runs(Some(ScanKind::Spike), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_history_counts_attempts() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_scan_history("AAA", HistoryResult::Rejected).await.unwrap();
        store.upsert_scan_history("AAA", HistoryResult::Match).await.unwrap();
        store.upsert_scan_history("BBB", HistoryResult::Error).await.unwrap();

        let history = store.load_scan_history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history["AAA"].scan_count, 2);
        assert_eq!(history["AAA"].last_result, "match");
        assert_eq!(history["BBB"].last_result, "error");
    }

    #[tokio::test]
    async fn error_log_is_bounded() {
        let store = Store::in_memory().await.unwrap();
        for i in 0..(ERROR_LOG_MAX_ROWS + 5) {
            store
                .log_error(Some(1), "ticker", Some("T"), "transport", &format!("e{i}"))
                .await
                .unwrap();
        }
        assert_eq!(count(&store, "SELECT COUNT(*) FROM error_log").await, ERROR_LOG_MAX_ROWS);
        let oldest: String = sqlx::query_scalar("SELECT message FROM error_log ORDER BY id LIMIT 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(oldest, "e5");
    }

    #[tokio::test]
    async fn settings_round_trip_through_rows() {
        let store = Store::in_memory().await.unwrap();
        store.put_setting("spike.threshold_pct", "90").await.unwrap();
        let rows = store.load_settings().await.unwrap();
        assert_eq!(rows, vec![("spike.threshold_pct".to_string(), "90".to_string())]);
    }
}
