use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A screener row that survived normalization. Re-sourced every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    /// Symbol as the price-history source resolves it (e.g. `SHOP.TO`).
    pub ticker: String,
    /// Symbol as the screener reported it (e.g. `TSX:SHOP`).
    pub raw_symbol: String,
    pub name: String,
    pub exchange: String,
    pub market: String,
    pub close: f64,
    pub high_52w: f64,
    pub low_52w: f64,
    /// Screener all-time high, when the column is populated.
    pub ath: Option<f64>,
    pub sector: Option<String>,
    pub country: Option<String>,
    pub volume: Option<f64>,
    pub avg_volume_30d: Option<f64>,
    pub market_cap: Option<f64>,
    /// Exchange groups / markets that returned this ticker.
    pub sources: Vec<String>,
}

impl Candidate {
    /// 52-week high / low. Zero when the low is unusable.
    pub fn range_ratio(&self) -> f64 {
        if self.low_52w > 0.0 {
            self.high_52w / self.low_52w
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Price history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Derived events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthEvent {
    pub start_date: NaiveDate,
    pub peak_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_price: f64,
    pub peak_price: f64,
    pub growth_pct: f64,
    /// Calendar days from `start_date` to `end_date`.
    pub duration_days: i64,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeEvent {
    pub start_date: NaiveDate,
    pub peak_date: NaiveDate,
    pub end_date: NaiveDate,
    pub base_price: f64,
    pub peak_price: f64,
    pub spike_pct: f64,
    /// Trading bars inside the zone, not calendar days.
    pub duration_days: i64,
    pub valid: bool,
}

/// True when the inclusive date ranges share at least one day.
pub fn ranges_overlap(a: (NaiveDate, NaiveDate), b: (NaiveDate, NaiveDate)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

// ---------------------------------------------------------------------------
// Match records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AthMatch {
    pub ticker: String,
    pub name: String,
    pub exchange: String,
    pub market: String,
    pub sector: Option<String>,
    pub country: Option<String>,
    pub current_price: f64,
    pub ath: f64,
    pub ath_decline_pct: f64,
    pub event_count: usize,
    pub growth_score: u64,
    pub max_growth_pct: f64,
    pub max_growth_date: Option<NaiveDate>,
    pub confidence: u8,
    pub needs_review: bool,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpikeMatch {
    pub ticker: String,
    pub name: String,
    pub exchange: String,
    pub market: String,
    pub sector: Option<String>,
    pub country: Option<String>,
    pub current_price: f64,
    pub event_count: usize,
    pub spike_score: f64,
    pub max_spike_pct: f64,
    pub max_spike_date: Option<NaiveDate>,
    pub median_base_price: f64,
    pub change_12m_pct: f64,
    pub base_decline_pct: f64,
    pub confidence: u8,
    pub needs_review: bool,
}

// ---------------------------------------------------------------------------
// Scan runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Ath,
    Spike,
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanKind::Ath => "ath",
            ScanKind::Spike => "spike",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScanKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ath" => Ok(ScanKind::Ath),
            "spike" => Ok(ScanKind::Spike),
            other => Err(format!("unknown scan kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Partial => "partial",
            ScanStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why the deep-scan phase ended before the candidate list was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No ticker completed within the stall window.
    Stalled,
    /// Wall-clock budget spent.
    BudgetExhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Stalled => "stalled",
            StopReason::BudgetExhausted => "budget_exhausted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounters {
    pub sourced: usize,
    pub prefiltered_out: usize,
    pub queued: usize,
    pub processed: usize,
    pub matched: usize,
    pub rejected: usize,
    pub errors: usize,
}

/// Deep-scan latency percentiles, milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

/// Terminal state of one run, as written to `scan_runs`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub kind: ScanKind,
    pub status: ScanStatus,
    pub counters: ScanCounters,
    pub errors: Vec<String>,
    pub stop_reason: Option<StopReason>,
    /// Set only when the run failed at orchestration level.
    pub failure: Option<String>,
    pub latency: LatencySummary,
    pub elapsed_ms: u64,
}

/// What happened to one candidate in the deep-scan phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailOutcome {
    Matched,
    Rejected,
    Error,
}

impl std::fmt::Display for DetailOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DetailOutcome::Matched => "matched",
            DetailOutcome::Rejected => "rejected",
            DetailOutcome::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailEntry {
    pub ticker: String,
    pub outcome: DetailOutcome,
    /// Rejection reason or error message; summary for matches.
    pub reason: String,
    pub elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Business rejections, not errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    NoData,
    ShortHistory { days: i64 },
    DeclineOutOfBand { decline_pct: f64 },
    TooFewEvents { found: usize, required: usize },
    NoSpike,
    BaseDeclined { decline_pct: f64 },
    LowScore { score: f64 },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::NoData => write!(f, "no_data"),
            Rejection::ShortHistory { days } => write!(f, "short_history: {days}d"),
            Rejection::DeclineOutOfBand { decline_pct } => {
                write!(f, "decline_out_of_band: {decline_pct:.1}%")
            }
            Rejection::TooFewEvents { found, required } => {
                write!(f, "too_few_events: {found}/{required}")
            }
            Rejection::NoSpike => write!(f, "no_spike"),
            Rejection::BaseDeclined { decline_pct } => write!(f, "base_declined: {decline_pct:.1}%"),
            Rejection::LowScore { score } => write!(f, "low_score: {score:.2}"),
        }
    }
}

/// Result of a rotation-tracked scan attempt, stored on `scan_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryResult {
    Match,
    Rejected,
    Error,
}

impl std::fmt::Display for HistoryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HistoryResult::Match => "match",
            HistoryResult::Rejected => "rejected",
            HistoryResult::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn overlap_is_inclusive() {
        assert!(ranges_overlap((d(2020, 1, 1), d(2020, 1, 10)), (d(2020, 1, 10), d(2020, 2, 1))));
        assert!(!ranges_overlap((d(2020, 1, 1), d(2020, 1, 9)), (d(2020, 1, 10), d(2020, 2, 1))));
    }

    #[test]
    fn scan_kind_parses_case_insensitively() {
        assert_eq!("ATH".parse::<ScanKind>(), Ok(ScanKind::Ath));
        assert_eq!(" spike ".parse::<ScanKind>(), Ok(ScanKind::Spike));
        assert!("both".parse::<ScanKind>().is_err());
    }
}
