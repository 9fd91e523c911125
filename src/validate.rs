//! Sanity checks on fetched price history before any detector sees it.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::ScanError;
use crate::types::Bar;

/// Share of upstream bars that must survive cleaning.
pub const MIN_USABLE_RATIO: f64 = 0.9;

/// Single-bar price ratios treated as a likely split or reverse split.
pub const SPLIT_RATIOS: [f64; 6] = [2.0, 3.0, 4.0, 5.0, 10.0, 20.0];
pub const SPLIT_TOLERANCE: f64 = 0.03;

/// Bars either side of the jump that must hold the level for it to count.
const SPLIT_CONFIRM_BARS: usize = 5;
const SPLIT_CONFIRM_DRIFT: f64 = 0.15;

fn is_usable(b: &Bar) -> bool {
    let prices = [b.open, b.high, b.low, b.close];
    prices.iter().all(|p| p.is_finite() && *p > 0.0)
        && b.high >= b.low
        && b.volume.is_finite()
        && b.volume >= 0.0
}

/// Sorted, date-unique, positive bars. Fails when too much of the upstream
/// series had to be discarded.
pub fn validate_history(bars: Vec<Bar>) -> Result<Vec<Bar>, ScanError> {
    let total = bars.len();
    if total == 0 {
        return Ok(bars);
    }
    let mut clean: Vec<Bar> = bars.into_iter().filter(is_usable).collect();

    let ratio = clean.len() as f64 / total as f64;
    if ratio < MIN_USABLE_RATIO {
        return Err(ScanError::Validation(format!(
            "{} of {} bars usable ({:.0}%)",
            clean.len(),
            total,
            ratio * 100.0
        )));
    }
    // Stable sort keeps the first copy of a repeated date.
    clean.sort_by_key(|b| b.date);
    clean.dedup_by_key(|b| b.date);
    Ok(clean)
}

/// Calendar days covered by an already-validated series.
pub fn span_days(bars: &[Bar]) -> i64 {
    match (bars.first(), bars.last()) {
        (Some(a), Some(b)) => (b.date - a.date).num_days(),
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitSuspect {
    pub date: NaiveDate,
    /// close / previous close at the jump.
    pub ratio: f64,
}

/// Single-bar jumps close to a common split ratio whose new level then
/// persists. Unadjusted splits look like crashes or spikes to the detectors.
pub fn detect_splits(bars: &[Bar]) -> Vec<SplitSuspect> {
    let mut out = Vec::new();
    for i in 1..bars.len() {
        let prev = bars[i - 1].close;
        let cur = bars[i].close;
        if prev <= 0.0 || cur <= 0.0 {
            continue;
        }
        let ratio = cur / prev;
        let factor = if ratio < 1.0 { 1.0 / ratio } else { ratio };
        let near_split = SPLIT_RATIOS
            .iter()
            .any(|r| ((factor - r) / r).abs() <= SPLIT_TOLERANCE);
        if !near_split {
            continue;
        }
        if holds_level(&bars[i.saturating_sub(SPLIT_CONFIRM_BARS)..i], prev)
            && holds_level(&bars[i..(i + SPLIT_CONFIRM_BARS).min(bars.len())], cur)
        {
            out.push(SplitSuspect { date: bars[i].date, ratio });
        }
    }
    out
}

fn holds_level(bars: &[Bar], level: f64) -> bool {
    !bars.is_empty()
        && bars
            .iter()
            .all(|b| ((b.close - level) / level).abs() <= SPLIT_CONFIRM_DRIFT)
}
