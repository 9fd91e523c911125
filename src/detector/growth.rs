//! Crash-and-recovery detection: troughs followed by gains of at least the
//! configured threshold, counted as non-overlapping growth events.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;

use crate::types::{ranges_overlap, Bar, GrowthEvent};

/// Shorter histories are not analyzed.
pub const MIN_BARS: usize = 10;

/// Half-width of the local-minimum window.
pub const TROUGH_WINDOW: usize = 7;

/// Relative slack when comparing a close against the recovery target.
const TARGET_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct GrowthParams {
    pub threshold_pct: f64,
    /// Capped at 2 when applied; days at target need not be consecutive.
    pub min_consecutive_days: usize,
    /// Informational. The whole history is scanned.
    pub lookback_years: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GrowthAnalysis {
    pub events: Vec<GrowthEvent>,
    pub score: u64,
    pub max_growth_pct: f64,
    pub max_growth_date: Option<NaiveDate>,
}

/// `n(n+1)/2`.
pub fn triangular_score(n: usize) -> u64 {
    let n = n as u64;
    n * (n + 1) / 2
}

pub fn analyze(bars: &[Bar], params: &GrowthParams) -> GrowthAnalysis {
    if bars.len() < MIN_BARS || params.threshold_pct <= 0.0 {
        return GrowthAnalysis::default();
    }
    let required_days = params.min_consecutive_days.clamp(1, 2);

    let mut events: Vec<GrowthEvent> = Vec::new();
    for t in trough_candidates(bars) {
        let date = bars[t].date;
        if events.iter().any(|e| e.start_date <= date && date <= e.end_date) {
            continue;
        }
        let Some(event) = scan_from_trough(bars, t, params.threshold_pct, required_days) else {
            continue;
        };
        let range = (event.start_date, event.end_date);
        if events.iter().any(|e| ranges_overlap((e.start_date, e.end_date), range)) {
            continue;
        }
        events.push(event);
    }

    let best = events
        .iter()
        .fold(None::<&GrowthEvent>, |acc, e| match acc {
            Some(b) if b.growth_pct >= e.growth_pct => Some(b),
            _ => Some(e),
        });

    GrowthAnalysis {
        score: triangular_score(events.len()),
        max_growth_pct: best.map(|e| e.growth_pct).unwrap_or(0.0),
        max_growth_date: best.map(|e| e.peak_date),
        events,
    }
}

/// Index 0, the global minimum, local minima within ±[`TROUGH_WINDOW`], and
/// every bar whose low falls under half the running peak since the last such
/// bar. Ascending, deduplicated.
fn trough_candidates(bars: &[Bar]) -> Vec<usize> {
    let n = bars.len();
    let mut out = BTreeSet::new();
    out.insert(0);

    let mut global: Option<usize> = None;
    for (i, b) in bars.iter().enumerate() {
        if b.low > 0.0 && global.map_or(true, |g| b.low < bars[g].low) {
            global = Some(i);
        }
    }
    if let Some(g) = global {
        out.insert(g);
    }

    for i in 0..n {
        let low = bars[i].low;
        if low <= 0.0 {
            continue;
        }
        let lo = i.saturating_sub(TROUGH_WINDOW);
        let hi = (i + TROUGH_WINDOW).min(n - 1);
        // Ties resolve to the first bar of a flat stretch.
        let earlier_ok = bars[lo..i].iter().all(|b| b.low <= 0.0 || b.low > low);
        let later_ok = bars[i + 1..=hi].iter().all(|b| b.low <= 0.0 || b.low >= low);
        if earlier_ok && later_ok {
            out.insert(i);
        }
    }

    let mut running_peak = 0.0_f64;
    for (i, b) in bars.iter().enumerate() {
        if b.low > 0.0 && b.low < running_peak / 2.0 {
            out.insert(i);
            running_peak = b.high.max(0.0);
            continue;
        }
        if b.high > running_peak {
            running_peak = b.high;
        }
    }

    out.into_iter().collect()
}

fn scan_from_trough(bars: &[Bar], t: usize, threshold_pct: f64, required_days: usize) -> Option<GrowthEvent> {
    let trough = bars[t].low;
    if trough <= 0.0 {
        return None;
    }
    let target = trough * (1.0 + threshold_pct / 100.0);
    let at_target = |close: f64| close >= target * (1.0 - TARGET_EPSILON);
    let floor = trough / 2.0;

    let mut days = 0usize;
    let mut accepted = None;
    for (j, b) in bars.iter().enumerate().skip(t + 1) {
        if b.close <= 0.0 {
            continue;
        }
        // Below half the trough belongs to a later, deeper trough.
        if b.close < floor {
            return None;
        }
        if at_target(b.close) {
            days += 1;
            if days >= required_days {
                accepted = Some(j);
                break;
            }
        }
    }

    let mut end = accepted?;
    for (j, b) in bars.iter().enumerate().skip(end + 1) {
        if b.close <= 0.0 {
            continue;
        }
        if !at_target(b.close) {
            break;
        }
        end = j;
    }

    let mut peak_idx = t;
    let mut peak = 0.0_f64;
    for (j, b) in bars.iter().enumerate().take(end + 1).skip(t) {
        if b.high > peak {
            peak = b.high;
            peak_idx = j;
        }
    }
    if peak <= 0.0 {
        return None;
    }

    Some(GrowthEvent {
        start_date: bars[t].date,
        peak_date: bars[peak_idx].date,
        end_date: bars[end].date,
        start_price: trough,
        peak_price: peak,
        growth_pct: (peak - trough) / trough * 100.0,
        duration_days: (bars[end].date - bars[t].date).num_days(),
        valid: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2015, 1, 1).unwrap()
    }

    fn bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            date: start() + Days::new(i as u64),
            open,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    fn flat(i: usize, price: f64) -> Bar {
        bar(i, price, price, price, price)
    }

    fn params(threshold_pct: f64, min_consecutive_days: usize) -> GrowthParams {
        GrowthParams { threshold_pct, min_consecutive_days, lookback_years: 10 }
    }

    /// `n` separate V-shapes: 8 → 5 → back to 10 for three bars → 8.
    fn v_series(n: usize) -> Vec<Bar> {
        let mut prices: Vec<f64> = vec![8.0; 20];
        for _ in 0..n {
            prices.extend([5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 10.0, 10.0]);
            prices.extend([8.0; 20]);
        }
        prices.iter().enumerate().map(|(i, &p)| flat(i, p)).collect()
    }

    #[test]
    fn short_history_is_empty() {
        let bars: Vec<Bar> = (0..9).map(|i| flat(i, 1.0 + i as f64)).collect();
        let out = analyze(&bars, &params(50.0, 2));
        assert!(out.events.is_empty());
        assert_eq!(out.score, 0);
    }

    #[test]
    fn triangular_scoring_for_zero_to_five_events() {
        for n in 0..=5 {
            let out = analyze(&v_series(n), &params(100.0, 3));
            assert_eq!(out.events.len(), n, "n={n}");
            assert_eq!(out.score, (n * (n + 1) / 2) as u64, "n={n}");
        }
    }

    #[test]
    fn monotonic_rise_below_threshold_has_no_events() {
        let bars: Vec<Bar> = (0..200).map(|i| flat(i, 10.0 + i as f64 * 0.025)).collect();
        let out = analyze(&bars, &params(200.0, 5));
        assert!(out.events.is_empty());
        assert_eq!(out.score, 0);
    }

    #[test]
    fn v_shape_gives_one_event_at_threshold() {
        let out = analyze(&v_series(1), &params(100.0, 5));
        assert_eq!(out.events.len(), 1);
        let e = &out.events[0];
        assert!((e.growth_pct - 100.0).abs() < 1e-6, "growth={}", e.growth_pct);
        assert!((e.start_price - 5.0).abs() < 1e-12);
        assert_eq!(e.start_date, start() + Days::new(20));
        assert_eq!(e.end_date, start() + Days::new(27));
        assert!(e.valid);
    }

    #[test]
    fn duration_counts_calendar_days_not_bars() {
        let bars: Vec<Bar> = v_series(1)
            .into_iter()
            .enumerate()
            .map(|(i, b)| Bar { date: start() + Days::new(2 * i as u64), ..b })
            .collect();
        let out = analyze(&bars, &params(100.0, 5));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].duration_days, 14);
    }

    #[test]
    fn single_bar_at_target_is_not_enough() {
        let mut prices = vec![8.0; 20];
        prices.extend([5.0, 7.0, 10.0, 8.0]);
        prices.extend([8.0; 20]);
        let bars: Vec<Bar> = prices.iter().enumerate().map(|(i, &p)| flat(i, p)).collect();
        assert!(analyze(&bars, &params(100.0, 5)).events.is_empty());
        // With a one-day requirement the same recovery counts.
        assert_eq!(analyze(&bars, &params(100.0, 1)).events.len(), 1);
    }

    #[test]
    fn collapse_below_half_trough_hands_over_to_deeper_trough() {
        // 8 → 3 → 1.5 (half of 3) → 4 sustained.
        let mut prices = vec![8.0; 20];
        prices.extend([4.0, 3.0, 1.5, 2.0, 3.0, 4.0, 4.0, 4.0]);
        prices.extend([3.5; 20]);
        let bars: Vec<Bar> = prices.iter().enumerate().map(|(i, &p)| flat(i, p)).collect();
        let out = analyze(&bars, &params(100.0, 2));
        assert_eq!(out.events.len(), 1);
        assert!((out.events[0].start_price - 1.5).abs() < 1e-12);
    }

    #[test]
    fn non_positive_prices_are_ignored() {
        let mut bars = v_series(1);
        bars[5] = flat(5, 0.0);
        bars[24] = bar(24, 0.0, 0.0, 0.0, 0.0);
        let out = analyze(&bars, &params(100.0, 2));
        assert_eq!(out.events.len(), 1);
        assert!(out.events[0].start_price > 0.0);
    }

    #[test]
    fn analysis_is_deterministic() {
        let bars = v_series(3);
        let p = params(100.0, 2);
        assert_eq!(analyze(&bars, &p), analyze(&bars, &p));
    }

    #[test]
    fn end_to_end_crash_and_recovery() {
        let mut bars = Vec::with_capacity(1000);
        for i in 0..10 {
            let c = 2.0 - i as f64 * 0.1;
            bars.push(bar(i, c, c + 0.01, c - 0.01, c));
        }
        bars.push(bar(10, 1.05, 1.1, 1.0, 1.05));
        for i in 11..37 {
            let c = 1.1 + (i - 11) as f64 * (1.8 / 25.0);
            bars.push(bar(i, c, c + 0.01, c - 0.01, c));
        }
        for i in 37..43 {
            let high = if i == 40 { 3.5 } else { 3.25 };
            bars.push(bar(i, 3.15, high, 3.1, 3.2));
        }
        for i in 43..1000 {
            bars.push(bar(i, 2.0, 2.01, 1.99, 2.0));
        }

        let out = analyze(&bars, &params(200.0, 5));
        assert_eq!(out.events.len(), 1);
        let e = &out.events[0];
        assert!((e.growth_pct - 250.0).abs() < 1e-6, "growth={}", e.growth_pct);
        assert_eq!(e.start_date, start() + Days::new(10));
        assert_eq!(e.peak_date, start() + Days::new(40));
        assert_eq!(out.score, 1);
        assert_eq!(out.max_growth_date, Some(start() + Days::new(40)));
    }
}
