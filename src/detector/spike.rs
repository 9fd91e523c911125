//! Spike detection over a stable base: zones where closes run well above a
//! spike-resistant rolling median, accepted when long and tall enough.

use chrono::{Months, NaiveDate};
use serde::Serialize;

use super::median;
use crate::types::{ranges_overlap, Bar, SpikeEvent};

pub const MIN_BARS: usize = 60;
pub const MIN_WINDOW_BARS: usize = 30;
pub const BASE_WINDOW: usize = 60;
/// Closes above this multiple of the rough median are left out of the base.
pub const OUTLIER_FACTOR: f64 = 2.0;
pub const UPTREND_BONUS: f64 = 1.2;

#[derive(Debug, Clone, Copy)]
pub struct SpikeParams {
    pub threshold_pct: f64,
    pub min_duration_days: usize,
    pub lookback_months: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpikeAnalysis {
    pub events: Vec<SpikeEvent>,
    pub spike_score: f64,
    pub max_spike_pct: f64,
    pub max_spike_date: Option<NaiveDate>,
    pub median_base_price: f64,
    pub change_12m_pct: f64,
    /// Positive when the base fell across the window.
    pub base_decline_pct: f64,
}

#[derive(Debug, Clone)]
struct Zone {
    start: usize,
    end: usize,
    peak_idx: usize,
    peak: f64,
    base: f64,
}

impl Zone {
    fn duration(&self) -> usize {
        self.end - self.start + 1
    }

    fn peak_pct(&self) -> f64 {
        (self.peak - self.base) / self.base * 100.0
    }
}

pub fn analyze(bars: &[Bar], params: &SpikeParams) -> SpikeAnalysis {
    if bars.len() < MIN_BARS || params.threshold_pct <= 0.0 {
        return SpikeAnalysis::default();
    }
    let Some(last) = bars.last() else {
        return SpikeAnalysis::default();
    };
    let cutoff = last
        .date
        .checked_sub_months(Months::new(params.lookback_months))
        .unwrap_or(NaiveDate::MIN);
    let window: Vec<Bar> = bars
        .iter()
        .filter(|b| b.date >= cutoff && b.close > 0.0)
        .copied()
        .collect();
    if window.len() < MIN_WINDOW_BARS {
        return SpikeAnalysis::default();
    }

    let base = rolling_base(&window);
    let zones = detect_zones(&window, &base, params.threshold_pct);
    let min_duration = params.min_duration_days.max(1);

    let mut events: Vec<SpikeEvent> = Vec::new();
    for z in &zones {
        if z.duration() < min_duration || z.peak_pct() < params.threshold_pct {
            continue;
        }
        let event = SpikeEvent {
            start_date: window[z.start].date,
            peak_date: window[z.peak_idx].date,
            end_date: window[z.end].date,
            base_price: z.base,
            peak_price: z.peak,
            spike_pct: z.peak_pct(),
            duration_days: z.duration() as i64,
            valid: true,
        };
        let range = (event.start_date, event.end_date);
        if events.iter().any(|e| ranges_overlap((e.start_date, e.end_date), range)) {
            continue;
        }
        events.push(event);
    }

    let first_base = base.first().copied().unwrap_or(0.0);
    let last_base = base.last().copied().unwrap_or(0.0);

    let mut spike_score: f64 = events
        .iter()
        .map(|e| (e.spike_pct / 100.0) * (e.duration_days as f64 / min_duration as f64))
        .sum();
    if last_base > first_base {
        spike_score *= UPTREND_BONUS;
    }

    let best = events
        .iter()
        .fold(None::<&SpikeEvent>, |acc, e| match acc {
            Some(b) if b.spike_pct >= e.spike_pct => Some(b),
            _ => Some(e),
        });

    let base_decline_pct = if first_base > 0.0 {
        (first_base - last_base) / first_base * 100.0
    } else {
        0.0
    };

    SpikeAnalysis {
        spike_score,
        max_spike_pct: best.map(|e| e.spike_pct).unwrap_or(0.0),
        max_spike_date: best.map(|e| e.peak_date),
        median_base_price: median(&mut base.clone()).unwrap_or(0.0),
        change_12m_pct: change_12m(&window, &zones),
        base_decline_pct,
        events,
    }
}

/// Trailing-window median close per bar, ignoring closes above
/// [`OUTLIER_FACTOR`] × the rough median.
fn rolling_base(bars: &[Bar]) -> Vec<f64> {
    let mut out = Vec::with_capacity(bars.len());
    let mut scratch = Vec::with_capacity(BASE_WINDOW);
    for i in 0..bars.len() {
        let from = (i + 1).saturating_sub(BASE_WINDOW);
        scratch.clear();
        scratch.extend(bars[from..=i].iter().map(|b| b.close));
        let rough = median(&mut scratch).unwrap_or(0.0);
        scratch.retain(|c| *c <= rough * OUTLIER_FACTOR);
        out.push(median(&mut scratch).unwrap_or(rough));
    }
    out
}

fn detect_zones(bars: &[Bar], base: &[f64], threshold_pct: f64) -> Vec<Zone> {
    let entry = 1.0 + threshold_pct / 200.0;
    let hold = 1.0 + threshold_pct / 400.0;

    let mut zones = Vec::new();
    let mut open: Option<Zone> = None;
    for (i, b) in bars.iter().enumerate() {
        let high = if b.high > 0.0 { b.high.max(b.close) } else { b.close };
        match open.as_mut() {
            Some(z) if b.close > z.base * hold => {
                z.end = i;
                if high > z.peak {
                    z.peak = high;
                    z.peak_idx = i;
                }
            }
            Some(_) => {
                zones.extend(open.take());
                if base[i] > 0.0 && b.close >= base[i] * entry {
                    open = Some(Zone { start: i, end: i, peak_idx: i, peak: high, base: base[i] });
                }
            }
            None => {
                if base[i] > 0.0 && b.close >= base[i] * entry {
                    open = Some(Zone { start: i, end: i, peak_idx: i, peak: high, base: base[i] });
                }
            }
        }
    }
    zones.extend(open);
    zones
}

/// Change from the bar twelve months before the last one. When that anchor
/// sits inside a spike zone the zone's pre-spike base stands in for it.
fn change_12m(bars: &[Bar], zones: &[Zone]) -> f64 {
    let Some(last) = bars.last() else { return 0.0 };
    let Some(anchor_date) = last.date.checked_sub_months(Months::new(12)) else {
        return 0.0;
    };
    let Some(idx) = bars.iter().position(|b| b.date >= anchor_date) else {
        return 0.0;
    };
    let anchor = zones
        .iter()
        .find(|z| z.start <= idx && idx <= z.end)
        .map(|z| z.base)
        .unwrap_or(bars[idx].close);
    if anchor <= 0.0 {
        return 0.0;
    }
    (last.close - anchor) / anchor * 100.0
}
