//! Network-free candidate filters run before any history is fetched.

use crate::config::{AthSettings, SpikeSettings};
use crate::types::Candidate;

/// Name fragments of leveraged and inverse products.
const LEVERAGED_TOKENS: &[&str] = &["2X", "3X", "ULTRA", "BULL", "BEAR", "INVERSE", "LEVERAGED", "-1X"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefilterReason {
    Exchange,
    Leveraged,
    Sector,
    Country,
    NonPositivePrice,
    DeclineBand,
}

#[derive(Debug, Default)]
pub struct PrefilterStats {
    pub exchange: usize,
    pub leveraged: usize,
    pub sector: usize,
    pub country: usize,
    pub non_positive_price: usize,
    pub decline_band: usize,
}

impl PrefilterStats {
    fn count(&mut self, reason: PrefilterReason) {
        match reason {
            PrefilterReason::Exchange => self.exchange += 1,
            PrefilterReason::Leveraged => self.leveraged += 1,
            PrefilterReason::Sector => self.sector += 1,
            PrefilterReason::Country => self.country += 1,
            PrefilterReason::NonPositivePrice => self.non_positive_price += 1,
            PrefilterReason::DeclineBand => self.decline_band += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.exchange + self.leveraged + self.sector + self.country + self.non_positive_price + self.decline_band
    }
}

fn is_leveraged(name: &str) -> bool {
    let upper = name.to_uppercase();
    upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .any(|word| LEVERAGED_TOKENS.contains(&word))
}

fn listed(value: Option<&str>, list: &[String]) -> bool {
    value.is_some_and(|v| list.iter().any(|x| x.eq_ignore_ascii_case(v)))
}

/// Decline from the cheap screener ATH, when the screener had one.
pub fn screener_decline_pct(c: &Candidate) -> Option<f64> {
    let ath = c.ath?;
    (ath > 0.0).then(|| (ath - c.close) / ath * 100.0)
}

pub fn ath_check(c: &Candidate, s: &AthSettings, allowed_exchanges: &[String]) -> Result<(), PrefilterReason> {
    if !allowed_exchanges.is_empty() && !listed(Some(&c.exchange), allowed_exchanges) {
        return Err(PrefilterReason::Exchange);
    }
    if is_leveraged(&c.name) {
        return Err(PrefilterReason::Leveraged);
    }
    if listed(c.sector.as_deref(), &s.excluded_sectors) {
        return Err(PrefilterReason::Sector);
    }
    if c.close <= 0.0 {
        return Err(PrefilterReason::NonPositivePrice);
    }
    if let Some(decline) = screener_decline_pct(c) {
        let lo = s.min_decline_pct - s.decline_slack_pct;
        let hi = s.max_decline_pct + s.decline_slack_pct;
        if decline < lo || decline > hi {
            return Err(PrefilterReason::DeclineBand);
        }
    }
    Ok(())
}

pub fn spike_check(c: &Candidate, s: &SpikeSettings) -> Result<(), PrefilterReason> {
    if listed(c.country.as_deref(), &s.excluded_countries) {
        return Err(PrefilterReason::Country);
    }
    if listed(c.sector.as_deref(), &s.excluded_sectors) {
        return Err(PrefilterReason::Sector);
    }
    Ok(())
}

/// Split `candidates` into survivors and per-reason drop counts.
pub fn apply<F>(candidates: Vec<Candidate>, check: F) -> (Vec<Candidate>, PrefilterStats)
where
    F: Fn(&Candidate) -> Result<(), PrefilterReason>,
{
    let mut stats = PrefilterStats::default();
    let kept = candidates
        .into_iter()
        .filter(|c| match check(c) {
            Ok(()) => true,
            Err(reason) => {
                stats.count(reason);
                false
            }
        })
        .collect();
    (kept, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, exchange: &str, close: f64, ath: Option<f64>) -> Candidate {
        Candidate {
            ticker: "X".to_string(),
            raw_symbol: format!("{exchange}:X"),
            name: name.to_string(),
            exchange: exchange.to_string(),
            market: "america".to_string(),
            close,
            high_52w: close * 2.0,
            low_52w: close / 2.0,
            ath,
            sector: Some("Health Technology".to_string()),
            country: Some("United States".to_string()),
            volume: None,
            avg_volume_30d: None,
            market_cap: None,
            sources: vec!["america".to_string()],
        }
    }

    #[test]
    fn ath_filter_reasons() {
        let s = AthSettings::default();
        let allowed = s.allowed_exchanges();
        let ok = candidate("Acme Biotech", "NASDAQ", 1.0, Some(20.0));
        assert_eq!(ath_check(&ok, &s, &allowed), Ok(()));

        let otc = candidate("Acme Biotech", "OTC", 1.0, Some(20.0));
        assert_eq!(ath_check(&otc, &s, &allowed), Err(PrefilterReason::Exchange));

        let lev = candidate("Direxion Daily Gold Miners Bull 2X", "AMEX", 1.0, Some(20.0));
        assert_eq!(ath_check(&lev, &s, &allowed), Err(PrefilterReason::Leveraged));

        let zero = candidate("Acme Biotech", "NYSE", 0.0, Some(20.0));
        assert_eq!(ath_check(&zero, &s, &allowed), Err(PrefilterReason::NonPositivePrice));
    }

    #[test]
    fn decline_band_has_slack_and_skips_missing_ath() {
        let s = AthSettings::default();
        let allowed = s.allowed_exchanges();
        // 75% decline: outside 80..99.9 but inside the 10-point slack.
        let near = candidate("Acme", "NYSE", 2.5, Some(10.0));
        assert_eq!(ath_check(&near, &s, &allowed), Ok(()));
        // 50% decline is well outside.
        let shallow = candidate("Acme", "NYSE", 5.0, Some(10.0));
        assert_eq!(ath_check(&shallow, &s, &allowed), Err(PrefilterReason::DeclineBand));
        let unknown = candidate("Acme", "NYSE", 5.0, None);
        assert_eq!(ath_check(&unknown, &s, &allowed), Ok(()));
    }

    #[test]
    fn excluded_sector_is_case_insensitive() {
        let s = AthSettings { excluded_sectors: vec!["health technology".to_string()], ..Default::default() };
        let c = candidate("Acme", "NYSE", 1.0, None);
        assert_eq!(ath_check(&c, &s, &s.allowed_exchanges()), Err(PrefilterReason::Sector));
    }

    #[test]
    fn spike_filter_only_looks_at_country_and_sector() {
        let s = SpikeSettings { excluded_countries: vec!["United States".to_string()], ..Default::default() };
        let c = candidate("Leveraged Bull 3X", "OTC", 0.0, Some(1.0));
        assert_eq!(spike_check(&c, &s), Err(PrefilterReason::Country));

        let open = SpikeSettings::default();
        assert_eq!(spike_check(&c, &open), Ok(()));
    }

    #[test]
    fn apply_counts_drops() {
        let s = AthSettings::default();
        let allowed = s.allowed_exchanges();
        let cands = vec![
            candidate("Acme", "NYSE", 1.0, None),
            candidate("Acme", "OTC", 1.0, None),
            candidate("Acme Ultra", "NYSE", 1.0, None),
        ];
        let (kept, stats) = apply(cands, |c| ath_check(c, &s, &allowed));
        assert_eq!(kept.len(), 1);
        assert_eq!(stats.exchange, 1);
        assert_eq!(stats.leveraged, 1);
        assert_eq!(stats.total(), 2);
    }
}
