use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::db::models::ScanHistoryRow;
use crate::types::Candidate;

/// Never-scanned tickers first, shuffled; then previously scanned ones,
/// least recently scanned first. Ties keep ticker order.
pub fn prioritize<R: Rng + ?Sized>(
    candidates: Vec<Candidate>,
    history: &HashMap<String, ScanHistoryRow>,
    rng: &mut R,
) -> Vec<Candidate> {
    let (mut fresh, mut seen): (Vec<Candidate>, Vec<Candidate>) =
        candidates.into_iter().partition(|c| !history.contains_key(&c.ticker));

    fresh.shuffle(rng);
    seen.sort_by_key(|c| {
        let at = history.get(&c.ticker).map(|h| h.last_scanned_at).unwrap_or(i64::MIN);
        (at, c.ticker.clone())
    });

    fresh.extend(seen);
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn candidate(ticker: &str) -> Candidate {
        Candidate {
            ticker: ticker.to_string(),
            raw_symbol: ticker.to_string(),
            name: ticker.to_string(),
            exchange: "NYSE".to_string(),
            market: "america".to_string(),
            close: 1.0,
            high_52w: 2.0,
            low_52w: 0.5,
            ath: None,
            sector: None,
            country: None,
            volume: None,
            avg_volume_30d: None,
            market_cap: None,
            sources: Vec::new(),
        }
    }

    fn row(ticker: &str, at: i64) -> (String, ScanHistoryRow) {
        (
            ticker.to_string(),
            ScanHistoryRow {
                ticker: ticker.to_string(),
                last_scanned_at: at,
                scan_count: 1,
                last_result: "rejected".to_string(),
            },
        )
    }

    fn order(out: &[Candidate]) -> Vec<&str> {
        out.iter().map(|c| c.ticker.as_str()).collect()
    }

    #[test]
    fn never_scanned_before_oldest_before_newest() {
        let history: HashMap<_, _> = [row("B", 1_000), row("C", 2_000)].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(7);
        let out = prioritize(vec![candidate("C"), candidate("B"), candidate("A")], &history, &mut rng);
        assert_eq!(order(&out), vec!["A", "B", "C"]);
    }

    #[test]
    fn fresh_tickers_are_shuffled_but_stay_ahead() {
        let history: HashMap<_, _> = [row("OLD", 5)].into_iter().collect();
        let fresh: Vec<String> = (0..20).map(|i| format!("N{i:02}")).collect();
        let mut input: Vec<Candidate> = vec![candidate("OLD")];
        input.extend(fresh.iter().map(|t| candidate(t)));

        let mut rng = StdRng::seed_from_u64(42);
        let out = prioritize(input, &history, &mut rng);
        assert_eq!(out.len(), 21);
        assert_eq!(out.last().map(|c| c.ticker.as_str()), Some("OLD"));

        let head: Vec<&str> = order(&out[..20]);
        let sorted: Vec<&str> = fresh.iter().map(String::as_str).collect();
        assert_ne!(head, sorted, "20 fresh tickers should not come back in input order");
    }

    #[test]
    fn same_seed_same_order() {
        let history = HashMap::new();
        let input: Vec<Candidate> = (0..10).map(|i| candidate(&format!("T{i}"))).collect();
        let a = prioritize(input.clone(), &history, &mut StdRng::seed_from_u64(1));
        let b = prioritize(input, &history, &mut StdRng::seed_from_u64(1));
        assert_eq!(order(&a), order(&b));
    }
}
