//! Ticker normalization between the screener's `EXCHANGE:SYMBOL` form and the
//! symbols the price-history source resolves.

/// Screener exchange code → history symbol suffix.
const EXCHANGE_SUFFIXES: &[(&str, &str)] = &[
    // North America
    ("NYSE", ""),
    ("NASDAQ", ""),
    ("AMEX", ""),
    ("NYSE ARCA", ""),
    ("OTC", ""),
    ("TSX", ".TO"),
    ("TSXV", ".V"),
    ("CSE", ".CN"),
    ("NEO", ".NE"),
    ("BMV", ".MX"),
    // Europe
    ("LSE", ".L"),
    ("XETR", ".DE"),
    ("FWB", ".F"),
    ("EURONEXT", ".PA"),
    ("EPA", ".PA"),
    ("AMS", ".AS"),
    ("EBR", ".BR"),
    ("ELI", ".LS"),
    ("EURONEXTDUB", ".IR"),
    ("MIL", ".MI"),
    ("BME", ".MC"),
    ("SIX", ".SW"),
    ("OMXSTO", ".ST"),
    ("OMXHEX", ".HE"),
    ("OMXCOP", ".CO"),
    ("OMXICE", ".IC"),
    ("OSL", ".OL"),
    ("GPW", ".WA"),
    ("VIE", ".VI"),
    ("ATHEX", ".AT"),
    ("BIST", ".IS"),
    ("PSECZ", ".PR"),
    ("BET", ".BD"),
    // Asia-Pacific
    ("ASX", ".AX"),
    ("NZX", ".NZ"),
    ("HKEX", ".HK"),
    ("TSE", ".T"),
    ("KRX", ".KS"),
    ("KOSDAQ", ".KQ"),
    ("TWSE", ".TW"),
    ("TPEX", ".TWO"),
    ("SSE", ".SS"),
    ("SZSE", ".SZ"),
    ("NSE", ".NS"),
    ("BSE", ".BO"),
    ("SGX", ".SI"),
    ("MYX", ".KL"),
    ("SET", ".BK"),
    ("IDX", ".JK"),
    // Rest of world
    ("BMFBOVESPA", ".SA"),
    ("JSE", ".JO"),
    ("TASE", ".TA"),
    ("TADAWUL", ".SR"),
    ("QSE", ".QA"),
];

/// Status markers appended by venues (halted, preferred, rights).
const STATUS_MARKERS: &[&str] = &[".PR", "/PR", "_PR", "-PR", ".RT", "/RT", "-RT"];

/// Whole-word markers of instruments that are not common equity.
const EXCLUDED_NAME_TOKENS: &[&str] = &[
    "ETF", "ETFS", "ETN", "ETNS", "ETP", "FUND", "FUNDS", "WARRANT", "WARRANTS", "WT", "WTS",
    "ADR", "ADRS", "GDR", "GDRS", "DEPOSITARY", "DEPOSITORY", "RIGHTS", "UNITS",
];

/// Screener instrument types dropped outright.
const EXCLUDED_TYPES: &[&str] = &["fund", "dr", "structured", "warrant", "right"];

pub fn history_suffix(exchange: &str) -> Option<&'static str> {
    let exchange = exchange.trim().to_uppercase();
    EXCHANGE_SUFFIXES
        .iter()
        .find(|(code, _)| *code == exchange)
        .map(|(_, suffix)| *suffix)
}

/// Strip halted (`.H`), preferred and rights markers.
pub fn strip_status_suffix(symbol: &str) -> &str {
    let mut s = symbol.trim();
    if let Some(base) = s.strip_suffix(".H") {
        s = base;
    }
    for marker in STATUS_MARKERS {
        if let Some(pos) = s.find(marker) {
            if pos > 0 {
                s = &s[..pos];
            }
        }
    }
    if let Some(base) = s.strip_suffix(".R") {
        if !base.is_empty() {
            s = base;
        }
    }
    s.trim_end_matches(['.', '-', '/'])
}

/// `("TSX", "ABC.B")` → `Some("ABC-B.TO")`. `None` when the exchange is not
/// in the suffix table or nothing is left after stripping.
pub fn normalize_ticker(exchange: &str, symbol: &str) -> Option<String> {
    let suffix = history_suffix(exchange)?;
    let base = strip_status_suffix(symbol).to_uppercase();
    if base.is_empty() {
        return None;
    }
    let mut base: String = base
        .chars()
        .map(|c| if c == '.' || c == '/' || c == '_' { '-' } else { c })
        .collect();
    // History source pads Hong Kong codes to four digits.
    if suffix == ".HK" && base.chars().all(|c| c.is_ascii_digit()) && base.len() < 4 {
        base = format!("{base:0>4}");
    }
    Some(format!("{base}{suffix}"))
}

/// Split `EXCHANGE:SYMBOL`. A bare symbol yields an empty exchange.
pub fn split_symbol(full: &str) -> (&str, &str) {
    match full.split_once(':') {
        Some((exchange, symbol)) => (exchange, symbol),
        None => ("", full),
    }
}

/// ETF / fund / warrant / rights / trust-unit / depositary-receipt detection
/// by name and type.
pub fn is_excluded_instrument(name: &str, instrument_type: Option<&str>) -> bool {
    if let Some(t) = instrument_type {
        let t = t.to_lowercase();
        if EXCLUDED_TYPES.contains(&t.as_str()) {
            return true;
        }
    }
    name.to_uppercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|tok| EXCLUDED_NAME_TOKENS.contains(&tok))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn us_class_share_uses_dash() {
        assert_eq!(normalize_ticker("NYSE", "BRK.B").as_deref(), Some("BRK-B"));
        assert_eq!(normalize_ticker("NASDAQ", "AAPL").as_deref(), Some("AAPL"));
    }

    #[test]
    fn venue_suffix_applied() {
        assert_eq!(normalize_ticker("TSX", "SHOP").as_deref(), Some("SHOP.TO"));
        assert_eq!(normalize_ticker("LSE", "BP.").as_deref(), Some("BP.L"));
        assert_eq!(normalize_ticker("hkex", "700").as_deref(), Some("0700.HK"));
    }

    #[test]
    fn status_suffixes_stripped() {
        assert_eq!(normalize_ticker("TSXV", "ABC.H").as_deref(), Some("ABC.V"));
        assert_eq!(normalize_ticker("NYSE", "XYZ.PRA").as_deref(), Some("XYZ"));
        assert_eq!(normalize_ticker("NYSE", "XYZ/PR/B").as_deref(), Some("XYZ"));
        assert_eq!(normalize_ticker("TSX", "QQQ.RT").as_deref(), Some("QQQ.TO"));
    }

    #[test]
    fn unknown_exchange_is_unresolvable() {
        assert!(normalize_ticker("MOON", "ABC").is_none());
    }

    #[test]
    fn table_covers_about_forty_exchanges() {
        assert!(EXCHANGE_SUFFIXES.len() >= 40);
    }

    #[test]
    fn excluded_instruments() {
        assert!(is_excluded_instrument("iShares Core S&P 500 ETF", None));
        assert!(is_excluded_instrument("Acme Corp Warrants", None));
        assert!(is_excluded_instrument("Banco Foo ADR", None));
        assert!(is_excluded_instrument("Plain Name", Some("fund")));
        assert!(!is_excluded_instrument("Fundamental Mining Inc", Some("stock")));
        assert!(!is_excluded_instrument("Etfield Corp", None));
        assert!(is_excluded_instrument("Acme Mining Rights", Some("stock")));
        assert!(is_excluded_instrument("Brookfield Office Trust Units", Some("stock")));
        assert!(is_excluded_instrument("Acme Units", Some("stock")));
        assert!(!is_excluded_instrument("Bright Horizons Family Solutions", Some("stock")));
        assert!(!is_excluded_instrument("Unit Corp", Some("stock")));
    }
}
