pub mod ath;
pub mod prefilter;
pub mod rotation;
pub mod run_log;
pub mod service;
pub mod spike;
pub mod worker;

use std::sync::Arc;

use crate::fetcher::{HistorySource, QuoteSource, ScreenerApi};
use crate::types::Rejection;

pub use ath::AthScanner;
pub use service::ScanService;
pub use spike::SpikeScanner;

/// Upstream handles, one instance of each per process.
#[derive(Clone)]
pub struct Sources {
    pub screener: Arc<dyn ScreenerApi>,
    pub history: Arc<dyn HistorySource>,
    pub quotes: Arc<dyn QuoteSource>,
}

/// Outcome of one ticker's deep scan that is not an error.
#[derive(Debug)]
pub enum Verdict<M> {
    Matched(Box<M>),
    Rejected(Rejection),
}
