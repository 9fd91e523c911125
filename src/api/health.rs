//! Shared health state for the /health endpoint.
//! Updated by the scan service as runs start and finish.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::ScanStatus;

/// Process-lifetime run counters. Updated by the scan service, read by the API.
#[derive(Default)]
pub struct HealthState {
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_partial: AtomicU64,
    pub runs_failed: AtomicU64,
    /// Unix ms of the last terminal run (0 = none yet).
    pub last_finished_at_ms: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_partial: u64,
    pub runs_failed: u64,
    pub last_finished_at_ms: Option<u64>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_finished(&self, status: ScanStatus, at_ms: u64) {
        let counter = match status {
            ScanStatus::Completed => &self.runs_completed,
            ScanStatus::Partial => &self.runs_partial,
            ScanStatus::Failed | ScanStatus::Running => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_finished_at_ms.store(at_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last = self.last_finished_at_ms.load(Ordering::Relaxed);
        HealthSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_partial: self.runs_partial.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            last_finished_at_ms: (last > 0).then_some(last),
        }
    }
}
